use bytes::Bytes;
use media_types::{Resolution, Rotation, TimeBase, TrackKind};

use crate::options::ReadOptions;
use crate::sample::Sample;
use crate::Result;

/// A codec-specific configuration blob (decoder configuration record,
/// elementary stream descriptor, ...), keyed by its conventional name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    pub key: &'static str,
    pub data: Bytes,
}

/// Default encryption parameters for a protected track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEncryption {
    /// Protection scheme FourCC as text (`cenc`, `cbcs`, ...).
    pub scheme: String,
    /// `is_encrypted` field of the track-encryption box.
    pub default_is_encrypted: bool,
    /// Per-sample IV size in bytes; only 0, 8 and 16 are valid.
    pub default_iv_size: u8,
    pub key_id: [u8; 16],
}

/// Immutable description of one elementary stream within a container.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Container-assigned track identifier, unique within the file.
    pub id: u32,
    pub mime: String,
    pub kind: TrackKind,
    pub time_base: TimeBase,
    pub duration_us: Option<i64>,
    /// ISO-639-2 language tag, when present.
    pub language: Option<String>,
    /// Coded resolution for video tracks.
    pub resolution: Option<Resolution>,
    /// Display (aspect-corrected) resolution, when it differs.
    pub display_resolution: Option<Resolution>,
    pub rotation: Rotation,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u16>,
    pub codec_configs: Vec<CodecConfig>,
    pub encryption: Option<TrackEncryption>,
    pub sample_count: u64,
}

impl TrackInfo {
    pub fn codec_config(&self, key: &str) -> Option<&Bytes> {
        self.codec_configs
            .iter()
            .find(|c| c.key == key)
            .map(|c| &c.data)
    }
}

/// File-level metadata record.
#[derive(Debug, Clone, Default)]
pub struct FileMetadata {
    /// Major brand of the file-type box, as text.
    pub brand: Option<String>,
    pub duration_us: Option<i64>,
    /// iTunes-style key/value tags (title, artist, album, ...).
    pub tags: Vec<(String, String)>,
    /// Geographic location string, when present.
    pub location: Option<String>,
}

/// A parsed container: track registry plus per-track reader construction.
///
/// Implementations are immutable after construction except for lazily
/// computed metadata (e.g. thumbnail timestamps).
pub trait MediaExtractor: Send + Sync {
    fn metadata(&self) -> &FileMetadata;

    fn tracks(&self) -> &[TrackInfo];

    /// Open a pull reader for the track at `index` in the registry.
    fn open_track(&self, index: usize) -> Result<Box<dyn TrackReader>>;

    /// Timestamp of the best sync sample to use as a thumbnail for a video
    /// track; computed on first request.
    fn thumbnail_time_us(&self, _index: usize) -> Option<i64> {
        None
    }
}

/// Pull-based compressed-sample reader for one track.
pub trait TrackReader: Send {
    /// Read the next sample, honoring any one-shot seek in `options`.
    ///
    /// Returns `DemuxError::EndOfStream` past the last sample and
    /// `DemuxError::WouldBlock` when `options.non_blocking` is set and the
    /// sample's byte range is not cached yet.
    fn next_sample(&mut self, options: &ReadOptions) -> Result<Sample>;
}
