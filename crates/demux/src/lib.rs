//! # Demux Core
//!
//! Core abstractions shared by every container demuxer in the workspace:
//!
//! - [`ByteSource`]: random-access byte-range reader (file, memory, or a
//!   caching facade over a still-arriving stream).
//! - [`MediaExtractor`] / [`TrackReader`]: a parsed container exposing its
//!   track registry and per-track pull readers.
//! - [`TrackSource`]: the reader the playback layer consumes, adding one-shot
//!   seek options, empty-sample skipping and NAL re-slicing on top of a
//!   `TrackReader`.
//! - [`Probe`]: format-sniffing dispatcher that matches a source's leading
//!   bytes against registered format recognizers.

mod cache;
mod error;
mod extractor;
mod options;
mod probe;
mod sample;
mod source;
mod track_source;

pub use cache::CachingSource;
pub use error::DemuxError;
pub use extractor::{
    CodecConfig, FileMetadata, MediaExtractor, TrackEncryption, TrackInfo, TrackReader,
};
pub use options::{ReadOptions, SeekMode, SeekTarget};
pub use probe::{FormatDescriptor, Probe};
pub use sample::{CryptoInfo, Sample, Subsample};
pub use source::{ByteSource, CacheStatus, FileSource, MemorySource, read_bytes_at, read_exact_at};
pub use track_source::{NalMode, TrackSource};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DemuxError>;
