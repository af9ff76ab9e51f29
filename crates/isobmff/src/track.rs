//! Per-track state assembled while parsing the movie box.

use std::sync::OnceLock;

use demux::TrackInfo;
use media_types::TrackKind;

use crate::index::SampleIndex;

/// How many leading sync samples the thumbnail heuristic considers.
const THUMBNAIL_SYNC_CANDIDATES: usize = 20;

/// One parsed track: immutable description plus its sample index.
///
/// The index is `None` for fragmented-only tracks, whose samples are
/// enumerated per fragment instead.
pub struct Track {
    pub info: TrackInfo,
    pub index: Option<SampleIndex>,
    /// Initial edit-list media time in media-timescale ticks, applied as a
    /// presentation offset.
    pub edit_media_time_ticks: i64,
    thumbnail_us: OnceLock<Option<i64>>,
}

impl Track {
    pub fn new(info: TrackInfo, index: Option<SampleIndex>, edit_media_time_ticks: i64) -> Self {
        Self {
            info,
            index,
            edit_media_time_ticks,
            thumbnail_us: OnceLock::new(),
        }
    }

    /// Timestamp of the sync sample best suited as a thumbnail: the largest
    /// of the first few sync samples (bigger keyframes tend to carry more
    /// detail). Computed once, on first request.
    pub fn thumbnail_time_us(&self) -> Option<i64> {
        *self.thumbnail_us.get_or_init(|| {
            if self.info.kind != TrackKind::Video {
                return None;
            }
            let index = self.index.as_ref()?;
            let mut best: Option<(u32, usize)> = None;
            let mut seen = 0;
            for i in 0..index.len() {
                let meta = index.get(i)?;
                if !meta.is_sync {
                    continue;
                }
                if best.is_none_or(|(size, _)| meta.size > size) {
                    best = Some((meta.size, i));
                }
                seen += 1;
                if seen >= THUMBNAIL_SYNC_CANDIDATES {
                    break;
                }
            }
            best.and_then(|(_, i)| index.decode_time_us(i))
        })
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::index::SampleMeta;
    use media_types::{Rotation, TimeBase, mime};

    fn video_info() -> TrackInfo {
        TrackInfo {
            id: 1,
            mime: mime::VIDEO_AVC.to_string(),
            kind: TrackKind::Video,
            time_base: TimeBase::new(1000).unwrap(),
            duration_us: None,
            language: None,
            resolution: None,
            display_resolution: None,
            rotation: Rotation::R0,
            sample_rate: None,
            channel_count: None,
            codec_configs: Vec::new(),
            encryption: None,
            sample_count: 3,
        }
    }

    #[test]
    fn test_thumbnail_prefers_largest_early_sync() {
        let entries = vec![
            SampleMeta {
                offset: 0,
                size: 100,
                decode_ticks: 0,
                duration_ticks: 10,
                cts_offset_ticks: 0,
                is_sync: true,
            },
            SampleMeta {
                offset: 100,
                size: 900,
                decode_ticks: 10,
                duration_ticks: 10,
                cts_offset_ticks: 0,
                is_sync: false,
            },
            SampleMeta {
                offset: 1000,
                size: 500,
                decode_ticks: 20,
                duration_ticks: 10,
                cts_offset_ticks: 0,
                is_sync: true,
            },
        ];
        let index = SampleIndex::new(TimeBase::new(1000).unwrap(), entries).unwrap();
        let track = Track::new(video_info(), Some(index), 0);
        // Sync at t=20ms (size 500) beats sync at t=0 (size 100); the
        // non-sync sample is ignored.
        assert_eq!(track.thumbnail_time_us(), Some(20_000));
        // Second call returns the cached value.
        assert_eq!(track.thumbnail_time_us(), Some(20_000));
    }

    #[test]
    fn test_thumbnail_none_for_audio() {
        let mut info = video_info();
        info.kind = TrackKind::Audio;
        let track = Track::new(info, None, 0);
        assert_eq!(track.thumbnail_time_us(), None);
    }
}
