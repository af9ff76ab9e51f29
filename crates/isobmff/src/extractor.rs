//! [`MediaExtractor`] implementation over the parsed box tree, with pull
//! readers for both the indexed (monolithic) and fragmented read paths.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use demux::{
    ByteSource, DemuxError, FileMetadata, FormatDescriptor, MediaExtractor, ReadOptions, Result,
    Sample, SeekMode, TrackInfo, TrackReader, read_bytes_at,
};
use media_types::TimeBase;

use crate::boxes::decode_header;
use crate::frag::{FragmentSample, FragmentScanner, TrexDefaults};
use crate::index::SampleIndex;
use crate::parser::{self, ParsedFile};
use crate::sidx::SegmentIndex;
use crate::track::Track;

/// ISO-BMFF extractor: track registry plus reader construction.
pub struct IsobmffExtractor {
    source: Arc<dyn ByteSource>,
    parsed: ParsedFile,
    infos: Vec<TrackInfo>,
}

impl IsobmffExtractor {
    /// Run the structural parse and build the registry.
    pub fn read(source: Arc<dyn ByteSource>) -> Result<Self> {
        let parsed = parser::parse(&source)?;
        let infos = parsed.tracks.iter().map(|t| t.info.clone()).collect();
        Ok(Self {
            source,
            parsed,
            infos,
        })
    }

    pub fn is_fragmented(&self) -> bool {
        self.parsed.fragmented
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.parsed.tracks.get(index)
    }

    /// Probe-registry descriptor for this format.
    pub fn descriptor() -> FormatDescriptor {
        FormatDescriptor {
            name: "isobmff",
            score: score_header,
            instantiate: |source| Ok(Box::new(IsobmffExtractor::read(source)?)),
        }
    }
}

fn score_header(header: &[u8]) -> u8 {
    match decode_header(header) {
        Some(h) => match h.fourcc.as_bytes() {
            b"ftyp" | b"styp" => 100,
            b"moov" | b"moof" | b"sidx" => 80,
            b"free" | b"skip" | b"wide" | b"mdat" => 40,
            _ => 0,
        },
        None => 0,
    }
}

impl MediaExtractor for IsobmffExtractor {
    fn metadata(&self) -> &FileMetadata {
        &self.parsed.metadata
    }

    fn tracks(&self) -> &[TrackInfo] {
        &self.infos
    }

    fn open_track(&self, index: usize) -> Result<Box<dyn TrackReader>> {
        let track = self
            .parsed
            .tracks
            .get(index)
            .ok_or_else(|| DemuxError::unsupported(format!("no track at index {index}")))?;

        let reader: Box<dyn TrackReader> = if self.parsed.fragmented {
            let iv_size = track
                .info
                .encryption
                .as_ref()
                .map_or(0, |e| e.default_iv_size);
            let trex = self
                .parsed
                .trex
                .iter()
                .find(|t| t.track_id == track.info.id)
                .copied();
            let start = self.parsed.first_moof_offset.unwrap_or(0);
            Box::new(FragmentedReader::new(
                Arc::clone(&self.source),
                track,
                trex,
                iv_size,
                start,
                self.parsed.sidx.clone(),
            ))
        } else {
            let index = track
                .index
                .clone()
                .ok_or_else(|| DemuxError::malformed("track has no sample index"))?;
            Box::new(IndexedReader::new(Arc::clone(&self.source), track, index))
        };
        Ok(reader)
    }

    fn thumbnail_time_us(&self, index: usize) -> Option<i64> {
        self.parsed.tracks.get(index)?.thumbnail_time_us()
    }
}

/// Reader over a fully-indexed (non-fragmented) track.
struct IndexedReader {
    source: Arc<dyn ByteSource>,
    track_id: u32,
    time_base: TimeBase,
    edit_media_time_ticks: i64,
    index: SampleIndex,
    cursor: usize,
    /// Target time to attach to the next emitted sample (closest-mode seek).
    pending_target_us: Option<i64>,
}

impl IndexedReader {
    fn new(source: Arc<dyn ByteSource>, track: &Track, index: SampleIndex) -> Self {
        Self {
            source,
            track_id: track.info.id,
            time_base: track.info.time_base,
            edit_media_time_ticks: track.edit_media_time_ticks,
            index,
            cursor: 0,
            pending_target_us: None,
        }
    }

    fn apply_seek(&mut self, time_us: i64, mode: SeekMode) {
        if let Some(resolution) = self.index.find_by_time(time_us, mode) {
            self.cursor = resolution.start_index;
            self.pending_target_us = resolution.target_time_us;
            debug!(
                track = self.track_id,
                time_us,
                start = resolution.start_index,
                target = ?resolution.target_time_us,
                "applied indexed seek"
            );
        }
    }
}

impl TrackReader for IndexedReader {
    fn next_sample(&mut self, options: &ReadOptions) -> Result<Sample> {
        if let Some(seek) = options.seek {
            self.apply_seek(seek.time_us, seek.mode);
        }

        let Some(meta) = self.index.get(self.cursor).copied() else {
            return Err(DemuxError::EndOfStream);
        };

        if options.non_blocking
            && !self.source.is_local()
            && !self
                .source
                .cache_status()
                .covers(meta.offset, meta.size as u64)
        {
            return Err(DemuxError::WouldBlock);
        }

        let data = read_bytes_at(self.source.as_ref(), meta.offset, meta.size as usize)?;
        let decode_time_us = self.time_base.ticks_to_us(meta.decode_ticks);
        let presentation_ticks =
            meta.decode_ticks as i64 + meta.cts_offset_ticks as i64 - self.edit_media_time_ticks;
        let sample = Sample {
            track_id: self.track_id,
            data,
            decode_time_us,
            presentation_time_us: self.time_base.ticks_to_us_signed(presentation_ticks),
            duration_us: self.time_base.ticks_to_us(meta.duration_ticks as u64),
            is_sync: meta.is_sync,
            target_time_us: self.pending_target_us.take(),
            crypto: None,
        };
        self.cursor += 1;
        Ok(sample)
    }
}

/// Reader over a fragmented track: forward fragment scanning with on-demand
/// batch parsing.
struct FragmentedReader {
    source: Arc<dyn ByteSource>,
    track_id: u32,
    time_base: TimeBase,
    scanner: FragmentScanner,
    batch: VecDeque<FragmentSample>,
    sidx: Option<SegmentIndex>,
    first_moof_offset: u64,
    pending_target_us: Option<i64>,
}

impl FragmentedReader {
    fn new(
        source: Arc<dyn ByteSource>,
        track: &Track,
        trex: Option<TrexDefaults>,
        iv_size: u8,
        first_moof_offset: u64,
        sidx: Option<SegmentIndex>,
    ) -> Self {
        Self {
            source,
            track_id: track.info.id,
            time_base: track.info.time_base,
            scanner: FragmentScanner::new(track.info.id, trex, iv_size, first_moof_offset),
            batch: VecDeque::new(),
            sidx,
            first_moof_offset,
            pending_target_us: None,
        }
    }

    /// Fragmented seek: a segment index gives a direct byte offset via a
    /// cumulative-duration walk; without one, seeking degrades to a restart
    /// from the first fragment.
    fn apply_seek(&mut self, time_us: i64) {
        self.batch.clear();
        match self.sidx.as_ref().and_then(|s| s.locate(time_us)) {
            Some(location) => {
                let offset = self.first_moof_offset + location.byte_offset;
                let start_ticks = self.time_base.us_to_ticks(location.start_us);
                debug!(
                    track = self.track_id,
                    time_us, offset, "sidx seek to fragment"
                );
                self.scanner.reset_to(offset, start_ticks);
            }
            None => {
                debug!(track = self.track_id, "no segment index, restarting at first fragment");
                self.scanner.reset_to(self.first_moof_offset, 0);
            }
        }
        self.pending_target_us = None;
    }
}

impl TrackReader for FragmentedReader {
    fn next_sample(&mut self, options: &ReadOptions) -> Result<Sample> {
        if let Some(seek) = options.seek {
            self.apply_seek(seek.time_us);
        }

        if self.batch.is_empty() {
            if options.non_blocking
                && !self.source.is_local()
                && !self.source.cache_status().covers(self.scanner.position(), 16)
            {
                return Err(DemuxError::WouldBlock);
            }
            match self.scanner.next_batch(self.source.as_ref())? {
                Some(batch) => self.batch = batch.samples.into(),
                None => return Err(DemuxError::EndOfStream),
            }
        }

        let Some(meta) = self.batch.front().cloned() else {
            return Err(DemuxError::EndOfStream);
        };
        if options.non_blocking
            && !self.source.is_local()
            && !self
                .source
                .cache_status()
                .covers(meta.offset, meta.size as u64)
        {
            return Err(DemuxError::WouldBlock);
        }
        self.batch.pop_front();

        let data: Bytes = read_bytes_at(self.source.as_ref(), meta.offset, meta.size as usize)?;
        Ok(Sample {
            track_id: self.track_id,
            data,
            decode_time_us: self.time_base.ticks_to_us(meta.decode_ticks),
            presentation_time_us: self
                .time_base
                .ticks_to_us_signed(meta.decode_ticks as i64 + meta.cts_offset_ticks as i64),
            duration_us: self.time_base.ticks_to_us(meta.duration_ticks as u64),
            is_sync: meta.is_sync,
            target_time_us: self.pending_target_us.take(),
            crypto: meta.crypto,
        })
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_score_header() {
        let mut data = 16u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(&[0u8; 8]);
        assert_eq!(score_header(&data), 100);

        let mut data = 16u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"moov");
        assert_eq!(score_header(&data), 80);

        assert_eq!(score_header(b"not a box at all"), 0);
        assert_eq!(score_header(&[]), 0);
    }
}
