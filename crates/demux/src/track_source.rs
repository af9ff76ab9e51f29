use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::extractor::{MediaExtractor, TrackInfo, TrackReader};
use crate::options::{ReadOptions, SeekMode, SeekTarget};
use crate::sample::Sample;
use crate::{DemuxError, Result};

/// How NAL-structured samples (length-prefixed unit sequences) are surfaced.
///
/// One configuration switch, not separate read paths: `SplitUnits` re-slices
/// a sample into successive per-unit reads, `StartCodes` rewrites the length
/// prefixes to Annex-B start codes in one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NalMode {
    /// Return the sample payload as stored.
    #[default]
    Whole,
    /// Return each length-prefixed unit as its own sample.
    SplitUnits,
    /// Rewrite length prefixes with `00 00 00 01` start codes.
    StartCodes,
}

/// Pull-based sample reader for one selected track.
///
/// Adds to the raw [`TrackReader`]: a one-shot seek instruction applied on
/// the next read, silent skipping of zero-length samples from defective
/// encoders, and optional NAL re-slicing.
pub struct TrackSource {
    reader: Box<dyn TrackReader>,
    info: TrackInfo,
    nal_mode: NalMode,
    nal_length_size: Option<usize>,
    queued_units: VecDeque<Sample>,
    pending_seek: Option<SeekTarget>,
}

impl TrackSource {
    pub fn open(extractor: &dyn MediaExtractor, index: usize) -> Result<Self> {
        let info = extractor
            .tracks()
            .get(index)
            .cloned()
            .ok_or_else(|| DemuxError::unsupported(format!("no track at index {index}")))?;
        let reader = extractor.open_track(index)?;
        let nal_length_size = nal_length_size_from_config(&info);
        Ok(Self {
            reader,
            info,
            nal_mode: NalMode::Whole,
            nal_length_size,
            queued_units: VecDeque::new(),
            pending_seek: None,
        })
    }

    pub fn with_nal_mode(mut self, mode: NalMode) -> Self {
        self.nal_mode = mode;
        self
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    /// Arm a one-shot seek applied by the next `read_sample` call. Replaces
    /// any previously armed seek and drops queued NAL units.
    pub fn seek_to(&mut self, time_us: i64, mode: SeekMode) {
        self.pending_seek = Some(SeekTarget { time_us, mode });
        self.queued_units.clear();
    }

    pub fn has_pending_seek(&self) -> bool {
        self.pending_seek.is_some()
    }

    /// Read one sample (or one NAL unit in `SplitUnits` mode).
    pub fn read_sample(&mut self, non_blocking: bool) -> Result<Sample> {
        if let Some(unit) = self.queued_units.pop_front() {
            return Ok(unit);
        }

        let mut options = ReadOptions {
            seek: self.pending_seek.take(),
            non_blocking,
        };

        let sample = loop {
            match self.reader.next_sample(&options) {
                Ok(sample) if sample.is_empty() => {
                    // Defective encoders emit zero-length samples; skip them
                    // without re-applying the seek.
                    trace!(track = self.info.id, "skipping zero-length sample");
                    options.seek = None;
                    continue;
                }
                Ok(sample) => break sample,
                Err(DemuxError::WouldBlock) => {
                    // Re-arm the seek so it is not lost across the retry.
                    self.pending_seek = options.seek;
                    return Err(DemuxError::WouldBlock);
                }
                Err(e) => return Err(e),
            }
        };

        match self.nal_mode {
            NalMode::Whole => Ok(sample),
            NalMode::SplitUnits => self.split_units(sample),
            NalMode::StartCodes => rewrite_start_codes(sample, self.nal_length_size),
        }
    }

    fn split_units(&mut self, sample: Sample) -> Result<Sample> {
        let Some(prefix_len) = self.nal_length_size else {
            return Ok(sample);
        };

        let data = sample.data.as_ref();
        let mut pos = 0usize;
        let mut first: Option<Sample> = None;
        while pos < data.len() {
            let unit_len = read_be_length(data, pos, prefix_len).ok_or_else(|| {
                DemuxError::malformed("NAL length prefix overruns sample payload")
            })?;
            let start = pos + prefix_len;
            let end = start
                .checked_add(unit_len)
                .filter(|&e| e <= data.len())
                .ok_or_else(|| DemuxError::malformed("NAL unit overruns sample payload"))?;

            let unit = Sample {
                data: sample.data.slice(start..end),
                // Only the head of the sample carries the seek target.
                target_time_us: if first.is_none() {
                    sample.target_time_us
                } else {
                    None
                },
                crypto: None,
                ..sample.clone()
            };
            if first.is_none() {
                first = Some(unit);
            } else {
                self.queued_units.push_back(unit);
            }
            pos = end;
        }

        first.ok_or_else(|| DemuxError::malformed("NAL sample contains no units"))
    }
}

/// Decoder-configuration records carry the NAL length-prefix size; AVC keeps
/// it in byte 4, HEVC in byte 21 (low two bits, minus one).
fn nal_length_size_from_config(info: &TrackInfo) -> Option<usize> {
    if let Some(avcc) = info.codec_config("avcC") {
        return avcc.get(4).map(|b| ((b & 0x03) + 1) as usize);
    }
    if let Some(hvcc) = info.codec_config("hvcC") {
        return hvcc.get(21).map(|b| ((b & 0x03) + 1) as usize);
    }
    None
}

fn read_be_length(data: &[u8], pos: usize, prefix_len: usize) -> Option<usize> {
    if pos + prefix_len > data.len() {
        return None;
    }
    let mut value = 0usize;
    for &b in &data[pos..pos + prefix_len] {
        value = (value << 8) | b as usize;
    }
    Some(value)
}

fn rewrite_start_codes(sample: Sample, nal_length_size: Option<usize>) -> Result<Sample> {
    let Some(prefix_len) = nal_length_size else {
        return Ok(sample);
    };

    let data = sample.data.as_ref();
    let mut out = BytesMut::with_capacity(data.len() + 16);
    let mut pos = 0usize;
    while pos < data.len() {
        let unit_len = read_be_length(data, pos, prefix_len)
            .ok_or_else(|| DemuxError::malformed("NAL length prefix overruns sample payload"))?;
        let start = pos + prefix_len;
        let end = start
            .checked_add(unit_len)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| DemuxError::malformed("NAL unit overruns sample payload"))?;
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(&data[start..end]);
        pos = end;
    }

    Ok(Sample {
        data: out.freeze(),
        ..sample
    })
}
