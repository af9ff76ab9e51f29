//! Segment index (`sidx`) parsing and coarse byte-offset seeking for
//! fragmented streams.

use demux::{DemuxError, Result};
use media_types::TimeBase;

use crate::boxes::{field, full_box};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidxReference {
    /// Referenced segment size in bytes.
    pub size: u32,
    /// Segment duration in sidx timescale ticks.
    pub duration_ticks: u32,
    /// True when the reference points at another `sidx` rather than media.
    pub is_index: bool,
}

/// Parsed segment index: coarse (duration, byte-size) pairs enabling direct
/// fragment seeks without a forward scan.
#[derive(Debug, Clone)]
pub struct SegmentIndex {
    pub time_base: TimeBase,
    pub earliest_pts_ticks: u64,
    /// Distance from the end of this box to the first referenced segment.
    pub first_offset: u64,
    pub references: Vec<SidxReference>,
}

/// Where a coarse seek landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidxLocation {
    pub entry_index: usize,
    /// Byte distance from the index anchor (the first fragment's offset) to
    /// the located segment.
    pub byte_offset: u64,
    /// Presentation time where the located segment starts.
    pub start_us: i64,
}

impl SegmentIndex {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let (header, payload) = full_box(body)?;

        let timescale = field::u32_at(payload, 4)?;
        let time_base = TimeBase::new(timescale)
            .ok_or_else(|| DemuxError::malformed("sidx timescale is zero"))?;

        let (earliest_pts_ticks, first_offset, mut at) = if header.version == 0 {
            (
                field::u32_at(payload, 8)? as u64,
                field::u32_at(payload, 12)? as u64,
                16,
            )
        } else {
            (field::u64_at(payload, 8)?, field::u64_at(payload, 16)?, 24)
        };

        // 2 reserved bytes, then the reference count.
        let reference_count = field::u16_at(payload, at + 2)? as usize;
        at += 4;

        let mut references = Vec::with_capacity(reference_count.min(4096));
        for _ in 0..reference_count {
            let head = field::u32_at(payload, at)?;
            let duration_ticks = field::u32_at(payload, at + 4)?;
            references.push(SidxReference {
                size: head & 0x7FFF_FFFF,
                duration_ticks,
                is_index: head & 0x8000_0000 != 0,
            });
            // Skip the SAP fields.
            at += 12;
        }

        Ok(Self {
            time_base,
            earliest_pts_ticks,
            first_offset,
            references,
        })
    }

    /// Cumulative-duration walk locating the segment covering `time_us`.
    ///
    /// Times at or past the end land on the last segment.
    pub fn locate(&self, time_us: i64) -> Option<SidxLocation> {
        if self.references.is_empty() {
            return None;
        }

        let mut start_ticks = self.earliest_pts_ticks;
        let mut byte_offset = self.first_offset;
        let target_ticks = self.time_base.us_to_ticks(time_us);

        for (i, reference) in self.references.iter().enumerate() {
            let end_ticks = start_ticks + reference.duration_ticks as u64;
            let is_last = i == self.references.len() - 1;
            if target_ticks < end_ticks || is_last {
                return Some(SidxLocation {
                    entry_index: i,
                    byte_offset,
                    start_us: self.time_base.ticks_to_us(start_ticks),
                });
            }
            start_ticks = end_ticks;
            byte_offset += reference.size as u64;
        }
        None
    }

    pub fn total_duration_us(&self) -> i64 {
        let ticks: u64 = self
            .references
            .iter()
            .map(|r| r.duration_ticks as u64)
            .sum();
        self.time_base.ticks_to_us(ticks)
    }
}
