//! Per-track sample index: sample number → (offset, size, timing, sync flag)
//! with time→sample and sync-sample lookup for seeking.

use demux::{DemuxError, Result, SeekMode};
use media_types::TimeBase;

/// One sample's placement and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleMeta {
    /// Absolute byte offset in the stream.
    pub offset: u64,
    pub size: u32,
    /// Decode timestamp in track-timescale ticks.
    pub decode_ticks: u64,
    /// Decode duration in ticks.
    pub duration_ticks: u32,
    /// Composition-time offset in ticks (signed, version-1 `ctts`).
    pub cts_offset_ticks: i32,
    pub is_sync: bool,
}

/// Result of resolving a timed seek against the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekResolution {
    /// Sample decode starts from (always a sync sample when any exist).
    pub start_index: usize,
    /// The sample the query matched.
    pub target_index: usize,
    /// For `Closest` mode: the matched sample's own time, reported so the
    /// decode loop can discard earlier frames. The sync sample's time is
    /// deliberately NOT reported here.
    pub target_time_us: Option<i64>,
}

/// Immutable, fully-merged sample index for one track.
#[derive(Debug, Clone)]
pub struct SampleIndex {
    time_base: TimeBase,
    entries: Vec<SampleMeta>,
}

impl SampleIndex {
    /// Build an index, verifying that decode times never decrease.
    pub fn new(time_base: TimeBase, entries: Vec<SampleMeta>) -> Result<Self> {
        for pair in entries.windows(2) {
            if pair[1].decode_ticks < pair[0].decode_ticks {
                return Err(DemuxError::malformed(
                    "sample decode times are not monotonically non-decreasing",
                ));
            }
        }
        Ok(Self { time_base, entries })
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SampleMeta> {
        self.entries.get(index)
    }

    /// Decode timestamp in microseconds.
    pub fn decode_time_us(&self, index: usize) -> Option<i64> {
        self.entries
            .get(index)
            .map(|e| self.time_base.ticks_to_us(e.decode_ticks))
    }

    /// Presentation timestamp (decode time + composition offset).
    pub fn presentation_time_us(&self, index: usize) -> Option<i64> {
        self.entries.get(index).map(|e| {
            self.time_base
                .ticks_to_us_signed(e.decode_ticks as i64 + e.cts_offset_ticks as i64)
        })
    }

    pub fn duration_us(&self, index: usize) -> Option<i64> {
        self.entries
            .get(index)
            .map(|e| self.time_base.ticks_to_us(e.duration_ticks as u64))
    }

    /// Total track duration covered by the index.
    pub fn total_duration_us(&self) -> i64 {
        match self.entries.last() {
            Some(last) => self
                .time_base
                .ticks_to_us(last.decode_ticks + last.duration_ticks as u64),
            None => 0,
        }
    }

    /// Nearest sync sample at or before `index`; falls back to 0.
    pub fn sync_before(&self, index: usize) -> usize {
        let start = index.min(self.entries.len().saturating_sub(1));
        (0..=start).rev().find(|&i| self.entries[i].is_sync).unwrap_or(0)
    }

    /// Nearest sync sample at or after `index`.
    pub fn sync_after(&self, index: usize) -> Option<usize> {
        (index..self.entries.len()).find(|&i| self.entries[i].is_sync)
    }

    /// Index of the last sample whose decode time is ≤ `time_us`, or 0.
    fn sample_at_or_before(&self, time_us: i64) -> usize {
        let ticks = self.time_base.us_to_ticks(time_us);
        // First sample strictly after the target.
        let after = self.entries.partition_point(|e| e.decode_ticks <= ticks);
        after.saturating_sub(1)
    }

    /// Resolve a timed seek. Returns `None` on an empty index.
    pub fn find_by_time(&self, time_us: i64, mode: SeekMode) -> Option<SeekResolution> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        let before = self.sample_at_or_before(time_us);
        let after = (before + 1).min(last);

        match mode {
            SeekMode::Closest => {
                let d_before = (time_us - self.decode_time_us(before).unwrap_or(0)).abs();
                let d_after = (self.decode_time_us(after).unwrap_or(i64::MAX) - time_us).abs();
                let target = if d_after < d_before { after } else { before };
                Some(SeekResolution {
                    start_index: self.sync_before(target),
                    target_index: target,
                    // The queried sample's own time, not the sync sample's.
                    target_time_us: self.decode_time_us(target),
                })
            }
            SeekMode::PreviousSync => {
                let start = self.sync_before(before);
                Some(SeekResolution {
                    start_index: start,
                    target_index: start,
                    target_time_us: None,
                })
            }
            SeekMode::NextSync => {
                let start = self
                    .sync_after(if self.decode_time_us(before) == Some(time_us) {
                        before
                    } else {
                        after
                    })
                    .unwrap_or_else(|| self.sync_before(last));
                Some(SeekResolution {
                    start_index: start,
                    target_index: start,
                    target_time_us: None,
                })
            }
            SeekMode::ClosestSync => {
                let prev = self.sync_before(before);
                let next = self.sync_after(after);
                let start = match next {
                    Some(next) => {
                        let d_prev = (time_us - self.decode_time_us(prev).unwrap_or(0)).abs();
                        let d_next =
                            (self.decode_time_us(next).unwrap_or(i64::MAX) - time_us).abs();
                        if d_next < d_prev { next } else { prev }
                    }
                    None => prev,
                };
                Some(SeekResolution {
                    start_index: start,
                    target_index: start,
                    target_time_us: None,
                })
            }
        }
    }
}
