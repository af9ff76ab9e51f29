//! Sample-table sub-box parsing and the merge into a flat [`SampleIndex`].
//!
//! The classic ISO factoring splits per-sample placement across five
//! independent tables: chunk offsets (`stco`/`co64`), samples-per-chunk runs
//! (`stsc`), sizes (`stsz`), decode-time runs (`stts`), composition offsets
//! (`ctts`) and the sync-sample list (`stss`).

use demux::{DemuxError, Result};
use media_types::TimeBase;
use tracing::trace;

use crate::boxes::{field, full_box};
use crate::index::{SampleIndex, SampleMeta};

#[derive(Debug, Clone, Copy)]
pub struct SttsEntry {
    pub count: u32,
    pub delta: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CttsEntry {
    pub count: u32,
    pub offset: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct StscEntry {
    /// 1-based first chunk this run applies to.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

/// Raw, unmerged sample tables collected while parsing one `stbl`.
#[derive(Debug, Default, Clone)]
pub struct SampleTables {
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    /// 0-based sync sample indices; `None` means every sample is sync.
    pub stss: Option<Vec<u32>>,
    pub uniform_size: Option<u32>,
    pub sizes: Vec<u32>,
    pub sample_count: u32,
    pub stsc: Vec<StscEntry>,
    pub chunk_offsets: Vec<u64>,
}

impl SampleTables {
    pub fn parse_stts(&mut self, body: &[u8]) -> Result<()> {
        let (_, payload) = full_box(body)?;
        let entry_count = field::u32_at(payload, 0)? as usize;
        let mut entries = Vec::with_capacity(entry_count.min(4096));
        for i in 0..entry_count {
            let at = 4 + i * 8;
            entries.push(SttsEntry {
                count: field::u32_at(payload, at)?,
                delta: field::u32_at(payload, at + 4)?,
            });
        }
        self.stts = entries;
        Ok(())
    }

    pub fn parse_ctts(&mut self, body: &[u8]) -> Result<()> {
        let (header, payload) = full_box(body)?;
        let entry_count = field::u32_at(payload, 0)? as usize;
        let mut entries = Vec::with_capacity(entry_count.min(4096));
        for i in 0..entry_count {
            let at = 4 + i * 8;
            let offset = if header.version == 0 {
                field::u32_at(payload, at + 4)? as i32
            } else {
                field::i32_at(payload, at + 4)?
            };
            entries.push(CttsEntry {
                count: field::u32_at(payload, at)?,
                offset,
            });
        }
        self.ctts = entries;
        Ok(())
    }

    pub fn parse_stss(&mut self, body: &[u8]) -> Result<()> {
        let (_, payload) = full_box(body)?;
        let entry_count = field::u32_at(payload, 0)? as usize;
        let mut syncs = Vec::with_capacity(entry_count.min(4096));
        for i in 0..entry_count {
            let number = field::u32_at(payload, 4 + i * 4)?;
            if number == 0 {
                return Err(DemuxError::malformed("stss sample numbers are 1-based"));
            }
            syncs.push(number - 1);
        }
        self.stss = Some(syncs);
        Ok(())
    }

    pub fn parse_stsz(&mut self, body: &[u8]) -> Result<()> {
        let (_, payload) = full_box(body)?;
        let uniform = field::u32_at(payload, 0)?;
        let count = field::u32_at(payload, 4)?;
        self.sample_count = count;
        if uniform != 0 {
            self.uniform_size = Some(uniform);
        } else {
            let mut sizes = Vec::with_capacity((count as usize).min(1 << 20));
            for i in 0..count as usize {
                sizes.push(field::u32_at(payload, 8 + i * 4)?);
            }
            self.sizes = sizes;
        }
        Ok(())
    }

    pub fn parse_stsc(&mut self, body: &[u8]) -> Result<()> {
        let (_, payload) = full_box(body)?;
        let entry_count = field::u32_at(payload, 0)? as usize;
        let mut entries = Vec::with_capacity(entry_count.min(4096));
        for i in 0..entry_count {
            let at = 4 + i * 12;
            let entry = StscEntry {
                first_chunk: field::u32_at(payload, at)?,
                samples_per_chunk: field::u32_at(payload, at + 4)?,
                // sample_description_index at +8 is not needed for placement.
            };
            if entry.first_chunk == 0 {
                return Err(DemuxError::malformed("stsc first_chunk is 1-based"));
            }
            entries.push(entry);
        }
        self.stsc = entries;
        Ok(())
    }

    pub fn parse_chunk_offsets(&mut self, body: &[u8], is_co64: bool) -> Result<()> {
        let (_, payload) = full_box(body)?;
        let entry_count = field::u32_at(payload, 0)? as usize;
        let mut offsets = Vec::with_capacity(entry_count.min(1 << 20));
        for i in 0..entry_count {
            if is_co64 {
                offsets.push(field::u64_at(payload, 4 + i * 8)?);
            } else {
                offsets.push(field::u32_at(payload, 4 + i * 4)? as u64);
            }
        }
        self.chunk_offsets = offsets;
        Ok(())
    }

    fn size_of(&self, sample: usize) -> Result<u32> {
        if let Some(uniform) = self.uniform_size {
            return Ok(uniform);
        }
        self.sizes
            .get(sample)
            .copied()
            .ok_or_else(|| DemuxError::malformed("stsz shorter than sample count"))
    }

    /// Merge the sub-tables into a flat per-sample index.
    pub fn build_index(&self, time_base: TimeBase) -> Result<SampleIndex> {
        let sample_count = self.sample_count as usize;
        if sample_count == 0 {
            return SampleIndex::new(time_base, Vec::new());
        }
        if self.chunk_offsets.is_empty() || self.stsc.is_empty() || self.stts.is_empty() {
            return Err(DemuxError::malformed(
                "sample table is missing chunk offsets, stsc or stts",
            ));
        }

        let mut entries = Vec::with_capacity(sample_count);

        // Decode-time run cursor.
        let mut stts_iter = self.stts.iter();
        let mut stts_run = stts_iter.next().copied();
        let mut stts_left = stts_run.map_or(0, |r| r.count);
        let mut decode_ticks = 0u64;

        // Composition-offset run cursor.
        let mut ctts_iter = self.ctts.iter();
        let mut ctts_run = ctts_iter.next().copied();
        let mut ctts_left = ctts_run.map_or(0, |r| r.count);

        let mut sync_iter = self.stss.as_deref().map(|s| s.iter().peekable());

        let mut sample = 0usize;
        'chunks: for (chunk_index, &chunk_offset) in self.chunk_offsets.iter().enumerate() {
            let samples_in_chunk = samples_per_chunk(&self.stsc, chunk_index as u32 + 1);
            let mut offset = chunk_offset;
            for _ in 0..samples_in_chunk {
                if sample >= sample_count {
                    break 'chunks;
                }

                // Advance the stts run.
                while stts_left == 0 {
                    stts_run = stts_iter.next().copied();
                    match stts_run {
                        Some(run) => stts_left = run.count,
                        None => {
                            return Err(DemuxError::malformed(
                                "stts runs cover fewer samples than stsz declares",
                            ));
                        }
                    }
                }
                let duration_ticks = stts_run.map_or(0, |r| r.delta);
                stts_left -= 1;

                // Advance the ctts run (optional table).
                let cts_offset_ticks = if ctts_run.is_some() {
                    while ctts_left == 0 {
                        ctts_run = ctts_iter.next().copied();
                        match ctts_run {
                            Some(run) => ctts_left = run.count,
                            None => break,
                        }
                    }
                    if ctts_left > 0 {
                        ctts_left -= 1;
                    }
                    ctts_run.map_or(0, |r| r.offset)
                } else {
                    0
                };

                let is_sync = match sync_iter.as_mut() {
                    None => true,
                    Some(iter) => {
                        let hit = iter.peek() == Some(&&(sample as u32));
                        if hit {
                            iter.next();
                        }
                        hit
                    }
                };

                let size = self.size_of(sample)?;
                entries.push(SampleMeta {
                    offset,
                    size,
                    decode_ticks,
                    duration_ticks,
                    cts_offset_ticks,
                    is_sync,
                });

                offset += size as u64;
                decode_ticks += duration_ticks as u64;
                sample += 1;
            }
        }

        if sample < sample_count {
            return Err(DemuxError::malformed(format!(
                "chunk map places only {sample} of {sample_count} samples"
            )));
        }

        trace!(samples = entries.len(), "merged sample table");
        SampleIndex::new(time_base, entries)
    }
}

/// Samples in the given 1-based chunk, per the `stsc` run table.
fn samples_per_chunk(stsc: &[StscEntry], chunk: u32) -> u32 {
    let mut samples = 0;
    for entry in stsc {
        if entry.first_chunk > chunk {
            break;
        }
        samples = entry.samples_per_chunk;
    }
    samples
}
