//! Fragmented-layout support: `mvex`/`trex` defaults, `moof` parsing and the
//! forward fragment scan that chains one fragment to the next.
//!
//! Sample enumeration in fragmented mode is on-demand: each exhausted batch
//! triggers a forward scan from the recorded next-fragment offset, and the
//! located `moof` is fully parsed before emission resumes.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use demux::{ByteSource, CryptoInfo, DemuxError, Result, Subsample};

use crate::boxes::{self, BoxView, BoxWalker, field, full_box};
use crate::crypto;
use crate::fourcc;

/// `sample_is_non_sync_sample` bit within ISO sample flags.
const SAMPLE_FLAG_NON_SYNC: u32 = 0x0001_0000;

/// Guard against corrupt run counts driving unbounded allocation.
const MAX_RUN_SAMPLES: usize = 1 << 20;

/// Per-track defaults from the `mvex/trex` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrexDefaults {
    pub track_id: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

/// One sample produced from a fragment run.
#[derive(Debug, Clone)]
pub struct FragmentSample {
    pub offset: u64,
    pub size: u32,
    pub decode_ticks: u64,
    pub duration_ticks: u32,
    pub cts_offset_ticks: i32,
    pub is_sync: bool,
    pub crypto: Option<CryptoInfo>,
}

/// All samples one fragment contributes for one track.
#[derive(Debug)]
pub struct FragmentBatch {
    pub samples: Vec<FragmentSample>,
    pub moof_offset: u64,
    /// Where the scan for the following fragment starts.
    pub next_scan_offset: u64,
}

/// Forward-scanning fragment reader for a single track.
pub struct FragmentScanner {
    track_id: u32,
    trex: Option<TrexDefaults>,
    /// Per-sample IV size from the track's encryption defaults.
    iv_size: u8,
    next_offset: u64,
    next_decode_ticks: u64,
}

impl FragmentScanner {
    pub fn new(track_id: u32, trex: Option<TrexDefaults>, iv_size: u8, start_offset: u64) -> Self {
        Self {
            track_id,
            trex,
            iv_size,
            next_offset: start_offset,
            next_decode_ticks: 0,
        }
    }

    /// Rewind/advance to an absolute fragment offset (seek support).
    pub fn reset_to(&mut self, offset: u64, decode_ticks: u64) {
        self.next_offset = offset;
        self.next_decode_ticks = decode_ticks;
    }

    pub fn position(&self) -> u64 {
        self.next_offset
    }

    /// Scan forward from the recorded offset to the next `moof` containing a
    /// run for this track and parse it. Returns `None` at end of stream.
    pub fn next_batch(&mut self, source: &dyn ByteSource) -> Result<Option<FragmentBatch>> {
        loop {
            let offset = self.next_offset;
            let Some(header) = boxes::read_header_at(source, offset)? else {
                return Ok(None);
            };

            if header.extends_to_end() {
                // A to-end box (typically a final mdat) ends the scan.
                return Ok(None);
            }
            if header.size < header.header_len {
                return Err(DemuxError::malformed(format!(
                    "top-level box `{}` size smaller than its header",
                    header.fourcc
                )));
            }

            if header.fourcc != fourcc::MOOF {
                trace!(tag = %header.fourcc, offset, "skipping non-fragment box");
                self.next_offset = offset + header.size;
                continue;
            }

            let payload = boxes::load_payload(source, offset, &header)?;
            self.next_offset = offset + header.size;

            let samples = self.parse_moof(&payload, offset, source)?;
            if samples.is_empty() {
                // Fragment carries other tracks only; keep scanning.
                continue;
            }

            if let Some(last) = samples.last() {
                self.next_decode_ticks = last.decode_ticks + last.duration_ticks as u64;
            }
            debug!(
                moof_offset = offset,
                samples = samples.len(),
                "parsed fragment"
            );
            return Ok(Some(FragmentBatch {
                samples,
                moof_offset: offset,
                next_scan_offset: self.next_offset,
            }));
        }
    }

    fn parse_moof(
        &self,
        payload: &Bytes,
        moof_offset: u64,
        source: &dyn ByteSource,
    ) -> Result<Vec<FragmentSample>> {
        for traf in BoxWalker::over(payload) {
            let traf = traf?;
            if traf.fourcc != fourcc::TRAF {
                continue;
            }

            let mut tfhd: Option<TfhdInfo> = None;
            let mut base_decode_ticks: Option<u64> = None;
            let mut runs: Vec<BoxView> = Vec::new();
            let mut senc: Option<BoxView> = None;
            let mut saiz: Option<crypto::AuxInfoSizes> = None;
            let mut saio: Option<Vec<u64>> = None;

            for child in BoxWalker::new(payload, traf.body_start, traf.body_end) {
                let child = child?;
                match child.fourcc.as_bytes() {
                    b"tfhd" => {
                        tfhd = Some(parse_tfhd(
                            child.body(payload),
                            moof_offset,
                            self.trex.as_ref(),
                        )?);
                    }
                    b"tfdt" => {
                        let (fb, body) = full_box(child.body(payload))?;
                        base_decode_ticks = Some(if fb.version == 1 {
                            field::u64_at(body, 0)?
                        } else {
                            field::u32_at(body, 0)? as u64
                        });
                    }
                    b"trun" => runs.push(child),
                    b"senc" => senc = Some(child),
                    b"saiz" => saiz = Some(crypto::parse_saiz(child.body(payload))?),
                    b"saio" => saio = Some(crypto::parse_saio(child.body(payload))?),
                    _ => {}
                }
            }

            let Some(tfhd) = tfhd else {
                warn!("traf without tfhd, skipping");
                continue;
            };
            if tfhd.track_id != self.track_id {
                continue;
            }

            let mut samples = Vec::new();
            let mut decode_ticks = base_decode_ticks.unwrap_or(self.next_decode_ticks);
            let mut running_offset: Option<u64> = None;
            for run in &runs {
                parse_trun(
                    payload,
                    *run,
                    &tfhd,
                    &mut decode_ticks,
                    &mut running_offset,
                    &mut samples,
                )?;
            }

            self.attach_crypto(
                payload,
                senc,
                saiz,
                saio,
                &tfhd,
                source,
                &mut samples,
            )?;
            return Ok(samples);
        }

        Ok(Vec::new())
    }

    /// Attach per-sample encryption side data from `senc`, or from raw aux
    /// data located via `saiz`/`saio` when `senc` is absent.
    fn attach_crypto(
        &self,
        payload: &Bytes,
        senc: Option<BoxView>,
        saiz: Option<crypto::AuxInfoSizes>,
        saio: Option<Vec<u64>>,
        tfhd: &TfhdInfo,
        source: &dyn ByteSource,
        samples: &mut [FragmentSample],
    ) -> Result<()> {
        if samples.is_empty() || (self.iv_size == 0 && senc.is_none()) {
            return Ok(());
        }

        let infos: Vec<CryptoInfo> = if let Some(senc) = senc {
            crypto::parse_senc(&senc.body_bytes(payload), self.iv_size, samples.len())?
        } else if let (Some(saiz), Some(saio)) = (saiz, saio) {
            let total: usize = if saiz.default_size > 0 {
                saiz.default_size as usize * saiz.sample_count as usize
            } else {
                saiz.sizes.iter().map(|&s| s as usize).sum()
            };
            let first = *saio
                .first()
                .ok_or_else(|| DemuxError::malformed("saio box has no offsets"))?;
            let aux_offset = tfhd.base_data_offset + first;
            let raw = demux::read_bytes_at(source, aux_offset, total)?;
            parse_raw_aux(&raw, self.iv_size, &saiz)?
        } else {
            return Ok(());
        };

        if infos.len() != samples.len() {
            return Err(DemuxError::malformed(format!(
                "encryption aux info covers {} samples, run has {}",
                infos.len(),
                samples.len()
            )));
        }
        for (sample, info) in samples.iter_mut().zip(infos) {
            sample.crypto = Some(info);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct TfhdInfo {
    track_id: u32,
    base_data_offset: u64,
    default_sample_duration: Option<u32>,
    default_sample_size: Option<u32>,
    default_sample_flags: Option<u32>,
}

fn parse_tfhd(body: &[u8], moof_offset: u64, trex: Option<&TrexDefaults>) -> Result<TfhdInfo> {
    let (header, payload) = full_box(body)?;
    let flags = header.flags;
    let track_id = field::u32_at(payload, 0)?;

    let mut at = 4usize;
    let mut base_data_offset = moof_offset;
    if flags & 0x1 != 0 {
        base_data_offset = field::u64_at(payload, at)?;
        at += 8;
    }
    if flags & 0x2 != 0 {
        at += 4; // sample_description_index
    }

    let mut default_sample_duration = None;
    if flags & 0x8 != 0 {
        default_sample_duration = Some(field::u32_at(payload, at)?);
        at += 4;
    }
    let mut default_sample_size = None;
    if flags & 0x10 != 0 {
        default_sample_size = Some(field::u32_at(payload, at)?);
        at += 4;
    }
    let mut default_sample_flags = None;
    if flags & 0x20 != 0 {
        default_sample_flags = Some(field::u32_at(payload, at)?);
    }

    // Inherit from the movie-level trex defaults where tfhd is silent.
    if let Some(trex) = trex.filter(|t| t.track_id == track_id) {
        default_sample_duration = default_sample_duration.or(Some(trex.default_sample_duration));
        default_sample_size = default_sample_size.or(Some(trex.default_sample_size));
        default_sample_flags = default_sample_flags.or(Some(trex.default_sample_flags));
    }

    Ok(TfhdInfo {
        track_id,
        base_data_offset,
        default_sample_duration,
        default_sample_size,
        default_sample_flags,
    })
}

fn parse_trun(
    payload: &Bytes,
    run: BoxView,
    tfhd: &TfhdInfo,
    decode_ticks: &mut u64,
    running_offset: &mut Option<u64>,
    samples: &mut Vec<FragmentSample>,
) -> Result<()> {
    let (header, body) = full_box(run.body(payload))?;
    let flags = header.flags;
    let sample_count = field::u32_at(body, 0)? as usize;
    if sample_count > MAX_RUN_SAMPLES {
        return Err(DemuxError::malformed(format!(
            "trun declares {sample_count} samples, exceeding the run ceiling"
        )));
    }

    let mut at = 4usize;
    let data_offset = if flags & 0x1 != 0 {
        let value = field::i32_at(body, at)?;
        at += 4;
        Some(value)
    } else {
        None
    };
    let first_sample_flags = if flags & 0x4 != 0 {
        let value = field::u32_at(body, at)?;
        at += 4;
        Some(value)
    } else {
        None
    };

    let has_duration = flags & 0x100 != 0;
    let has_size = flags & 0x200 != 0;
    let has_flags = flags & 0x400 != 0;
    let has_cts = flags & 0x800 != 0;

    let mut offset = match data_offset {
        Some(rel) => {
            let base = tfhd.base_data_offset as i64 + rel as i64;
            u64::try_from(base)
                .map_err(|_| DemuxError::malformed("trun data offset is negative"))?
        }
        None => running_offset.unwrap_or(tfhd.base_data_offset),
    };

    for i in 0..sample_count {
        let duration = if has_duration {
            let value = field::u32_at(body, at)?;
            at += 4;
            value
        } else {
            tfhd.default_sample_duration.ok_or_else(|| {
                DemuxError::malformed("trun sample lacks a duration and no default exists")
            })?
        };

        let size = if has_size {
            let value = field::u32_at(body, at)?;
            at += 4;
            value
        } else {
            tfhd.default_sample_size.ok_or_else(|| {
                DemuxError::malformed("trun sample lacks a size and no default exists")
            })?
        };

        // first_sample_flags substitutes only when no per-sample column exists.
        let sample_flags = if has_flags {
            let value = field::u32_at(body, at)?;
            at += 4;
            value
        } else if i == 0
            && let Some(first) = first_sample_flags
        {
            first
        } else {
            tfhd.default_sample_flags.unwrap_or(0)
        };

        let cts_offset = if has_cts {
            let raw = field::u32_at(body, at)?;
            at += 4;
            raw as i32
        } else {
            0
        };

        samples.push(FragmentSample {
            offset,
            size,
            decode_ticks: *decode_ticks,
            duration_ticks: duration,
            cts_offset_ticks: cts_offset,
            is_sync: sample_flags & SAMPLE_FLAG_NON_SYNC == 0,
            crypto: None,
        });

        offset += size as u64;
        *decode_ticks += duration as u64;
    }

    *running_offset = Some(offset);
    Ok(())
}

/// Parse raw auxiliary data located via `saiz`/`saio`: per-sample IV plus
/// optional subsample ranges, the same layout as a `senc` payload without
/// the box header.
fn parse_raw_aux(raw: &Bytes, iv_size: u8, saiz: &crypto::AuxInfoSizes) -> Result<Vec<CryptoInfo>> {
    let mut infos = Vec::with_capacity(saiz.sample_count as usize);
    let mut at = 0usize;
    for i in 0..saiz.sample_count as usize {
        let aux_size = if saiz.default_size > 0 {
            saiz.default_size as usize
        } else {
            *saiz
                .sizes
                .get(i)
                .ok_or_else(|| DemuxError::malformed("saiz sizes shorter than sample count"))?
                as usize
        };
        let end = at + aux_size;
        if end > raw.len() {
            return Err(DemuxError::malformed("aux data overruns its range"));
        }

        let iv_end = at + (iv_size as usize).min(aux_size);
        let iv = raw.slice(at..iv_end);
        let mut subsamples = Vec::new();
        let mut sub_at = iv_end;
        if sub_at + 2 <= end {
            let count = u16::from_be_bytes([raw[sub_at], raw[sub_at + 1]]) as usize;
            sub_at += 2;
            for _ in 0..count {
                if sub_at + 6 > end {
                    return Err(DemuxError::malformed("aux subsample overruns its range"));
                }
                subsamples.push(Subsample {
                    clear_bytes: u16::from_be_bytes([raw[sub_at], raw[sub_at + 1]]),
                    encrypted_bytes: u32::from_be_bytes([
                        raw[sub_at + 2],
                        raw[sub_at + 3],
                        raw[sub_at + 4],
                        raw[sub_at + 5],
                    ]),
                });
                sub_at += 6;
            }
        }

        infos.push(CryptoInfo { iv, subsamples });
        at = end;
    }
    Ok(infos)
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::test_support::{
        FragmentSpec, make_box, make_fragment, make_full_box, u32s,
    };
    use demux::MemorySource;
    use std::sync::Arc;

    #[test]
    fn test_scan_finds_fragment_past_other_boxes() {
        let mut file = make_box(b"free", &[0u8; 16]);
        let spec = FragmentSpec {
            track_id: 1,
            base_decode_ticks: Some(1000),
            sample_sizes: vec![10, 20],
            sample_durations: vec![100, 100],
            first_is_sync: true,
            ..FragmentSpec::default()
        };
        let frag_offset = file.len() as u64;
        file.extend_from_slice(&make_fragment(&spec));

        let source = MemorySource::new(file);
        let mut scanner = FragmentScanner::new(1, None, 0, 0);
        let batch = scanner.next_batch(&source).unwrap().unwrap();
        assert_eq!(batch.moof_offset, frag_offset);
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(batch.samples[0].decode_ticks, 1000);
        assert_eq!(batch.samples[1].decode_ticks, 1100);
        assert_eq!(batch.samples[0].size, 10);
        assert!(batch.samples[0].is_sync);
        assert!(!batch.samples[1].is_sync);
        // Sample data sits in the mdat right after the moof.
        assert!(batch.samples[0].offset > frag_offset);

        assert!(scanner.next_batch(&source).unwrap().is_none());
    }

    #[test]
    fn test_fragment_chaining_accumulates_time() {
        let spec_a = FragmentSpec {
            track_id: 1,
            sample_sizes: vec![4],
            sample_durations: vec![500],
            first_is_sync: true,
            ..FragmentSpec::default()
        };
        let spec_b = FragmentSpec {
            track_id: 1,
            sample_sizes: vec![4],
            sample_durations: vec![500],
            first_is_sync: true,
            ..FragmentSpec::default()
        };
        let mut file = make_fragment(&spec_a);
        file.extend_from_slice(&make_fragment(&spec_b));

        let source = MemorySource::new(file);
        let mut scanner = FragmentScanner::new(1, None, 0, 0);
        let first = scanner.next_batch(&source).unwrap().unwrap();
        assert_eq!(first.samples[0].decode_ticks, 0);
        // No tfdt in the second fragment: decode time carries forward.
        let second = scanner.next_batch(&source).unwrap().unwrap();
        assert_eq!(second.samples[0].decode_ticks, 500);
    }

    #[test]
    fn test_other_track_fragments_skipped() {
        let other = FragmentSpec {
            track_id: 7,
            sample_sizes: vec![4],
            sample_durations: vec![100],
            ..FragmentSpec::default()
        };
        let ours = FragmentSpec {
            track_id: 1,
            sample_sizes: vec![4],
            sample_durations: vec![100],
            ..FragmentSpec::default()
        };
        let mut file = make_fragment(&other);
        file.extend_from_slice(&make_fragment(&ours));

        let source = MemorySource::new(file);
        let mut scanner = FragmentScanner::new(1, None, 0, 0);
        let batch = scanner.next_batch(&source).unwrap().unwrap();
        assert_eq!(batch.samples.len(), 1);
    }

    #[test]
    fn test_trex_defaults_inherited() {
        // Fragment with no per-sample sizes/durations: all inherited.
        let spec = FragmentSpec {
            track_id: 1,
            sample_count_only: Some(3),
            ..FragmentSpec::default()
        };
        let file = make_fragment(&spec);

        let source = MemorySource::new(file);
        let trex = TrexDefaults {
            track_id: 1,
            default_sample_duration: 250,
            default_sample_size: 8,
            default_sample_flags: 0,
        };
        let mut scanner = FragmentScanner::new(1, Some(trex), 0, 0);
        let batch = scanner.next_batch(&source).unwrap().unwrap();
        assert_eq!(batch.samples.len(), 3);
        assert_eq!(batch.samples[2].decode_ticks, 500);
        assert_eq!(batch.samples[2].size, 8);
        assert_eq!(batch.samples[1].offset, batch.samples[0].offset + 8);
    }

    #[test]
    fn test_missing_defaults_is_malformed() {
        let spec = FragmentSpec {
            track_id: 1,
            sample_count_only: Some(2),
            ..FragmentSpec::default()
        };
        let file = make_fragment(&spec);
        let source = MemorySource::new(file);
        let mut scanner = FragmentScanner::new(1, None, 0, 0);
        assert!(matches!(
            scanner.next_batch(&source),
            Err(DemuxError::Malformed(_))
        ));
    }

    #[test]
    fn test_senc_attaches_crypto() {
        let mut senc_payload = u32s(&[2]);
        senc_payload.extend_from_slice(&[0x11; 8]);
        senc_payload.extend_from_slice(&[0x22; 8]);
        let senc = make_full_box(b"senc", 0, 0, &senc_payload);

        let spec = FragmentSpec {
            track_id: 1,
            sample_sizes: vec![4, 4],
            sample_durations: vec![100, 100],
            extra_traf_boxes: senc,
            ..FragmentSpec::default()
        };
        let file = make_fragment(&spec);
        let source = MemorySource::new(file);
        let mut scanner = FragmentScanner::new(1, None, 8, 0);
        let batch = scanner.next_batch(&source).unwrap().unwrap();
        let crypto = batch.samples[1].crypto.as_ref().unwrap();
        assert_eq!(crypto.iv.as_ref(), &[0x22; 8]);
    }

    #[test]
    fn test_reset_to_rewinds() {
        let spec = FragmentSpec {
            track_id: 1,
            sample_sizes: vec![4],
            sample_durations: vec![100],
            ..FragmentSpec::default()
        };
        let file = make_fragment(&spec);
        let source = Arc::new(MemorySource::new(file));
        let mut scanner = FragmentScanner::new(1, None, 0, 0);
        let first = scanner.next_batch(source.as_ref()).unwrap().unwrap();
        assert!(scanner.next_batch(source.as_ref()).unwrap().is_none());

        scanner.reset_to(0, 0);
        let again = scanner.next_batch(source.as_ref()).unwrap().unwrap();
        assert_eq!(again.moof_offset, first.moof_offset);
    }
}
