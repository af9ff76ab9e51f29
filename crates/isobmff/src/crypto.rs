//! Common-encryption metadata: track defaults (`tenc`) and per-fragment
//! sample auxiliary info (`senc`, `saiz`, `saio`).
//!
//! Nothing is decrypted here; parsed IVs and subsample ranges are attached
//! to emitted samples as side data for a downstream decryption layer.

use bytes::Bytes;
use demux::{CryptoInfo, DemuxError, Result, Subsample, TrackEncryption};

use crate::boxes::{field, full_box};

/// Parse a `tenc` box body into track-default encryption parameters.
///
/// The per-sample IV size may only be 0, 8 or 16 bytes; anything else is
/// malformed.
pub fn parse_tenc(body: &[u8], scheme: String) -> Result<TrackEncryption> {
    let (_, payload) = full_box(body)?;
    if payload.len() < 20 {
        return Err(DemuxError::malformed("tenc box too short"));
    }
    let default_is_encrypted = payload[2] != 0;
    let default_iv_size = payload[3];
    if !matches!(default_iv_size, 0 | 8 | 16) {
        return Err(DemuxError::malformed(format!(
            "tenc declares invalid per-sample IV size {default_iv_size}"
        )));
    }
    let mut key_id = [0u8; 16];
    key_id.copy_from_slice(&payload[4..20]);
    Ok(TrackEncryption {
        scheme,
        default_is_encrypted,
        default_iv_size,
        key_id,
    })
}

/// Parse a `senc` box body into per-sample crypto side data.
///
/// `iv_size` comes from the track's `tenc` defaults; the box itself does not
/// restate it.
pub fn parse_senc(body: &Bytes, iv_size: u8, sample_count_hint: usize) -> Result<Vec<CryptoInfo>> {
    let (header, payload) = full_box(body.as_ref())?;
    let declared = field::u32_at(payload, 0)? as usize;
    if sample_count_hint != 0 && declared != sample_count_hint {
        return Err(DemuxError::malformed(format!(
            "senc covers {declared} samples but the fragment run has {sample_count_hint}"
        )));
    }
    let has_subsamples = header.flags & 0x2 != 0;

    let mut at = 4usize;
    let mut infos = Vec::with_capacity(declared.min(4096));
    let body_offset = body.len() - payload.len();
    for _ in 0..declared {
        let iv = if iv_size > 0 {
            let end = at + iv_size as usize;
            if end > payload.len() {
                return Err(DemuxError::malformed("senc IV overruns box"));
            }
            let iv = body.slice(body_offset + at..body_offset + end);
            at = end;
            iv
        } else {
            Bytes::new()
        };

        let mut subsamples = Vec::new();
        if has_subsamples {
            let count = field::u16_at(payload, at)? as usize;
            at += 2;
            for _ in 0..count {
                subsamples.push(Subsample {
                    clear_bytes: field::u16_at(payload, at)?,
                    encrypted_bytes: field::u32_at(payload, at + 2)?,
                });
                at += 6;
            }
        }

        infos.push(CryptoInfo { iv, subsamples });
    }
    Ok(infos)
}

/// Parsed `saiz`: per-sample auxiliary info sizes.
#[derive(Debug, Clone)]
pub struct AuxInfoSizes {
    pub default_size: u8,
    pub sizes: Vec<u8>,
    pub sample_count: u32,
}

pub fn parse_saiz(body: &[u8]) -> Result<AuxInfoSizes> {
    let (header, payload) = full_box(body)?;
    let mut at = 0usize;
    if header.flags & 0x1 != 0 {
        // aux_info_type + parameter, not needed for cenc.
        at += 8;
    }
    let default_size = *payload
        .get(at)
        .ok_or_else(|| DemuxError::malformed("saiz box too short"))?;
    let sample_count = field::u32_at(payload, at + 1)?;
    let mut sizes = Vec::new();
    if default_size == 0 {
        let start = at + 5;
        let end = start + sample_count as usize;
        sizes = payload
            .get(start..end)
            .ok_or_else(|| DemuxError::malformed("saiz sizes overrun box"))?
            .to_vec();
    }
    Ok(AuxInfoSizes {
        default_size,
        sizes,
        sample_count,
    })
}

/// Parsed `saio`: offsets to the auxiliary data, relative to the fragment's
/// base data offset.
pub fn parse_saio(body: &[u8]) -> Result<Vec<u64>> {
    let (header, payload) = full_box(body)?;
    let mut at = 0usize;
    if header.flags & 0x1 != 0 {
        at += 8;
    }
    let entry_count = field::u32_at(payload, at)? as usize;
    at += 4;
    let mut offsets = Vec::with_capacity(entry_count.min(4096));
    for _ in 0..entry_count {
        if header.version == 0 {
            offsets.push(field::u32_at(payload, at)? as u64);
            at += 4;
        } else {
            offsets.push(field::u64_at(payload, at)?);
            at += 8;
        }
    }
    Ok(offsets)
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    fn tenc_body(is_encrypted: u8, iv_size: u8) -> Vec<u8> {
        let mut body = vec![0u8, 0, 0, 0]; // version/flags
        body.push(0); // reserved
        body.push(0); // reserved / pattern
        body.push(is_encrypted);
        body.push(iv_size);
        body.extend_from_slice(&[0xAB; 16]);
        body
    }

    #[test]
    fn test_tenc_parses_defaults() {
        let enc = parse_tenc(&tenc_body(1, 8), "cenc".into()).unwrap();
        assert!(enc.default_is_encrypted);
        assert_eq!(enc.default_iv_size, 8);
        assert_eq!(enc.key_id, [0xAB; 16]);
        assert_eq!(enc.scheme, "cenc");
    }

    #[test]
    fn test_tenc_rejects_bad_iv_size() {
        for bad in [1u8, 4, 12, 32] {
            assert!(matches!(
                parse_tenc(&tenc_body(1, bad), "cenc".into()),
                Err(DemuxError::Malformed(_))
            ));
        }
        // The three legal values pass.
        for good in [0u8, 8, 16] {
            assert!(parse_tenc(&tenc_body(1, good), "cenc".into()).is_ok());
        }
    }

    #[test]
    fn test_senc_plain_ivs() {
        let mut body = vec![0u8, 0, 0, 0]; // version, flags = 0 (no subsamples)
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(&[1u8; 8]);
        body.extend_from_slice(&[2u8; 8]);
        let infos = parse_senc(&Bytes::from(body), 8, 2).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].iv.as_ref(), &[1u8; 8]);
        assert_eq!(infos[1].iv.as_ref(), &[2u8; 8]);
        assert!(infos[0].subsamples.is_empty());
    }

    #[test]
    fn test_senc_subsamples() {
        let mut body = vec![0u8, 0, 0, 2]; // flags bit 1: subsamples present
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&[9u8; 8]); // IV
        body.extend_from_slice(&1u16.to_be_bytes()); // subsample count
        body.extend_from_slice(&5u16.to_be_bytes()); // clear
        body.extend_from_slice(&100u32.to_be_bytes()); // encrypted
        let infos = parse_senc(&Bytes::from(body), 8, 1).unwrap();
        assert_eq!(infos[0].subsamples.len(), 1);
        assert_eq!(infos[0].subsamples[0].clear_bytes, 5);
        assert_eq!(infos[0].subsamples[0].encrypted_bytes, 100);
    }

    #[test]
    fn test_senc_count_mismatch() {
        let mut body = vec![0u8, 0, 0, 0];
        body.extend_from_slice(&3u32.to_be_bytes());
        assert!(parse_senc(&Bytes::from(body), 0, 2).is_err());
    }

    #[test]
    fn test_saiz_uniform_and_explicit() {
        let mut body = vec![0u8, 0, 0, 0];
        body.push(8); // default size
        body.extend_from_slice(&4u32.to_be_bytes());
        let aux = parse_saiz(&body).unwrap();
        assert_eq!(aux.default_size, 8);
        assert_eq!(aux.sample_count, 4);
        assert!(aux.sizes.is_empty());

        let mut body = vec![0u8, 0, 0, 0];
        body.push(0);
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(&[10, 12, 14]);
        let aux = parse_saiz(&body).unwrap();
        assert_eq!(aux.sizes, vec![10, 12, 14]);
    }

    #[test]
    fn test_saio_versions() {
        let mut body = vec![0u8, 0, 0, 0];
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&4096u32.to_be_bytes());
        assert_eq!(parse_saio(&body).unwrap(), vec![4096]);

        let mut body = vec![1u8, 0, 0, 0];
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&(1u64 << 33).to_be_bytes());
        assert_eq!(parse_saio(&body).unwrap(), vec![1u64 << 33]);
    }
}
