//! Top-level box scan: walks the stream's outermost boxes, loads and parses
//! the structural ones (`ftyp`, `moov`, `sidx`), records fragment and media
//! offsets, and stops as soon as playback can begin.

use std::sync::Arc;

use tracing::{debug, warn};

use demux::{ByteSource, DemuxError, FileMetadata, Result};

use crate::boxes;
use crate::frag::TrexDefaults;
use crate::moov::{self, MovieInfo};
use crate::sidx::SegmentIndex;
use crate::track::Track;

/// Top-level boxes scanned before giving up on recognizing the stream.
pub const TOP_LEVEL_SCAN_LIMIT: usize = 32;

/// Result of the structural parse pass.
pub struct ParsedFile {
    pub metadata: FileMetadata,
    pub tracks: Vec<Track>,
    pub trex: Vec<TrexDefaults>,
    pub fragmented: bool,
    pub qt_mode: bool,
    pub sidx: Option<SegmentIndex>,
    /// Offset of the first movie fragment, the anchor for `sidx` byte
    /// offsets and the restart point for degraded fragmented seeks.
    pub first_moof_offset: Option<u64>,
}

/// Walk top-level boxes until the structural prerequisites for playback are
/// met: a movie header or segment index, plus media data or a fragment.
/// Remaining media data is consumed lazily by sample reads.
pub fn parse(source: &Arc<dyn ByteSource>) -> Result<ParsedFile> {
    let mut offset = 0u64;
    let mut scanned = 0usize;
    let mut recognized = false;

    let mut qt_mode = false;
    let mut brand: Option<String> = None;
    let mut movie: Option<MovieInfo> = None;
    let mut sidx: Option<SegmentIndex> = None;
    let mut first_moof_offset: Option<u64> = None;
    let mut mdat_seen = false;

    loop {
        let have_index = movie.is_some() || sidx.is_some();
        let have_media = mdat_seen || first_moof_offset.is_some();
        if have_index && have_media {
            break;
        }

        let Some(header) = boxes::read_header_at(source.as_ref(), offset)? else {
            break;
        };

        scanned += 1;
        match header.fourcc.as_bytes() {
            b"ftyp" | b"styp" => {
                recognized = true;
                let payload = boxes::load_payload(source.as_ref(), offset, &header)?;
                let (major, qt) = parse_ftyp(&payload);
                brand = major;
                qt_mode = qt;
            }
            b"moov" => {
                recognized = true;
                let payload = boxes::load_payload(source.as_ref(), offset, &header)?;
                movie = Some(moov::parse_moov(&payload, qt_mode)?);
            }
            b"sidx" => {
                recognized = true;
                if sidx.is_none() {
                    let payload = boxes::load_payload(source.as_ref(), offset, &header)?;
                    sidx = Some(SegmentIndex::parse(&payload)?);
                }
            }
            b"moof" => {
                recognized = true;
                if first_moof_offset.is_none() {
                    first_moof_offset = Some(offset);
                }
            }
            b"mdat" => {
                mdat_seen = true;
            }
            _ => {
                debug!(tag = %header.fourcc, offset, "skipping top-level box");
            }
        }

        // Advance the cursor; it must strictly move forward every iteration.
        if header.extends_to_end() {
            // Legal only at the top level, and only for sources that report
            // their total length.
            let Some(total) = source.len() else {
                return Err(DemuxError::malformed(
                    "to-end box in a stream of unknown length",
                ));
            };
            offset = total;
        } else {
            if header.size < header.header_len {
                return Err(DemuxError::malformed(format!(
                    "top-level box `{}` size {} smaller than its header",
                    header.fourcc, header.size
                )));
            }
            offset += header.size;
        }

        if !recognized && scanned >= TOP_LEVEL_SCAN_LIMIT {
            return Err(DemuxError::unsupported(
                "no recognizable container structure within the scan limit",
            ));
        }
    }

    let Some(movie) = movie else {
        return Err(DemuxError::unsupported("stream carries no movie box"));
    };

    let fragmented = movie.has_mvex || first_moof_offset.is_some();
    let mut metadata = movie.metadata;
    metadata.brand = brand;

    // Non-fragmented tracks must place samples through their sample table;
    // an empty table in that mode fails the track, not the file.
    let mut tracks = movie.tracks;
    if !fragmented {
        tracks.retain(|track| {
            let keep = track.index.is_some();
            if !keep {
                warn!(track = track.info.id, "dropping track with empty sample table");
            }
            keep
        });
    }

    debug!(
        tracks = tracks.len(),
        fragmented,
        qt = qt_mode,
        "structural parse complete"
    );
    Ok(ParsedFile {
        metadata,
        tracks,
        trex: movie.trex,
        fragmented,
        qt_mode,
        sidx,
        first_moof_offset,
    })
}

/// Major brand plus QuickTime-variant detection from the compatible brands.
fn parse_ftyp(payload: &[u8]) -> (Option<String>, bool) {
    if payload.len() < 4 {
        return (None, false);
    }
    let major: [u8; 4] = [payload[0], payload[1], payload[2], payload[3]];
    let mut qt = &major == b"qt  ";
    // Compatible brands follow the 4-byte minor version.
    let mut at = 8;
    while at + 4 <= payload.len() {
        if &payload[at..at + 4] == b"qt  " {
            qt = true;
        }
        at += 4;
    }
    let major_text = String::from_utf8_lossy(&major).trim().to_string();
    (
        (!major_text.is_empty()).then_some(major_text),
        qt,
    )
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::fourcc::FourCc;
    use crate::test_support::{make_box, make_ftyp, make_moov, make_trak, TrackSpec};
    use demux::MemorySource;

    fn parse_bytes(data: Vec<u8>) -> Result<ParsedFile> {
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(data));
        parse(&source)
    }

    #[test]
    fn test_minimal_file_parses() {
        let mut file = make_ftyp(b"isom", &[b"iso2", b"avc1"]);
        file.extend_from_slice(&make_moov(
            1000,
            333,
            &[make_trak(&TrackSpec::default())],
        ));
        file.extend_from_slice(&make_box(b"mdat", &[0u8; 64]));

        let parsed = parse_bytes(file).unwrap();
        assert_eq!(parsed.tracks.len(), 1);
        assert!(!parsed.fragmented);
        assert!(!parsed.qt_mode);
        assert_eq!(parsed.metadata.brand.as_deref(), Some("isom"));
        assert_eq!(parsed.metadata.duration_us, Some(333_000));
    }

    #[test]
    fn test_qt_brand_flips_mode() {
        let mut file = make_ftyp(b"isom", &[b"qt  "]);
        file.extend_from_slice(&make_moov(1000, 0, &[make_trak(&TrackSpec::default())]));
        file.extend_from_slice(&make_box(b"mdat", &[]));
        assert!(parse_bytes(file).unwrap().qt_mode);
    }

    #[test]
    fn test_partial_track_tolerance() {
        // One valid track plus one lacking its track ID: the registry holds
        // exactly the valid one, and parsing succeeds.
        let good = make_trak(&TrackSpec::default());
        let bad = make_trak(&TrackSpec {
            omit_track_id: true,
            ..TrackSpec::default()
        });
        let mut file = make_ftyp(b"isom", &[]);
        file.extend_from_slice(&make_moov(1000, 0, &[good, bad]));
        file.extend_from_slice(&make_box(b"mdat", &[]));

        let parsed = parse_bytes(file).unwrap();
        assert_eq!(parsed.tracks.len(), 1);
        assert_eq!(parsed.tracks[0].info.id, 1);
    }

    #[test]
    fn test_unsupported_when_nothing_recognized() {
        // A long run of unknown boxes never yields a structure.
        let mut file = Vec::new();
        for _ in 0..TOP_LEVEL_SCAN_LIMIT + 1 {
            file.extend_from_slice(&make_box(b"zzzz", &[0u8; 4]));
        }
        assert!(matches!(
            parse_bytes(file),
            Err(DemuxError::Unsupported(_))
        ));
    }

    #[test]
    fn test_no_moov_is_unsupported() {
        let mut file = make_ftyp(b"isom", &[]);
        file.extend_from_slice(&make_box(b"mdat", &[0u8; 8]));
        assert!(matches!(
            parse_bytes(file),
            Err(DemuxError::Unsupported(_))
        ));
    }

    #[test]
    fn test_undersized_top_level_box_is_malformed() {
        let mut file = make_ftyp(b"isom", &[]);
        // Size 4 < header size 8.
        file.extend_from_slice(&4u32.to_be_bytes());
        file.extend_from_slice(b"trak");
        assert!(matches!(parse_bytes(file), Err(DemuxError::Malformed(_))));
    }

    #[test]
    fn test_size_ceiling_rejects_huge_structural_box() {
        let mut file = make_ftyp(b"isom", &[]);
        // moov claiming a 1 GiB payload.
        file.extend_from_slice(&(1u32 << 30).to_be_bytes());
        file.extend_from_slice(b"moov");
        assert!(matches!(parse_bytes(file), Err(DemuxError::Malformed(_))));
    }

    #[test]
    fn test_stops_before_trailing_garbage() {
        // Termination fires once moov + mdat are seen; trailing bytes that
        // would otherwise be malformed are never visited.
        let mut file = make_ftyp(b"isom", &[]);
        file.extend_from_slice(&make_moov(1000, 0, &[make_trak(&TrackSpec::default())]));
        file.extend_from_slice(&make_box(b"mdat", &[0u8; 16]));
        file.extend_from_slice(&[0xFF; 7]);
        assert!(parse_bytes(file).is_ok());
    }

    #[test]
    fn test_fragmented_detected_by_moof() {
        let mut file = make_ftyp(b"isom", &[]);
        let trak = make_trak(&TrackSpec {
            sample_count: 0,
            ..TrackSpec::default()
        });
        let mvex = crate::test_support::make_mvex(1, 3000, 512, 0);
        file.extend_from_slice(&make_moov(1000, 0, &[trak, mvex]));
        let moof_offset = file.len() as u64;
        file.extend_from_slice(&make_box(b"moof", &[0u8; 8]));

        let parsed = parse_bytes(file).unwrap();
        assert!(parsed.fragmented);
        assert_eq!(parsed.first_moof_offset, Some(moof_offset));
        assert_eq!(parsed.trex.len(), 1);
        // The empty-stbl track survives in fragmented mode.
        assert_eq!(parsed.tracks.len(), 1);
        assert!(parsed.tracks[0].index.is_none());
    }

    #[test]
    fn test_ftyp_styp_equivalent() {
        let (major, qt) = parse_ftyp(b"isomxxxxqt  ");
        assert_eq!(major.as_deref(), Some("isom"));
        assert!(qt);
        assert_eq!(FourCc::new(b"styp").to_string(), "styp");
    }
}
