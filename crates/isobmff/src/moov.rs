//! Movie box (`moov`) parsing: movie header, per-track descriptions, sample
//! tables, fragment defaults and file-level metadata.
//!
//! Track parsing follows a partial-success policy: a track that fails its
//! structural verification is dropped with a warning while its siblings
//! survive.

use bytes::Bytes;
use tracing::{debug, warn};

use demux::{CodecConfig, DemuxError, FileMetadata, Result, TrackEncryption, TrackInfo};
use media_types::{Resolution, Rotation, TimeBase, TrackKind, mime};

use crate::boxes::{BoxView, BoxWalker, field, full_box};
use crate::crypto;
use crate::fourcc::{self, FourCc};
use crate::frag::TrexDefaults;
use crate::meta;
use crate::stbl::SampleTables;
use crate::track::Track;

/// Everything extracted from one `moov` box.
pub struct MovieInfo {
    pub metadata: FileMetadata,
    pub tracks: Vec<Track>,
    pub trex: Vec<TrexDefaults>,
    /// Present when the movie declares `mvex` (fragmented layout).
    pub has_mvex: bool,
}

/// Parse a fully-loaded `moov` payload.
///
/// `qt_mode` switches the QuickTime-variant field layouts on (detected from
/// the file-type box's compatible brands).
pub fn parse_moov(data: &Bytes, qt_mode: bool) -> Result<MovieInfo> {
    let mut metadata = FileMetadata::default();
    let mut tracks = Vec::new();
    let mut trex = Vec::new();
    let mut has_mvex = false;
    let mut movie_time_base: Option<TimeBase> = None;
    let mut movie_duration_ticks = 0u64;
    let mut path: Vec<FourCc> = vec![fourcc::MOOV];

    for child in BoxWalker::over(data) {
        let child = child?;
        match child.fourcc.as_bytes() {
            b"mvhd" => {
                let (time_base, duration) = parse_mvhd(child.body(data))?;
                movie_time_base = Some(time_base);
                movie_duration_ticks = duration;
            }
            b"trak" => {
                match parse_trak(data, child, qt_mode) {
                    Ok(track) => tracks.push(track),
                    // Partial-success: a bad track never aborts its siblings.
                    Err(e) => warn!(error = %e, "dropping malformed track"),
                }
            }
            b"mvex" => {
                has_mvex = true;
                for mvex_child in BoxWalker::new(data, child.body_start, child.body_end) {
                    let mvex_child = mvex_child?;
                    if mvex_child.fourcc == fourcc::TREX {
                        trex.push(parse_trex(mvex_child.body(data))?);
                    }
                }
            }
            b"udta" => meta::parse_udta(data, child, &mut path, &mut metadata),
            // QuickTime puts the keyed metadata directly under moov.
            b"meta" => meta::parse_meta(data, child, &mut path, &mut metadata),
            _ => {}
        }
    }

    if let Some(time_base) = movie_time_base {
        metadata.duration_us = Some(time_base.ticks_to_us(movie_duration_ticks));
    }

    debug!(
        tracks = tracks.len(),
        fragmented = has_mvex,
        "parsed movie box"
    );
    Ok(MovieInfo {
        metadata,
        tracks,
        trex,
        has_mvex,
    })
}

fn parse_mvhd(body: &[u8]) -> Result<(TimeBase, u64)> {
    let (header, payload) = full_box(body)?;
    let (timescale, duration) = if header.version == 1 {
        (field::u32_at(payload, 16)?, field::u64_at(payload, 20)?)
    } else {
        (
            field::u32_at(payload, 8)?,
            field::u32_at(payload, 12)? as u64,
        )
    };
    let time_base =
        TimeBase::new(timescale).ok_or_else(|| DemuxError::malformed("mvhd timescale is zero"))?;
    Ok((time_base, duration))
}

fn parse_trex(body: &[u8]) -> Result<TrexDefaults> {
    let (_, payload) = full_box(body)?;
    Ok(TrexDefaults {
        track_id: field::u32_at(payload, 0)?,
        default_sample_duration: field::u32_at(payload, 8)?,
        default_sample_size: field::u32_at(payload, 12)?,
        default_sample_flags: field::u32_at(payload, 16)?,
    })
}

#[derive(Default)]
struct TrakBuilder {
    track_id: Option<u32>,
    display_width: Option<u32>,
    display_height: Option<u32>,
    rotation: Rotation,
    media_timescale: Option<u32>,
    media_duration_ticks: Option<u64>,
    language: Option<String>,
    handler: Option<FourCc>,
    entry: Option<SampleEntry>,
    tables: SampleTables,
    edit_media_time_ticks: i64,
}

/// What the first recognized `stsd` sample entry contributed.
struct SampleEntry {
    mime: &'static str,
    coded_resolution: Option<Resolution>,
    sample_rate: Option<u32>,
    channel_count: Option<u16>,
    codec_configs: Vec<CodecConfig>,
    encryption: Option<TrackEncryption>,
}

fn parse_trak(data: &Bytes, trak: BoxView, qt_mode: bool) -> Result<Track> {
    let mut builder = TrakBuilder::default();

    for child in BoxWalker::new(data, trak.body_start, trak.body_end) {
        let child = child?;
        match child.fourcc.as_bytes() {
            b"tkhd" => parse_tkhd(child.body(data), &mut builder)?,
            b"edts" => {
                if let Some(elst) =
                    crate::boxes::find_child(data, child.body_start, child.body_end, fourcc::ELST)?
                {
                    builder.edit_media_time_ticks = parse_elst(elst.body(data))?;
                }
            }
            b"mdia" => parse_mdia(data, child, qt_mode, &mut builder)?,
            _ => {}
        }
    }

    builder.finalize()
}

fn parse_tkhd(body: &[u8], builder: &mut TrakBuilder) -> Result<()> {
    let (header, payload) = full_box(body)?;
    let (id_at, post_duration_at) = if header.version == 1 {
        (16usize, 32usize)
    } else {
        (8usize, 20usize)
    };
    let track_id = field::u32_at(payload, id_at)?;
    if track_id == 0 {
        // Absent/zeroed track ID fails finalization later.
        return Ok(());
    }
    builder.track_id = Some(track_id);

    // reserved(8) layer(2) alternate_group(2) volume(2) reserved(2).
    let matrix_at = post_duration_at + 16;
    let a = field::i32_at(payload, matrix_at)?;
    let b = field::i32_at(payload, matrix_at + 4)?;
    let c = field::i32_at(payload, matrix_at + 12)?;
    let d = field::i32_at(payload, matrix_at + 16)?;
    builder.rotation = rotation_from_matrix(a, b, c, d);

    // Width/height are 16.16 fixed point display dimensions.
    let width = field::u32_at(payload, matrix_at + 36)? >> 16;
    let height = field::u32_at(payload, matrix_at + 40)? >> 16;
    if width > 0 && height > 0 {
        builder.display_width = Some(width);
        builder.display_height = Some(height);
    }
    Ok(())
}

/// Recognize the four cardinal rotations in the transform matrix; anything
/// else is treated as unrotated.
fn rotation_from_matrix(a: i32, b: i32, c: i32, d: i32) -> Rotation {
    const ONE: i32 = 0x1_0000;
    match (a, b, c, d) {
        (0, ONE, x, 0) if x == -ONE => Rotation::R90,
        (x, 0, 0, y) if x == -ONE && y == -ONE => Rotation::R180,
        (0, x, ONE, 0) if x == -ONE => Rotation::R270,
        _ => Rotation::R0,
    }
}

/// First edit-list entry's media time, used as an initial presentation
/// offset. An empty edit (`media_time == -1`) is skipped.
fn parse_elst(body: &[u8]) -> Result<i64> {
    let (header, payload) = full_box(body)?;
    let count = field::u32_at(payload, 0)? as usize;
    let mut at = 4usize;
    for _ in 0..count {
        let media_time = if header.version == 1 {
            let value = field::u64_at(payload, at + 8)? as i64;
            at += 20;
            value
        } else {
            let value = field::i32_at(payload, at + 4)? as i64;
            at += 12;
            value
        };
        if media_time >= 0 {
            return Ok(media_time);
        }
    }
    Ok(0)
}

fn parse_mdia(
    data: &Bytes,
    mdia: BoxView,
    qt_mode: bool,
    builder: &mut TrakBuilder,
) -> Result<()> {
    for child in BoxWalker::new(data, mdia.body_start, mdia.body_end) {
        let child = child?;
        match child.fourcc.as_bytes() {
            b"mdhd" => parse_mdhd(child.body(data), builder)?,
            b"hdlr" => {
                let (_, payload) = full_box(child.body(data))?;
                if payload.len() >= 8 {
                    builder.handler = Some(FourCc([
                        payload[4], payload[5], payload[6], payload[7],
                    ]));
                }
            }
            b"minf" => {
                if let Some(stbl) =
                    crate::boxes::find_child(data, child.body_start, child.body_end, fourcc::STBL)?
                {
                    parse_stbl(data, stbl, qt_mode, builder)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_mdhd(body: &[u8], builder: &mut TrakBuilder) -> Result<()> {
    let (header, payload) = full_box(body)?;
    let (timescale, duration, language_at) = if header.version == 1 {
        (
            field::u32_at(payload, 16)?,
            field::u64_at(payload, 20)?,
            28usize,
        )
    } else {
        (
            field::u32_at(payload, 8)?,
            field::u32_at(payload, 12)? as u64,
            16usize,
        )
    };
    builder.media_timescale = Some(timescale);
    builder.media_duration_ticks = Some(duration);

    let packed = field::u16_at(payload, language_at)?;
    builder.language = decode_language(packed);
    Ok(())
}

/// ISO-639-2 language packed as three 5-bit letters offset from 0x60.
fn decode_language(packed: u16) -> Option<String> {
    let chars = [
        ((packed >> 10) & 0x1F) as u8 + 0x60,
        ((packed >> 5) & 0x1F) as u8 + 0x60,
        (packed & 0x1F) as u8 + 0x60,
    ];
    if chars.iter().all(|c| c.is_ascii_lowercase()) {
        Some(String::from_utf8_lossy(&chars).into_owned())
    } else {
        None
    }
}

fn parse_stbl(
    data: &Bytes,
    stbl: BoxView,
    qt_mode: bool,
    builder: &mut TrakBuilder,
) -> Result<()> {
    for child in BoxWalker::new(data, stbl.body_start, stbl.body_end) {
        let child = child?;
        let body = child.body(data);
        match child.fourcc.as_bytes() {
            b"stsd" => builder.entry = parse_stsd(data, child, qt_mode)?,
            b"stts" => builder.tables.parse_stts(body)?,
            b"ctts" => builder.tables.parse_ctts(body)?,
            b"stss" => builder.tables.parse_stss(body)?,
            b"stsz" => builder.tables.parse_stsz(body)?,
            b"stsc" => builder.tables.parse_stsc(body)?,
            b"stco" => builder.tables.parse_chunk_offsets(body, false)?,
            b"co64" => builder.tables.parse_chunk_offsets(body, true)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_stsd(data: &Bytes, stsd: BoxView, qt_mode: bool) -> Result<Option<SampleEntry>> {
    let body = stsd.body(data);
    let (_, payload) = full_box(body)?;
    let entry_count = field::u32_at(payload, 0)? as usize;

    let entries_start = stsd.body_start + 8;
    let mut walker = BoxWalker::new(data, entries_start, stsd.body_end);
    for _ in 0..entry_count {
        let Some(entry) = walker.next() else { break };
        let entry = entry?;
        // The first recognized entry describes the track.
        if let Some(parsed) = parse_sample_entry(data, entry, qt_mode)? {
            return Ok(Some(parsed));
        }
        debug!(tag = %entry.fourcc, "skipping unrecognized sample entry");
    }
    Ok(None)
}

/// Child boxes of a visual sample entry begin after its 70 fixed body bytes
/// (78 per ISO 14496-12, minus the 8-byte box header).
const VISUAL_ENTRY_FIELDS: usize = 70;

fn parse_sample_entry(data: &Bytes, entry: BoxView, qt_mode: bool) -> Result<Option<SampleEntry>> {
    match entry.fourcc.as_bytes() {
        b"avc1" | b"avc3" => visual_entry(data, entry, mime::VIDEO_AVC, "avcC").map(Some),
        b"hvc1" | b"hev1" => visual_entry(data, entry, mime::VIDEO_HEVC, "hvcC").map(Some),
        b"av01" => visual_entry(data, entry, mime::VIDEO_AV1, "av1C").map(Some),
        b"mp4v" => visual_entry(data, entry, mime::VIDEO_MP4V, "esds").map(Some),
        b"mp4a" => audio_entry(data, entry, mime::AUDIO_AAC, qt_mode).map(Some),
        b"ac-3" => audio_entry(data, entry, mime::AUDIO_AC3, qt_mode).map(Some),
        b"ec-3" => audio_entry(data, entry, mime::AUDIO_EAC3, qt_mode).map(Some),
        b"Opus" => audio_entry(data, entry, mime::AUDIO_OPUS, qt_mode).map(Some),
        b"tx3g" => Ok(Some(SampleEntry {
            mime: mime::TEXT_3GPP,
            coded_resolution: None,
            sample_rate: None,
            channel_count: None,
            codec_configs: Vec::new(),
            encryption: None,
        })),
        b"encv" => protected_entry(data, entry, qt_mode, true).map(Some),
        b"enca" => protected_entry(data, entry, qt_mode, false).map(Some),
        _ => Ok(None),
    }
}

fn visual_entry(
    data: &Bytes,
    entry: BoxView,
    mime: &'static str,
    config_key: &'static str,
) -> Result<SampleEntry> {
    let body = entry.body(data);
    let width = field::u16_at(body, 24)? as u32;
    let height = field::u16_at(body, 26)? as u32;

    let mut codec_configs = Vec::new();
    if entry.body_start + VISUAL_ENTRY_FIELDS < entry.body_end {
        for child in BoxWalker::new(data, entry.body_start + VISUAL_ENTRY_FIELDS, entry.body_end) {
            let Ok(child) = child else { break };
            let tag = fourcc_as_config_key(child.fourcc);
            if let Some(key) = tag {
                codec_configs.push(CodecConfig {
                    key,
                    data: child.body_bytes(data),
                });
            }
        }
    }

    // A track missing the decoder config appropriate to its MIME type fails
    // structural verification.
    if !codec_configs.iter().any(|c| c.key == config_key) {
        return Err(DemuxError::malformed(format!(
            "{mime} sample entry lacks its `{config_key}` decoder configuration"
        )));
    }

    Ok(SampleEntry {
        mime,
        coded_resolution: (width > 0 && height > 0).then(|| Resolution::new(width, height)),
        sample_rate: None,
        channel_count: None,
        codec_configs,
        encryption: None,
    })
}

fn fourcc_as_config_key(tag: FourCc) -> Option<&'static str> {
    match tag.as_bytes() {
        b"avcC" => Some("avcC"),
        b"hvcC" => Some("hvcC"),
        b"av1C" => Some("av1C"),
        b"esds" => Some("esds"),
        b"dOps" => Some("dOps"),
        b"dac3" => Some("dac3"),
        b"dec3" => Some("dec3"),
        _ => None,
    }
}

fn audio_entry(
    data: &Bytes,
    entry: BoxView,
    mime: &'static str,
    qt_mode: bool,
) -> Result<SampleEntry> {
    let body = entry.body(data);
    let version = field::u16_at(body, 8)?;

    // QuickTime version 1 inserts 16 bytes of per-packet fields before the
    // child boxes; version 2 replaces the fixed fields wholesale.
    let (channels, sample_rate, children_at) = match version {
        2 => {
            let sample_rate_bits = field::u64_at(body, 32)?;
            let channels = field::u32_at(body, 40)? as u16;
            (channels, f64::from_bits(sample_rate_bits) as u32, 64usize)
        }
        1 => {
            let children_at = if qt_mode { 44 } else { 28 };
            (
                field::u16_at(body, 16)?,
                field::u32_at(body, 24)? >> 16,
                children_at,
            )
        }
        _ => (
            field::u16_at(body, 16)?,
            field::u32_at(body, 24)? >> 16,
            28usize,
        ),
    };

    let mut codec_configs = Vec::new();
    if entry.body_start + children_at < entry.body_end {
        for child in BoxWalker::new(data, entry.body_start + children_at, entry.body_end) {
            let Ok(child) = child else { break };
            if let Some(key) = fourcc_as_config_key(child.fourcc) {
                codec_configs.push(CodecConfig {
                    key,
                    data: child.body_bytes(data),
                });
            } else if qt_mode && child.fourcc == FourCc::new(b"wave") {
                // QuickTime wraps the elementary stream descriptor in `wave`.
                for inner in BoxWalker::new(data, child.body_start, child.body_end) {
                    let Ok(inner) = inner else { break };
                    if inner.fourcc == fourcc::ESDS {
                        codec_configs.push(CodecConfig {
                            key: "esds",
                            data: inner.body_bytes(data),
                        });
                    }
                }
            }
        }
    }

    if mime == mime::AUDIO_AAC && !qt_mode && !codec_configs.iter().any(|c| c.key == "esds") {
        return Err(DemuxError::malformed(
            "mp4a sample entry lacks its `esds` decoder configuration",
        ));
    }

    Ok(SampleEntry {
        mime,
        coded_resolution: None,
        sample_rate: Some(sample_rate),
        channel_count: Some(channels),
        codec_configs,
        encryption: None,
    })
}

/// `encv`/`enca` wrap an ordinary entry; `sinf/frma` names the original
/// format and `sinf/schi/tenc` carries the track-encryption defaults.
fn protected_entry(
    data: &Bytes,
    entry: BoxView,
    qt_mode: bool,
    is_video: bool,
) -> Result<SampleEntry> {
    let children_at = if is_video { VISUAL_ENTRY_FIELDS } else { 28 };
    let mut original_format: Option<FourCc> = None;
    let mut scheme = String::new();
    let mut tenc: Option<TrackEncryption> = None;

    if entry.body_start + children_at < entry.body_end {
        for child in BoxWalker::new(data, entry.body_start + children_at, entry.body_end) {
            let Ok(child) = child else { break };
            if child.fourcc != fourcc::SINF {
                continue;
            }
            for sinf_child in BoxWalker::new(data, child.body_start, child.body_end) {
                let sinf_child = sinf_child?;
                match sinf_child.fourcc.as_bytes() {
                    b"frma" => {
                        let body = sinf_child.body(data);
                        if body.len() >= 4 {
                            original_format =
                                Some(FourCc([body[0], body[1], body[2], body[3]]));
                        }
                    }
                    b"schm" => {
                        let (_, payload) = full_box(sinf_child.body(data))?;
                        if payload.len() >= 4 {
                            scheme = String::from_utf8_lossy(&payload[..4]).into_owned();
                        }
                    }
                    b"schi" => {
                        if let Some(tenc_view) = crate::boxes::find_child(
                            data,
                            sinf_child.body_start,
                            sinf_child.body_end,
                            fourcc::TENC,
                        )? {
                            tenc = Some(crypto::parse_tenc(
                                tenc_view.body(data),
                                scheme.clone(),
                            )?);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let original =
        original_format.ok_or_else(|| DemuxError::malformed("protected entry lacks frma"))?;
    let encryption =
        Some(tenc.ok_or_else(|| DemuxError::malformed("protected entry lacks tenc"))?);

    // Re-parse the entry as its original format; the fixed fields and the
    // remaining children (decoder config) are laid out identically.
    let mut inner = match original.as_bytes() {
        b"avc1" | b"avc3" => visual_entry(data, entry, mime::VIDEO_AVC, "avcC")?,
        b"hvc1" | b"hev1" => visual_entry(data, entry, mime::VIDEO_HEVC, "hvcC")?,
        b"av01" => visual_entry(data, entry, mime::VIDEO_AV1, "av1C")?,
        b"mp4a" => audio_entry(data, entry, mime::AUDIO_AAC, qt_mode)?,
        _ => {
            return Err(DemuxError::unsupported(format!(
                "protected original format `{original}`"
            )));
        }
    };
    inner.encryption = encryption;
    Ok(inner)
}

impl TrakBuilder {
    /// Structural verification; failures drop this track only.
    fn finalize(self) -> Result<Track> {
        let track_id = self
            .track_id
            .ok_or_else(|| DemuxError::malformed("track lacks a track ID"))?;
        let timescale = self.media_timescale.unwrap_or(0);
        let time_base = TimeBase::new(timescale)
            .ok_or_else(|| DemuxError::malformed("track media timescale is zero"))?;
        let entry = self
            .entry
            .ok_or_else(|| DemuxError::malformed("track has no usable sample description"))?;

        let kind = TrackKind::from_mime(entry.mime);
        let index = self.tables.build_index(time_base)?;

        let duration_us = self
            .media_duration_ticks
            .map(|ticks| time_base.ticks_to_us(ticks))
            .filter(|&us| us > 0)
            .or_else(|| (!index.is_empty()).then(|| index.total_duration_us()));

        let display_resolution = match (self.display_width, self.display_height) {
            (Some(w), Some(h)) => Some(Resolution::new(w, h)),
            _ => None,
        };

        let info = TrackInfo {
            id: track_id,
            mime: entry.mime.to_string(),
            kind,
            time_base,
            duration_us,
            language: self.language,
            resolution: entry.coded_resolution,
            display_resolution: display_resolution
                .filter(|d| Some(*d) != entry.coded_resolution),
            rotation: self.rotation,
            sample_rate: entry.sample_rate,
            channel_count: entry.channel_count,
            codec_configs: entry.codec_configs,
            encryption: entry.encryption,
            sample_count: index.len() as u64,
        };

        let index = (!index.is_empty()).then_some(index);
        Ok(Track::new(info, index, self.edit_media_time_ticks))
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_matrix() {
        const ONE: i32 = 0x1_0000;
        assert_eq!(rotation_from_matrix(ONE, 0, 0, ONE), Rotation::R0);
        assert_eq!(rotation_from_matrix(0, ONE, -ONE, 0), Rotation::R90);
        assert_eq!(rotation_from_matrix(-ONE, 0, 0, -ONE), Rotation::R180);
        assert_eq!(rotation_from_matrix(0, -ONE, ONE, 0), Rotation::R270);
        // Arbitrary shear falls back to unrotated.
        assert_eq!(rotation_from_matrix(123, 456, 789, 1), Rotation::R0);
    }

    #[test]
    fn test_language_decoding() {
        // "und" packs as (21,14,4): ((21<<10)|(14<<5)|4).
        let und = (21u16 << 10) | (14 << 5) | 4;
        assert_eq!(decode_language(und).as_deref(), Some("und"));
        // "eng" = (5,14,7).
        let eng = (5u16 << 10) | (14 << 5) | 7;
        assert_eq!(decode_language(eng).as_deref(), Some("eng"));
        assert_eq!(decode_language(0), None);
    }
}
