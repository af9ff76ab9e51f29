//! Box-building helpers for tests.
//!
//! Kept in the library behind the `test-utils` feature so integration tests
//! and downstream crates can synthesize containers without binary fixtures.

/// Concatenate a size+tag header with a payload.
pub fn make_box(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(tag);
    out.extend_from_slice(payload);
    out
}

/// A full box: version + 24-bit flags before the payload.
pub fn make_full_box(tag: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![version, (flags >> 16) as u8, (flags >> 8) as u8, flags as u8];
    body.extend_from_slice(payload);
    make_box(tag, &body)
}

/// Big-endian u32 sequence.
pub fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// `ftyp` with a major brand and compatible brands.
pub fn make_ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> Vec<u8> {
    let mut payload = major.to_vec();
    payload.extend_from_slice(&0u32.to_be_bytes()); // minor version
    for brand in compatible {
        payload.extend_from_slice(*brand);
    }
    make_box(b"ftyp", &payload)
}

/// A visual sample entry: 70 fixed body bytes, then child boxes.
pub fn make_visual_sample_entry(tag: &[u8; 4], width: u16, height: u16, children: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; 70];
    body[24..26].copy_from_slice(&width.to_be_bytes());
    body[26..28].copy_from_slice(&height.to_be_bytes());
    body.extend_from_slice(children);
    make_box(tag, &body)
}

/// An audio sample entry (version 0): 28 fixed body bytes, then children.
pub fn make_audio_sample_entry(
    tag: &[u8; 4],
    channels: u16,
    sample_rate: u32,
    children: &[u8],
) -> Vec<u8> {
    let mut body = vec![0u8; 28];
    body[16..18].copy_from_slice(&channels.to_be_bytes());
    body[24..28].copy_from_slice(&(sample_rate << 16).to_be_bytes());
    body.extend_from_slice(children);
    make_box(tag, &body)
}

/// Description of a synthetic non-fragmented track.
pub struct TrackSpec {
    pub track_id: u32,
    pub timescale: u32,
    /// `hdlr` handler type (`vide`, `soun`, `text`).
    pub handler: [u8; 4],
    /// Complete sample entry box (see the entry builders).
    pub sample_entry: Vec<u8>,
    pub sample_count: u32,
    pub sample_size: u32,
    pub sample_delta: u32,
    pub chunk_offset: u32,
    /// 1-based sync sample numbers; `None` omits `stss` (all sync).
    pub sync_samples: Option<Vec<u32>>,
    /// When true, `tkhd` carries track ID zero (finalization must drop it).
    pub omit_track_id: bool,
}

impl Default for TrackSpec {
    fn default() -> Self {
        Self {
            track_id: 1,
            timescale: 90_000,
            handler: *b"vide",
            sample_entry: make_visual_sample_entry(
                b"avc1",
                320,
                240,
                &make_box(b"avcC", &[0x01, 0x64, 0x00, 0x1F, 0xFF]),
            ),
            sample_count: 10,
            sample_size: 512,
            sample_delta: 3000,
            chunk_offset: 2048,
            sync_samples: None,
            omit_track_id: false,
        }
    }
}

impl TrackSpec {
    /// An AAC-style audio track: `mp4a` entry with an `esds` child.
    pub fn audio(track_id: u32, timescale: u32, sample_count: u32, sample_delta: u32) -> Self {
        Self {
            track_id,
            timescale,
            handler: *b"soun",
            sample_entry: make_audio_sample_entry(
                b"mp4a",
                2,
                timescale,
                &make_box(b"esds", &[0x03, 0x19, 0x00, 0x01, 0x00]),
            ),
            sample_count,
            sample_size: 64,
            sample_delta,
            ..Self::default()
        }
    }
}

pub fn make_trak(spec: &TrackSpec) -> Vec<u8> {
    // tkhd version 0.
    let mut tkhd_payload = vec![0u8; 80];
    let id = if spec.omit_track_id { 0 } else { spec.track_id };
    tkhd_payload[8..12].copy_from_slice(&id.to_be_bytes());
    // Identity matrix.
    tkhd_payload[36..40].copy_from_slice(&0x1_0000u32.to_be_bytes());
    tkhd_payload[52..56].copy_from_slice(&0x1_0000u32.to_be_bytes());
    tkhd_payload[68..72].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    let tkhd = make_full_box(b"tkhd", 0, 0, &tkhd_payload);

    // mdhd version 0, language "und".
    let mut mdhd_payload = vec![0u8; 20];
    mdhd_payload[8..12].copy_from_slice(&spec.timescale.to_be_bytes());
    mdhd_payload[12..16]
        .copy_from_slice(&(spec.sample_count * spec.sample_delta).to_be_bytes());
    let und = (21u16 << 10) | (14 << 5) | 4;
    mdhd_payload[16..18].copy_from_slice(&und.to_be_bytes());
    let mdhd = make_full_box(b"mdhd", 0, 0, &mdhd_payload);

    let mut hdlr_payload = vec![0u8; 4];
    hdlr_payload.extend_from_slice(&spec.handler);
    hdlr_payload.extend_from_slice(&[0u8; 12]);
    let hdlr = make_full_box(b"hdlr", 0, 0, &hdlr_payload);

    let mut stsd_payload = 1u32.to_be_bytes().to_vec();
    stsd_payload.extend_from_slice(&spec.sample_entry);
    let stsd = make_full_box(b"stsd", 0, 0, &stsd_payload);

    let stts = make_full_box(
        b"stts",
        0,
        0,
        &u32s(&[1, spec.sample_count, spec.sample_delta]),
    );
    let stsz = make_full_box(b"stsz", 0, 0, &u32s(&[spec.sample_size, spec.sample_count]));
    let stsc = make_full_box(b"stsc", 0, 0, &u32s(&[1, 1, spec.sample_count, 1]));
    let stco = make_full_box(b"stco", 0, 0, &u32s(&[1, spec.chunk_offset]));

    let mut stbl_payload = [stsd, stts, stsz, stsc, stco].concat();
    if let Some(syncs) = &spec.sync_samples {
        let mut payload = u32s(&[syncs.len() as u32]);
        payload.extend_from_slice(&u32s(syncs));
        stbl_payload.extend_from_slice(&make_full_box(b"stss", 0, 0, &payload));
    }
    let stbl = make_box(b"stbl", &stbl_payload);
    let minf = make_box(b"minf", &stbl);
    let mdia = make_box(b"mdia", &[mdhd, hdlr, minf].concat());
    make_box(b"trak", &[tkhd, mdia].concat())
}

/// `moov` wrapping an `mvhd` plus the given `trak`/`mvex` boxes.
pub fn make_moov(timescale: u32, duration: u32, children: &[Vec<u8>]) -> Vec<u8> {
    let mut mvhd_payload = vec![0u8; 96];
    mvhd_payload[8..12].copy_from_slice(&timescale.to_be_bytes());
    mvhd_payload[12..16].copy_from_slice(&duration.to_be_bytes());
    let mvhd = make_full_box(b"mvhd", 0, 0, &mvhd_payload);

    let mut payload = mvhd;
    for child in children {
        payload.extend_from_slice(child);
    }
    make_box(b"moov", &payload)
}

/// `mvex` with one `trex` entry.
pub fn make_mvex(track_id: u32, duration: u32, size: u32, flags: u32) -> Vec<u8> {
    let trex = make_full_box(b"trex", 0, 0, &u32s(&[track_id, 1, duration, size, flags]));
    make_box(b"mvex", &trex)
}

/// Description of a synthetic fragment (`moof` + `mdat`).
pub struct FragmentSpec {
    pub track_id: u32,
    /// Explicit `tfdt` base decode time, when set.
    pub base_decode_ticks: Option<u64>,
    pub sample_sizes: Vec<u32>,
    pub sample_durations: Vec<u32>,
    /// Emit a per-sample flags column marking only the first sample sync.
    pub first_is_sync: bool,
    /// Emit a bare run of N samples with no per-sample fields (defaults
    /// must cover them).
    pub sample_count_only: Option<u32>,
    /// Raw boxes appended inside the `traf` (e.g. a `senc`).
    pub extra_traf_boxes: Vec<u8>,
}

impl Default for FragmentSpec {
    fn default() -> Self {
        Self {
            track_id: 1,
            base_decode_ticks: None,
            sample_sizes: Vec::new(),
            sample_durations: Vec::new(),
            first_is_sync: false,
            sample_count_only: None,
            extra_traf_boxes: Vec::new(),
        }
    }
}

/// Build one `moof` + `mdat` pair from the description. The `trun` data
/// offset is patched to point at the start of the `mdat` payload.
pub fn make_fragment(spec: &FragmentSpec) -> Vec<u8> {
    let has_per_sample = spec.sample_count_only.is_none();
    let count = spec
        .sample_count_only
        .unwrap_or(spec.sample_sizes.len() as u32);

    let mut trun_flags = 0x1u32; // data offset present
    if has_per_sample {
        trun_flags |= 0x100 | 0x200;
        if spec.first_is_sync {
            trun_flags |= 0x400;
        }
    }

    let mut trun_payload = u32s(&[count, 0 /* data offset patched below */]);
    if has_per_sample {
        for i in 0..count as usize {
            trun_payload.extend_from_slice(&spec.sample_durations[i].to_be_bytes());
            trun_payload.extend_from_slice(&spec.sample_sizes[i].to_be_bytes());
            if spec.first_is_sync {
                let flags = if i == 0 { 0u32 } else { 0x0001_0000 };
                trun_payload.extend_from_slice(&flags.to_be_bytes());
            }
        }
    }
    let trun = make_full_box(b"trun", 0, trun_flags, &trun_payload);

    let tfhd = make_full_box(b"tfhd", 0, 0, &u32s(&[spec.track_id]));
    let tfdt = spec
        .base_decode_ticks
        .map(|ticks| make_full_box(b"tfdt", 1, 0, &ticks.to_be_bytes()))
        .unwrap_or_default();

    let traf_payload = [tfhd.clone(), tfdt.clone(), trun, spec.extra_traf_boxes.clone()].concat();
    let traf = make_box(b"traf", &traf_payload);
    let mfhd = make_full_box(b"mfhd", 0, 0, &u32s(&[1]));
    let mut moof = make_box(b"moof", &[mfhd, traf].concat());

    // Patch the trun data offset now that the moof size is known: the mdat
    // payload begins 8 bytes past the end of the moof.
    let data_offset_at = 8 + 16 + 8 + tfhd.len() + tfdt.len() + 8 + 4 + 4;
    let mdat_payload_start = (moof.len() + 8) as u32;
    moof[data_offset_at..data_offset_at + 4].copy_from_slice(&mdat_payload_start.to_be_bytes());

    let data_len: usize = if has_per_sample {
        spec.sample_sizes.iter().map(|&s| s as usize).sum()
    } else {
        count as usize * 8
    };
    let mdat = make_box(b"mdat", &vec![0xAA; data_len]);

    moof.extend_from_slice(&mdat);
    moof
}
