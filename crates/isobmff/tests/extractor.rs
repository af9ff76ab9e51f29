//! End-to-end extractor tests over synthesized containers.

use std::sync::Arc;

use demux::{
    ByteSource, CachingSource, DemuxError, MediaExtractor, MemorySource, Probe, SeekMode,
    TrackSource,
};
use isobmff::IsobmffExtractor;
use isobmff::test_support::{
    FragmentSpec, TrackSpec, make_box, make_fragment, make_ftyp, make_moov, make_mvex, make_trak,
};
use tokio_util::sync::CancellationToken;

/// Build a playable non-fragmented file: ftyp + moov + mdat, with the chunk
/// offset patched to the real mdat payload position and per-sample payloads
/// tagged by sample number.
fn make_indexed_file(sync_samples: Option<Vec<u32>>) -> Vec<u8> {
    let sample_count = 10u32;
    let sample_size = 512u32;

    // First pass to learn the mdat payload offset.
    let mut spec = TrackSpec {
        sync_samples: sync_samples.clone(),
        chunk_offset: 0,
        ..TrackSpec::default()
    };
    let prefix_len = {
        let mut file = make_ftyp(b"isom", &[b"iso2"]);
        file.extend_from_slice(&make_moov(1000, 333, &[make_trak(&spec)]));
        file.len() + 8
    };

    spec.chunk_offset = prefix_len as u32;
    let mut file = make_ftyp(b"isom", &[b"iso2"]);
    file.extend_from_slice(&make_moov(1000, 333, &[make_trak(&spec)]));

    let mut payload = Vec::new();
    for i in 0..sample_count {
        payload.extend_from_slice(&vec![i as u8; sample_size as usize]);
    }
    file.extend_from_slice(&make_box(b"mdat", &payload));
    file
}

fn open(file: Vec<u8>) -> IsobmffExtractor {
    let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(file));
    IsobmffExtractor::read(source).unwrap()
}

#[test]
fn reads_every_sample_in_order() {
    let extractor = open(make_indexed_file(None));
    assert_eq!(extractor.tracks().len(), 1);
    let info = &extractor.tracks()[0];
    assert_eq!(info.mime, "video/avc");
    assert_eq!(info.sample_count, 10);

    let mut source = TrackSource::open(&extractor, 0).unwrap();
    for i in 0..10 {
        let sample = source.read_sample(false).unwrap();
        assert_eq!(sample.data.len(), 512);
        assert_eq!(sample.data[0], i as u8);
        assert_eq!(
            sample.decode_time_us,
            i as i64 * 3000 * 1_000_000 / 90_000
        );
        assert!(sample.is_sync);
    }
    assert!(source.read_sample(false).unwrap_err().is_end_of_stream());
}

#[test]
fn closest_seek_decodes_from_sync_and_reports_target() {
    // Syncs at samples 1 and 9 (1-based): indexes 0 and 8.
    let extractor = open(make_indexed_file(Some(vec![1, 9])));
    let mut source = TrackSource::open(&extractor, 0).unwrap();

    // Sample 5 decodes at 166666us; closest-mode seek there must restart
    // decode at sample 0 (previous sync) while reporting sample 5's time.
    source.seek_to(166_666, SeekMode::Closest);
    let sample = source.read_sample(false).unwrap();
    assert_eq!(sample.data[0], 0); // decoding restarted at the sync sample
    assert_eq!(sample.target_time_us, Some(166_666));

    // Subsequent reads carry no target time.
    let next = source.read_sample(false).unwrap();
    assert_eq!(next.target_time_us, None);
}

#[test]
fn sync_seek_modes_land_on_syncs() {
    let extractor = open(make_indexed_file(Some(vec![1, 9])));
    let mut source = TrackSource::open(&extractor, 0).unwrap();

    source.seek_to(166_666, SeekMode::NextSync);
    let sample = source.read_sample(false).unwrap();
    assert_eq!(sample.data[0], 8);
    assert!(sample.is_sync);
    assert_eq!(sample.target_time_us, None);

    source.seek_to(166_666, SeekMode::PreviousSync);
    let sample = source.read_sample(false).unwrap();
    assert_eq!(sample.data[0], 0);
}

#[test]
fn probe_recognizes_and_instantiates() {
    let mut probe = Probe::new().with_min_sniff_bytes(64);
    probe.register(IsobmffExtractor::descriptor());

    let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(make_indexed_file(None)));
    let extractor = probe.format(source, &CancellationToken::new()).unwrap();
    assert_eq!(extractor.tracks().len(), 1);
}

#[test]
fn probe_rejects_foreign_bytes() {
    let mut probe = Probe::new().with_min_sniff_bytes(16);
    probe.register(IsobmffExtractor::descriptor());

    let source: Arc<dyn ByteSource> =
        Arc::new(MemorySource::new(b"#!EXTM3U\nnothing-here".to_vec()));
    assert!(matches!(
        probe.format(source, &CancellationToken::new()),
        Err(DemuxError::Unsupported(_))
    ));
}

/// Fragmented file: moov with mvex declares the track; samples arrive in two
/// chained fragments.
fn make_fragmented_file() -> Vec<u8> {
    let trak = make_trak(&TrackSpec {
        sample_count: 0,
        ..TrackSpec::default()
    });
    let mvex = make_mvex(1, 3000, 0, 0);
    let mut file = make_ftyp(b"isom", &[]);
    file.extend_from_slice(&make_moov(1000, 0, &[trak, mvex]));

    let frag_a = make_fragment(&FragmentSpec {
        track_id: 1,
        base_decode_ticks: Some(0),
        sample_sizes: vec![16, 16],
        sample_durations: vec![3000, 3000],
        first_is_sync: true,
        ..FragmentSpec::default()
    });
    let frag_b = make_fragment(&FragmentSpec {
        track_id: 1,
        base_decode_ticks: Some(6000),
        sample_sizes: vec![16],
        sample_durations: vec![3000],
        first_is_sync: true,
        ..FragmentSpec::default()
    });
    file.extend_from_slice(&frag_a);
    file.extend_from_slice(&frag_b);
    file
}

#[test]
fn fragmented_read_chains_fragments() {
    let extractor = open(make_fragmented_file());
    assert!(extractor.is_fragmented());
    let mut source = TrackSource::open(&extractor, 0).unwrap();

    let times: Vec<i64> = (0..3)
        .map(|_| source.read_sample(false).unwrap().decode_time_us)
        .collect();
    // 3000 ticks at 90kHz = 33333us per sample, across both fragments.
    assert_eq!(times, vec![0, 33_333, 66_666]);
    assert!(source.read_sample(false).unwrap_err().is_end_of_stream());
}

#[test]
fn fragmented_seek_without_sidx_restarts() {
    let extractor = open(make_fragmented_file());
    let mut source = TrackSource::open(&extractor, 0).unwrap();

    // Consume everything, then seek: without a segment index the read
    // position degrades to the first fragment.
    while source.read_sample(false).is_ok() {}
    source.seek_to(66_000, SeekMode::PreviousSync);
    let sample = source.read_sample(false).unwrap();
    assert_eq!(sample.decode_time_us, 0);
}

#[test]
fn non_blocking_read_reports_would_block_until_cached() {
    let file = make_indexed_file(None);
    let total = file.len() as u64;
    let inner: Arc<dyn ByteSource> = Arc::new(MemorySource::new(file));
    let cache = CachingSource::new(inner);

    // Cache everything up to (but not including) the last sample.
    cache.advance(total - 256);
    let extractor = IsobmffExtractor::read(cache.clone()).unwrap();
    let mut source = TrackSource::open(&extractor, 0).unwrap();

    for _ in 0..9 {
        source.read_sample(true).unwrap();
    }
    // The tenth sample's byte range is not cached yet.
    assert!(source.read_sample(true).unwrap_err().is_would_block());

    cache.advance(512);
    let sample = source.read_sample(true).unwrap();
    assert_eq!(sample.data[0], 9);
}

#[test]
fn thumbnail_time_is_exposed() {
    let extractor = open(make_indexed_file(Some(vec![1, 9])));
    // All samples share a size, so the first considered sync wins.
    assert_eq!(extractor.thumbnail_time_us(0), Some(0));
    assert_eq!(extractor.thumbnail_time_us(7), None);
}

#[test]
fn metadata_duration_from_movie_header() {
    let extractor = open(make_indexed_file(None));
    assert_eq!(extractor.metadata().duration_us, Some(333_000));
    assert_eq!(extractor.metadata().brand.as_deref(), Some("isom"));
}
