//! Orchestrator integration tests over synthesized containers and the
//! simulated decoder/renderer/audio collaborators.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use demux::{ByteSource, CachingSource, MemorySource};
use isobmff::test_support::{TrackSpec, make_box, make_ftyp, make_moov, make_trak};
use playback::actors::CapabilityProvider;
use playback::clock::SystemClock;
use playback::sim::SimFactory;
use playback::{
    InfoEvent, Notification, PlaybackError, Player, PlayerConfig, ResourceLimiter,
};

struct OffloadEverything;

impl CapabilityProvider for OffloadEverything {
    fn supports_audio_offload(&self, _info: &demux::TrackInfo) -> bool {
        true
    }
}

#[derive(Clone, Default)]
struct Recorder {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl Recorder {
    fn listener(&self) -> playback::Listener {
        let notifications = Arc::clone(&self.notifications);
        Arc::new(move |n| notifications.lock().push(n))
    }

    fn has(&self, wanted: &Notification) -> bool {
        self.notifications.lock().iter().any(|n| n == wanted)
    }

    fn wait_for(&self, wanted: Notification, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.has(&wanted) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

/// A short A/V file: `frames` video samples at ~33ms plus an audio track of
/// matching (or given) duration.
fn make_av_file(video_frames: u32, audio_ms: u32) -> Vec<u8> {
    // Two-pass build so chunk offsets land inside the real mdat payload.
    let video_payload_len = video_frames * 64;
    let build = |video_offset: u32, audio_offset: u32| {
        let video = make_trak(&TrackSpec {
            track_id: 1,
            sample_count: video_frames,
            sample_size: 64,
            sample_delta: 3000, // 33.3ms at 90kHz
            chunk_offset: video_offset,
            ..TrackSpec::default()
        });
        // 10ms audio frames at a 1kHz timescale.
        let audio = make_trak(&TrackSpec {
            chunk_offset: audio_offset,
            ..TrackSpec::audio(2, 1000, audio_ms / 10, 10)
        });
        let mut file = make_ftyp(b"isom", &[b"iso2"]);
        file.extend_from_slice(&make_moov(1000, 0, &[video, audio]));
        file
    };

    let prefix = build(0, 0).len() as u32 + 8;
    let mut file = build(prefix, prefix + video_payload_len);
    let audio_payload_len = (audio_ms / 10) * 64;
    file.extend_from_slice(&make_box(
        b"mdat",
        &vec![0u8; (video_payload_len + audio_payload_len) as usize],
    ));
    file
}

fn fast_config() -> PlayerConfig {
    PlayerConfig {
        min_sniff_bytes: 64,
        buffering_poll_interval: Duration::from_millis(20),
        audio_status_poll_interval: Duration::from_millis(20),
        paused_audio_teardown: Duration::from_millis(50),
        ..PlayerConfig::default()
    }
}

fn make_player(offload: bool) -> (Player, Arc<SimFactory>, Recorder) {
    let factory = Arc::new(SimFactory::new(Arc::new(SystemClock::new())));
    let capabilities: Arc<dyn CapabilityProvider> = if offload {
        Arc::new(OffloadEverything)
    } else {
        Arc::new(playback::actors::SoftwareOnly)
    };
    let player = Player::with_config(
        fast_config(),
        factory.clone(),
        capabilities,
        ResourceLimiter::new(2),
    );
    let recorder = Recorder::default();
    player.set_listener(recorder.listener());
    (player, factory, recorder)
}

#[test]
fn prepare_selects_one_audio_one_video() {
    let (player, _factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(5, 200))))
        .unwrap();
    player.prepare().unwrap();

    assert!(recorder.has(&Notification::Prepared));
    let tracks = player.track_info();
    assert_eq!(tracks.len(), 2);
    assert!(player.get_duration() > 0);
    assert_eq!(player.get_position(), 0);
}

#[test]
fn plays_to_completion_and_fires_single_complete() {
    let (player, factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(5, 150))))
        .unwrap();
    player.prepare().unwrap();
    player.play().unwrap();

    assert!(recorder.wait_for(Notification::Started, Duration::from_secs(2)));
    assert!(recorder.wait_for(Notification::PlaybackComplete, Duration::from_secs(5)));
    assert!(recorder.has(&Notification::Info(InfoEvent::RenderingStart)));

    let rendered = factory.render_stats().lock().rendered;
    assert!(rendered >= 1, "no frames rendered");

    // Completion fired exactly once.
    let completes = recorder
        .notifications
        .lock()
        .iter()
        .filter(|n| matches!(n, Notification::PlaybackComplete))
        .count();
    assert_eq!(completes, 1);
}

#[test]
fn completion_requires_both_tracks_eos() {
    // Audio runs well past the video track: completion must wait for it.
    let (player, _factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(2, 500))))
        .unwrap();
    player.prepare().unwrap();
    player.play().unwrap();

    // Video (2 frames, ~66ms) finishes long before audio (500ms).
    std::thread::sleep(Duration::from_millis(250));
    assert!(
        !recorder.has(&Notification::PlaybackComplete),
        "completed before audio reached EOS"
    );
    assert!(recorder.wait_for(Notification::PlaybackComplete, Duration::from_secs(5)));
}

#[test]
fn completion_with_audio_first_then_video() {
    // Audio shorter than video: the join fires only once video ends too.
    let (player, _factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(12, 50))))
        .unwrap();
    player.prepare().unwrap();
    player.play().unwrap();
    assert!(recorder.wait_for(Notification::PlaybackComplete, Duration::from_secs(5)));
}

#[test]
fn play_and_pause_are_idempotent() {
    let (player, _factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(30, 1000))))
        .unwrap();
    player.prepare().unwrap();

    player.play().unwrap();
    player.play().unwrap();
    player.pause().unwrap();
    player.pause().unwrap();
    assert!(recorder.has(&Notification::Paused));

    // Position holds steady while paused.
    let position = player.get_position();
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(player.get_position(), position);
}

#[test]
fn control_calls_require_prepare() {
    let (player, _factory, _recorder) = make_player(false);
    assert!(matches!(
        player.play(),
        Err(PlaybackError::InvalidState(_))
    ));
    assert!(matches!(
        player.seek_to(0),
        Err(PlaybackError::InvalidState(_))
    ));
    assert!(matches!(
        player.prepare(),
        Err(PlaybackError::InvalidState(_))
    ));
}

#[test]
fn seek_while_playing_reports_paused_then_seek_complete() {
    let (player, _factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(30, 1000))))
        .unwrap();
    player.prepare().unwrap();
    player.play().unwrap();
    assert!(recorder.wait_for(
        Notification::Info(InfoEvent::RenderingStart),
        Duration::from_secs(2)
    ));

    player.seek_to(500_000).unwrap();
    // UI convention: an in-flight seek immediately reports paused.
    assert!(recorder.has(&Notification::Paused));
    assert!(recorder.wait_for(Notification::SeekComplete, Duration::from_secs(2)));
    assert!(player.get_position() >= 400_000);
}

#[test]
fn audio_only_seek_completes_directly() {
    let audio = make_trak(&TrackSpec {
        chunk_offset: 0,
        ..TrackSpec::audio(1, 1000, 100, 10)
    });
    let mut file = make_ftyp(b"isom", &[]);
    file.extend_from_slice(&make_moov(1000, 1000, &[audio]));
    let prefix = file.len() as u32 + 8;
    // Rebuild with the right chunk offset.
    let audio = make_trak(&TrackSpec {
        chunk_offset: prefix,
        ..TrackSpec::audio(1, 1000, 100, 10)
    });
    let mut file = make_ftyp(b"isom", &[]);
    file.extend_from_slice(&make_moov(1000, 1000, &[audio]));
    file.extend_from_slice(&make_box(b"mdat", &vec![0u8; 100 * 64]));

    let (player, _factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(file)))
        .unwrap();
    player.prepare().unwrap();
    player.seek_to(300_000).unwrap();
    assert!(recorder.has(&Notification::SeekComplete));
    assert_eq!(player.get_position(), 300_000);
}

#[test]
fn networked_prepare_waits_for_watermark() {
    let file = make_av_file(5, 100);
    let total = file.len() as u64;
    let inner: Arc<dyn ByteSource> = Arc::new(MemorySource::new(file));
    let cache = CachingSource::new(inner);

    let (player, _factory, recorder) = make_player(false);
    player.set_data_source(cache.clone()).unwrap();

    // Enough cached to sniff, but below the high watermark.
    cache.advance(256);
    player.prepare_async().unwrap();

    std::thread::sleep(Duration::from_millis(150));
    assert!(
        !recorder.has(&Notification::Prepared),
        "prepared before the cache filled"
    );

    cache.advance(total);
    assert!(recorder.wait_for(Notification::Prepared, Duration::from_secs(2)));
    assert!(recorder
        .notifications
        .lock()
        .iter()
        .any(|n| matches!(n, Notification::BufferingUpdate { .. })));
}

#[test]
fn offload_teardown_after_long_pause_then_transparent_resume() {
    let (player, _factory, recorder) = make_player(true);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(30, 1000))))
        .unwrap();
    player.prepare().unwrap();
    player.play().unwrap();
    assert!(recorder.wait_for(Notification::Started, Duration::from_secs(2)));

    player.pause().unwrap();
    // Teardown is configured at 50ms; wait for the deferred event.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if player.dump().contains("offload_teardowns=1") {
            break;
        }
        assert!(Instant::now() < deadline, "audio never torn down: {}", player.dump());
        std::thread::sleep(Duration::from_millis(10));
    }

    // Resuming playback transparently rebuilds the audio path.
    player.play().unwrap();
    assert!(recorder.wait_for(Notification::PlaybackComplete, Duration::from_secs(10)));
}

#[test]
fn offload_start_failure_falls_back_to_software() {
    let (player, factory, recorder) = make_player(true);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(5, 100))))
        .unwrap();
    player.prepare().unwrap();

    factory.fail_audio_starts(1);
    player.play().unwrap();
    assert!(player.dump().contains("software=1"), "{}", player.dump());
    assert!(recorder.wait_for(Notification::PlaybackComplete, Duration::from_secs(5)));
}

#[test]
fn reset_returns_to_idle_and_notifies_stopped() {
    let (player, _factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(5, 100))))
        .unwrap();
    player.prepare().unwrap();
    player.play().unwrap();

    player.reset();
    assert!(recorder.has(&Notification::Stopped));
    assert!(matches!(
        player.play(),
        Err(PlaybackError::InvalidState(_))
    ));
    assert_eq!(player.get_position(), 0);

    // The player is reusable after reset.
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(5, 100))))
        .unwrap();
    player.prepare().unwrap();
}

#[test]
fn looping_restarts_without_completing() {
    let (player, factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(3, 60))))
        .unwrap();
    player.prepare().unwrap();
    player.set_looping(true);
    player.play().unwrap();

    // Enough wall time for several loops of the ~100ms file.
    std::thread::sleep(Duration::from_millis(600));
    assert!(
        !recorder.has(&Notification::PlaybackComplete),
        "looping session completed"
    );
    let rendered = factory.render_stats().lock().rendered;
    assert!(rendered > 3, "only {rendered} frames rendered across loops");
    player.reset();
}

#[test]
fn suspend_and_resume_restore_position() {
    let (player, _factory, recorder) = make_player(false);
    player
        .set_data_source(Arc::new(MemorySource::new(make_av_file(30, 1000))))
        .unwrap();
    player.prepare().unwrap();
    player.play().unwrap();
    assert!(recorder.wait_for(
        Notification::Info(InfoEvent::RenderingStart),
        Duration::from_secs(2)
    ));

    player.suspend().unwrap();
    let position = player.get_position();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(player.get_position(), position);

    player.resume().unwrap();
    assert!(recorder.wait_for(Notification::PlaybackComplete, Duration::from_secs(10)));
}

#[test]
fn dump_reports_state_and_counters() {
    let (player, _factory, _recorder) = make_player(false);
    let dump = player.dump();
    assert!(dump.contains("state: Idle"));
    assert!(dump.contains("frames: rendered=0"));
}
