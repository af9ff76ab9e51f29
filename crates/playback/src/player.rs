//! The sync orchestrator: owns the selected tracks' readers, the decoders
//! and sinks, the clocks, and drives all state transitions through one
//! serialized event queue.
//!
//! Locking model: externally-invoked control calls take the coarse session
//! mutex; event handlers run one at a time on the queue worker and take the
//! same mutex for the duration of each handler. The statistics record and
//! the duration/position scalars sit behind their own finer locks so
//! diagnostics and position polling never contend with playback. Blocking
//! work (container parsing, sniff prefetch) runs with the coarse lock
//! released.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use demux::{
    ByteSource, FileSource, MediaExtractor, Probe, SeekMode, TrackInfo, TrackSource,
};
use isobmff::IsobmffExtractor;
use media_types::TrackKind;

use crate::actors::{AudioPath, CapabilityProvider, DecoderFactory};
use crate::buffering::{BufferingEvent, BufferingMonitor};
use crate::clock::{ClockSource, SystemClock};
use crate::config::PlayerConfig;
use crate::drift::DriftEstimator;
use crate::error::PlaybackError;
use crate::events::EventQueue;
use crate::limiter::{ResourceLimiter, ResourcePermit};
use crate::policy::{self, PolicyContext, VideoAction};
use crate::state::{
    InfoEvent, Listener, Notification, PrepareStage, SessionFlags, SessionState, VideoScalingMode,
};
use crate::stats::SessionStats;
use crate::video::{FrameRead, VideoPath};

const EVENT_VIDEO: &str = "video";
const EVENT_BUFFERING: &str = "buffering";
const EVENT_AUDIO_STATUS: &str = "audio-status";
const EVENT_AUDIO_TEARDOWN: &str = "audio-teardown";
const EVENT_STREAM_DONE: &str = "stream-done";

/// Brands that mark adaptive-streaming content, for which the skip-ahead
/// catch-up heuristic is disabled.
const ADAPTIVE_BRANDS: &[&str] = &["dash", "msdh", "msix", "iso5", "iso6"];

struct AudioState {
    path: Box<dyn AudioPath>,
    offloaded: bool,
    _permit: Option<ResourcePermit>,
}

#[derive(Debug, Clone, Copy)]
struct PendingSeek {
    target_us: i64,
    /// Internal refinement seek; completes without notifications.
    video_only: bool,
    /// Audio follows once the video side of the seek lands.
    two_phase_audio: bool,
    /// Already applied to the video read options.
    applied: bool,
}

#[derive(Debug, Clone, Copy)]
struct SavedSession {
    position_us: i64,
    was_playing: bool,
}

#[derive(Default)]
struct PositionInfo {
    duration_us: i64,
    position_us: i64,
}

struct SessionCore {
    state: SessionState,
    flags: SessionFlags,
    /// Suppresses stale deferred notifications after rapid seek/pause.
    generation: u64,
    source: Option<Arc<dyn ByteSource>>,
    extractor: Option<Arc<dyn MediaExtractor>>,
    video: Option<VideoPath>,
    audio: Option<AudioState>,
    selected_video: Option<usize>,
    selected_audio: Option<usize>,
    text_tracks: Vec<usize>,
    seek: Option<PendingSeek>,
    drift: DriftEstimator,
    monitor: BufferingMonitor,
    /// (media, real) anchor pair for clock estimation without audio.
    media_anchor_us: i64,
    anchor_real_us: i64,
    prepare_token: Option<CancellationToken>,
    saved_session: Option<SavedSession>,
    adaptive_content: bool,
    scaling: VideoScalingMode,
    last_drop_media_us: Option<i64>,
    rendering_started: bool,
}

impl SessionCore {
    fn new(config: &PlayerConfig) -> Self {
        Self {
            state: SessionState::Idle,
            flags: SessionFlags::default(),
            generation: 0,
            source: None,
            extractor: None,
            video: None,
            audio: None,
            selected_video: None,
            selected_audio: None,
            text_tracks: Vec::new(),
            seek: None,
            drift: DriftEstimator::new(),
            monitor: BufferingMonitor::new(config.watermarks),
            media_anchor_us: 0,
            anchor_real_us: 0,
            prepare_token: None,
            saved_session: None,
            adaptive_content: false,
            scaling: VideoScalingMode::default(),
            last_drop_media_us: None,
            rendering_started: false,
        }
    }

    /// Estimated current media time.
    ///
    /// With an audio path, (system, audio) pairs feed the drift estimator
    /// and the smoothed fit is used instead of raw device readings; the
    /// sink's own (real, media) anchor continuously overrides the stored
    /// anchor. Without audio, the system clock runs from the last anchor.
    fn media_now(&mut self, now_us: i64) -> i64 {
        // A finished audio clock stops; time then extrapolates from the
        // last anchor on the system clock instead.
        if let Some(audio) = &self.audio
            && !audio.path.reached_eos()
            && let Some(position) = audio.path.position_us()
        {
            self.drift.add_sample(now_us, position);
            if let Some((real, media)) = audio.path.realtime_anchor() {
                self.media_anchor_us = media;
                self.anchor_real_us = real;
            }
            return self.drift.estimated_audio_time(now_us).unwrap_or(position);
        }
        if matches!(self.state, SessionState::Playing) && !self.flags.cache_underrun {
            self.media_anchor_us + (now_us - self.anchor_real_us)
        } else {
            self.media_anchor_us
        }
    }

    fn is_networked(&self) -> bool {
        self.source.as_ref().is_some_and(|s| !s.is_local())
    }

    /// Approximate bytes consumed at the current position, for watermark
    /// evaluation against the cache prefix.
    fn consumed_bytes_estimate(&self, position_us: i64) -> u64 {
        let Some(source) = &self.source else { return 0 };
        match source.cache_status().bitrate_bps {
            Some(bitrate) if position_us > 0 => {
                (position_us as u64).saturating_mul(bitrate as u64 / 8) / 1_000_000
            }
            _ => 0,
        }
    }
}

pub struct Player {
    inner: Arc<PlayerInner>,
}

pub(crate) struct PlayerInner {
    config: PlayerConfig,
    queue: EventQueue,
    clock: Arc<dyn ClockSource>,
    session: Mutex<SessionCore>,
    position: Mutex<PositionInfo>,
    stats: Mutex<SessionStats>,
    listener: Mutex<Option<Listener>>,
    factory: Arc<dyn DecoderFactory>,
    capabilities: Arc<dyn CapabilityProvider>,
    limiter: Arc<ResourceLimiter>,
}

impl Player {
    pub fn new(
        factory: Arc<dyn DecoderFactory>,
        capabilities: Arc<dyn CapabilityProvider>,
        limiter: Arc<ResourceLimiter>,
    ) -> Self {
        Self::with_config(PlayerConfig::default(), factory, capabilities, limiter)
    }

    pub fn with_config(
        config: PlayerConfig,
        factory: Arc<dyn DecoderFactory>,
        capabilities: Arc<dyn CapabilityProvider>,
        limiter: Arc<ResourceLimiter>,
    ) -> Self {
        Self::with_clock(
            config,
            Arc::new(SystemClock::new()),
            factory,
            capabilities,
            limiter,
        )
    }

    pub fn with_clock(
        config: PlayerConfig,
        clock: Arc<dyn ClockSource>,
        factory: Arc<dyn DecoderFactory>,
        capabilities: Arc<dyn CapabilityProvider>,
        limiter: Arc<ResourceLimiter>,
    ) -> Self {
        let core = SessionCore::new(&config);
        Self {
            inner: Arc::new(PlayerInner {
                config,
                queue: EventQueue::new(),
                clock,
                session: Mutex::new(core),
                position: Mutex::new(PositionInfo::default()),
                stats: Mutex::new(SessionStats::default()),
                listener: Mutex::new(None),
                factory,
                capabilities,
                limiter,
            }),
        }
    }

    pub fn set_listener(&self, listener: Listener) {
        *self.inner.listener.lock() = Some(listener);
    }

    /// Attach a byte source. Only legal before prepare.
    pub fn set_data_source(&self, source: Arc<dyn ByteSource>) -> Result<(), PlaybackError> {
        let mut core = self.inner.session.lock();
        if !matches!(core.state, SessionState::Idle) {
            return Err(PlaybackError::InvalidState("set_data_source after prepare"));
        }
        core.source = Some(source);
        core.extractor = None;
        Ok(())
    }

    pub fn set_data_source_path(&self, path: impl AsRef<Path>) -> Result<(), PlaybackError> {
        let source = FileSource::open(path).map_err(PlaybackError::Demux)?;
        self.set_data_source(Arc::new(source))
    }

    /// Attach an already-instantiated extractor, bypassing probing.
    pub fn set_data_source_extractor(
        &self,
        extractor: Arc<dyn MediaExtractor>,
    ) -> Result<(), PlaybackError> {
        let mut core = self.inner.session.lock();
        if !matches!(core.state, SessionState::Idle) {
            return Err(PlaybackError::InvalidState("set_data_source after prepare"));
        }
        core.extractor = Some(extractor);
        Ok(())
    }

    /// Synchronous prepare: blocks until the session is ready or failed.
    pub fn prepare(&self) -> Result<(), PlaybackError> {
        let token = self.begin_prepare()?;
        PlayerInner::do_prepare(&self.inner, token.clone())?;
        // A networked prepare finishes its buffering phase on the event
        // queue; block here until it settles, honoring cancellation.
        loop {
            {
                let core = self.inner.session.lock();
                if !core.state.is_preparing() {
                    return Ok(());
                }
            }
            if token.is_cancelled() {
                return Err(PlaybackError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Asynchronous prepare: returns immediately; completion is delivered
    /// through the listener. Shares the implementation with [`prepare`].
    pub fn prepare_async(&self) -> Result<(), PlaybackError> {
        let token = self.begin_prepare()?;
        let inner = Arc::downgrade(&self.inner);
        self.inner.queue.post(move || {
            if let Some(inner) = inner.upgrade() {
                let _ = PlayerInner::do_prepare(&inner, token);
            }
        });
        Ok(())
    }

    fn begin_prepare(&self) -> Result<CancellationToken, PlaybackError> {
        let mut core = self.inner.session.lock();
        if !matches!(core.state, SessionState::Idle) {
            return Err(PlaybackError::InvalidState("prepare from non-idle state"));
        }
        if core.source.is_none() && core.extractor.is_none() {
            return Err(PlaybackError::InvalidState("prepare without a data source"));
        }
        core.state = SessionState::Preparing(PrepareStage::Connecting);
        let token = CancellationToken::new();
        core.prepare_token = Some(token.clone());
        Ok(token)
    }

    /// Cooperatively cancel an in-flight prepare.
    pub fn cancel_prepare(&self) {
        let core = self.inner.session.lock();
        if let Some(token) = &core.prepare_token {
            token.cancel();
        }
    }

    pub fn play(&self) -> Result<(), PlaybackError> {
        PlayerInner::play(&self.inner)
    }

    pub fn pause(&self) -> Result<(), PlaybackError> {
        PlayerInner::pause(&self.inner)
    }

    pub fn seek_to(&self, time_us: i64) -> Result<(), PlaybackError> {
        PlayerInner::seek_to(&self.inner, time_us)
    }

    pub fn get_duration(&self) -> i64 {
        self.inner.position.lock().duration_us
    }

    pub fn get_position(&self) -> i64 {
        self.inner.position.lock().position_us
    }

    pub fn set_looping(&self, looping: bool) {
        self.inner.session.lock().flags.looping = looping;
    }

    pub fn set_video_scaling_mode(&self, mode: VideoScalingMode) {
        let mut core = self.inner.session.lock();
        core.scaling = mode;
        if let Some(video) = core.video.as_mut() {
            video.set_scaling(mode);
        }
    }

    pub fn track_info(&self) -> Vec<TrackInfo> {
        let core = self.inner.session.lock();
        core.extractor
            .as_ref()
            .map(|e| e.tracks().to_vec())
            .unwrap_or_default()
    }

    /// Toggle a timed-text track. The single audio/video selection is fixed
    /// at prepare time.
    pub fn select_track(&self, index: usize, enable: bool) -> Result<(), PlaybackError> {
        let mut guard = self.inner.session.lock();
        let core = &mut *guard;
        let Some(extractor) = core.extractor.as_ref() else {
            return Err(PlaybackError::InvalidState("select_track before prepare"));
        };
        let Some(info) = extractor.tracks().get(index) else {
            return Err(PlaybackError::InvalidState("track index out of range"));
        };
        match info.kind {
            TrackKind::Text => {
                if enable && !core.text_tracks.contains(&index) {
                    core.text_tracks.push(index);
                } else if !enable {
                    core.text_tracks.retain(|&t| t != index);
                }
                core.flags.text_running = !core.text_tracks.is_empty();
                Ok(())
            }
            _ => {
                // Re-selecting the active track is an idempotent no-op.
                if enable
                    && (core.selected_audio == Some(index) || core.selected_video == Some(index))
                {
                    Ok(())
                } else {
                    Err(PlaybackError::InvalidState(
                        "audio/video selection is fixed after prepare",
                    ))
                }
            }
        }
    }

    /// Release decoder and renderer resources without destroying the
    /// session; [`resume`](Self::resume) reacquires them.
    pub fn suspend(&self) -> Result<(), PlaybackError> {
        let inner = &self.inner;
        let mut guard = inner.session.lock();
        let core = &mut *guard;
        if !core.state.is_ready() {
            return Err(PlaybackError::InvalidState("suspend before prepared"));
        }
        let was_playing = matches!(core.state, SessionState::Playing);
        let position_us = inner.position.lock().position_us;
        core.saved_session = Some(SavedSession {
            position_us,
            was_playing,
        });
        if let Some(mut audio) = core.audio.take() {
            audio.path.teardown();
        }
        core.video = None;
        core.flags.audio_running = false;
        core.state = SessionState::Prepared;
        inner.queue.cancel(EVENT_VIDEO);
        inner.queue.cancel(EVENT_AUDIO_STATUS);
        debug!(position_us, was_playing, "session suspended");
        Ok(())
    }

    /// Rebuild the decode paths after [`suspend`](Self::suspend), restoring
    /// position and play state.
    pub fn resume(&self) -> Result<(), PlaybackError> {
        let inner = &self.inner;
        let saved = {
            let mut core = inner.session.lock();
            let Some(saved) = core.saved_session.take() else {
                return Err(PlaybackError::InvalidState("resume without suspend"));
            };
            PlayerInner::rebuild_paths(inner, &mut core, saved.position_us)?;
            saved
        };
        if saved.was_playing {
            PlayerInner::play(inner)?;
        }
        Ok(())
    }

    /// Full reset to the idle state.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.queue.cancel_all();
        {
            let mut core = inner.session.lock();
            if let Some(token) = core.prepare_token.take() {
                token.cancel();
            }
            if let Some(mut audio) = core.audio.take() {
                audio.path.teardown();
            }
            *core = SessionCore::new(&inner.config);
        }
        *inner.position.lock() = PositionInfo::default();
        inner.stats.lock().reset();
        inner.notify(Notification::Stopped);
    }

    pub fn stop(&self) {
        self.reset();
    }

    /// Diagnostics dump; reads only the finer locks so it never blocks
    /// playback.
    pub fn dump(&self) -> String {
        let stats = self.inner.stats.lock().dump();
        let state = match self.inner.session.try_lock() {
            Some(core) => format!("{:?}", core.state),
            None => "<busy>".to_string(),
        };
        format!("state: {state}\n{stats}")
    }
}

impl PlayerInner {
    fn notify(&self, notification: Notification) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(notification);
        }
    }

    fn notify_all(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.notify(notification);
        }
    }

    fn post_video_event(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.queue.post_in(Some(EVENT_VIDEO), delay, move || {
            if let Some(inner) = weak.upgrade() {
                PlayerInner::on_video_event(&inner);
            }
        });
    }

    fn post_buffering_event(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.queue.post_in(Some(EVENT_BUFFERING), delay, move || {
            if let Some(inner) = weak.upgrade() {
                PlayerInner::on_buffering_event(&inner);
            }
        });
    }

    fn post_audio_status_event(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.queue
            .post_in(Some(EVENT_AUDIO_STATUS), delay, move || {
                if let Some(inner) = weak.upgrade() {
                    PlayerInner::on_audio_status_event(&inner);
                }
            });
    }

    fn post_stream_done(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.queue
            .post_in(Some(EVENT_STREAM_DONE), Duration::ZERO, move || {
                if let Some(inner) = weak.upgrade() {
                    PlayerInner::on_stream_done(&inner);
                }
            });
    }

    fn post_audio_teardown(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.queue
            .post_in(Some(EVENT_AUDIO_TEARDOWN), delay, move || {
                if let Some(inner) = weak.upgrade() {
                    PlayerInner::on_audio_teardown(&inner);
                }
            });
    }

    // ------------------------------------------------------------------
    // Prepare
    // ------------------------------------------------------------------

    fn do_prepare(inner: &Arc<Self>, token: CancellationToken) -> Result<(), PlaybackError> {
        // Blocking resolution happens with the session lock released so a
        // concurrent cancel/reset is never stalled behind a slow source.
        let (source, preset) = {
            let core = inner.session.lock();
            (core.source.clone(), core.extractor.clone())
        };

        let extractor: Arc<dyn MediaExtractor> = match preset {
            Some(extractor) => extractor,
            None => {
                let source = source
                    .clone()
                    .ok_or(PlaybackError::InvalidState("prepare without a data source"))?;
                let mut probe = Probe::new().with_min_sniff_bytes(inner.config.min_sniff_bytes);
                probe.register(IsobmffExtractor::descriptor());
                match probe.format(source, &token) {
                    Ok(extractor) => Arc::from(extractor),
                    Err(e) => {
                        let e = PlaybackError::Demux(e);
                        Self::fail_prepare(inner, &e);
                        return Err(e);
                    }
                }
            }
        };

        let mut notifications = Vec::new();
        {
            let mut guard = inner.session.lock();
            let core = &mut *guard;
            if token.is_cancelled() {
                core.state = SessionState::Idle;
                core.prepare_token = None;
                return Err(PlaybackError::Cancelled);
            }

            // Select at most one audio and one video elementary track, in
            // track order, plus every timed-text track.
            let tracks = extractor.tracks();
            core.selected_audio = tracks.iter().position(|t| t.kind == TrackKind::Audio);
            core.selected_video = tracks.iter().position(|t| t.kind == TrackKind::Video);
            core.text_tracks = tracks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.kind == TrackKind::Text)
                .map(|(i, _)| i)
                .collect();
            core.adaptive_content = extractor
                .metadata()
                .brand
                .as_deref()
                .is_some_and(|b| ADAPTIVE_BRANDS.contains(&b));
            core.extractor = Some(Arc::clone(&extractor));

            let duration_us = Self::session_duration_us(&extractor);
            {
                let mut position = inner.position.lock();
                position.duration_us = duration_us;
                position.position_us = 0;
            }

            if let Err(e) = Self::rebuild_paths(inner, core, 0) {
                drop(guard);
                Self::fail_prepare(inner, &e);
                return Err(e);
            }

            if core.is_networked() {
                // Connected; the buffering monitor decides when enough data
                // has arrived to finish the prepare.
                core.state = SessionState::Preparing(PrepareStage::Buffering);
                if let Some(source) = &core.source {
                    source.resume_fetch();
                }
            } else {
                core.state = SessionState::Prepared;
                core.prepare_token = None;
                notifications.push(Notification::Prepared);
            }
        }

        if inner.session.lock().state.is_preparing() {
            inner.post_buffering_event(Duration::ZERO);
        }
        inner.notify_all(notifications);
        info!("prepare complete");
        Ok(())
    }

    fn session_duration_us(extractor: &Arc<dyn MediaExtractor>) -> i64 {
        let from_tracks = extractor
            .tracks()
            .iter()
            .filter_map(|t| t.duration_us)
            .max()
            .unwrap_or(0);
        extractor
            .metadata()
            .duration_us
            .unwrap_or(0)
            .max(from_tracks)
    }

    fn fail_prepare(inner: &Arc<Self>, error: &PlaybackError) {
        warn!(error = %error, "prepare failed");
        {
            let mut core = inner.session.lock();
            core.state = SessionState::Idle;
            core.prepare_token = None;
        }
        inner.notify(Notification::Error {
            kind: error.kind(),
            detail: error.to_string(),
        });
    }

    /// (Re)construct the video path and audio path from the live extractor.
    /// A video start failure aborts; an audio offload failure falls back to
    /// the software path once before surfacing.
    fn rebuild_paths(
        inner: &Arc<Self>,
        core: &mut SessionCore,
        position_us: i64,
    ) -> Result<(), PlaybackError> {
        let Some(extractor) = core.extractor.clone() else {
            return Err(PlaybackError::InvalidState("no extractor"));
        };

        if core.video.is_none()
            && let Some(index) = core.selected_video
        {
            let source = TrackSource::open(extractor.as_ref(), index)?;
            let info = source.info().clone();
            let decoder = inner.factory.video_decoder(&info)?;
            let renderer = inner.factory.video_renderer(&info)?;
            let mut video = VideoPath::new(source, decoder, renderer);
            video.set_scaling(core.scaling);
            if position_us > 0 {
                video.seek(position_us, SeekMode::ClosestSync);
            }
            core.video = Some(video);
        }

        if core.audio.is_none()
            && let Some(index) = core.selected_audio
        {
            let info = extractor.tracks()[index].clone();
            let wants_offload = inner.capabilities.supports_audio_offload(&info);
            let permit = if wants_offload {
                inner.limiter.try_acquire()
            } else {
                None
            };
            let offloaded = permit.is_some();

            let source = TrackSource::open(extractor.as_ref(), index)?;
            let mut audio = match inner.factory.audio_path(source, offloaded) {
                Ok(path) => AudioState {
                    path,
                    offloaded,
                    _permit: permit,
                },
                Err(e) if offloaded => {
                    // One software fallback at the current position.
                    warn!(error = %e, "offload audio path failed, falling back to software");
                    inner.stats.lock().software_fallbacks += 1;
                    let source = TrackSource::open(extractor.as_ref(), index)?;
                    AudioState {
                        path: inner.factory.audio_path(source, false)?,
                        offloaded: false,
                        _permit: None,
                    }
                }
                Err(e) => return Err(e),
            };
            if position_us > 0 {
                audio.path.seek_to(position_us)?;
            }
            core.audio = Some(audio);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    fn play(inner: &Arc<Self>) -> Result<(), PlaybackError> {
        let mut notifications = Vec::new();
        let start_video;
        let poll_audio;
        let poll_buffering;
        let generation;
        {
            let mut guard = inner.session.lock();
            let core = &mut *guard;
            match core.state {
                // Playing an already-playing session is a no-op success.
                SessionState::Playing => return Ok(()),
                SessionState::Prepared | SessionState::Paused | SessionState::AtEos => {}
                _ => return Err(PlaybackError::InvalidState("play before prepared")),
            }

            // Transparent rebuild after an offload power-down.
            if core.audio.is_none()
                && core.selected_audio.is_some()
                && let Some(saved) = core.saved_session.take()
            {
                debug!("rebuilding audio path after offload teardown");
                Self::rebuild_paths(inner, core, saved.position_us)?;
            }

            if matches!(core.state, SessionState::AtEos) {
                // Restart from the top.
                core.seek = Some(PendingSeek {
                    target_us: 0,
                    video_only: false,
                    two_phase_audio: false,
                    applied: false,
                });
                core.flags.seek_pending = true;
                core.flags.clear_eos();
                core.media_anchor_us = 0;
                if let Some(audio) = core.audio.as_mut() {
                    audio.path.seek_to(0)?;
                }
            }

            if let Some(audio) = core.audio.as_mut() {
                match audio.path.start() {
                    Ok(()) => core.flags.audio_running = true,
                    Err(e) if audio.offloaded => {
                        // One software-fallback attempt at the current
                        // position before surfacing the error.
                        warn!(error = %e, "offloaded audio start failed, retrying in software");
                        let position_us = inner.position.lock().position_us;
                        audio.path.teardown();
                        core.audio = None;
                        inner.stats.lock().software_fallbacks += 1;
                        Self::rebuild_software_audio(inner, core, position_us)?;
                        if let Some(audio) = core.audio.as_mut() {
                            audio.path.start()?;
                            core.flags.audio_running = true;
                        }
                    }
                    Err(e) => {
                        notifications.push(Notification::Error {
                            kind: e.kind(),
                            detail: e.to_string(),
                        });
                        inner.notify_all(notifications);
                        return Err(e);
                    }
                }
            }

            core.state = SessionState::Playing;
            core.anchor_real_us = inner.clock.now_us();
            core.generation += 1;
            generation = core.generation;
            start_video = core.video.is_some();
            poll_audio = core.audio.is_some();
            poll_buffering = core.is_networked();
            inner.queue.cancel(EVENT_AUDIO_TEARDOWN);
        }

        // Deferred start notification, suppressed if the generation moved
        // (rapid seek/pause before the event fired).
        let weak = Arc::downgrade(inner);
        inner.queue.post(move || {
            if let Some(inner) = weak.upgrade() {
                let still_current = {
                    let core = inner.session.lock();
                    core.generation == generation
                        && matches!(core.state, SessionState::Playing)
                };
                if still_current {
                    inner.notify(Notification::Started);
                }
            }
        });

        if start_video {
            inner.post_video_event(Duration::ZERO);
        }
        if poll_audio {
            inner.post_audio_status_event(inner.config.audio_status_poll_interval);
        }
        if poll_buffering {
            inner.post_buffering_event(Duration::ZERO);
        }
        inner.notify_all(notifications);
        Ok(())
    }

    fn rebuild_software_audio(
        inner: &Arc<Self>,
        core: &mut SessionCore,
        position_us: i64,
    ) -> Result<(), PlaybackError> {
        let Some(extractor) = core.extractor.clone() else {
            return Err(PlaybackError::InvalidState("no extractor"));
        };
        let Some(index) = core.selected_audio else {
            return Ok(());
        };
        let source = TrackSource::open(extractor.as_ref(), index)?;
        let mut path = inner.factory.audio_path(source, false)?;
        if position_us > 0 {
            path.seek_to(position_us)?;
        }
        core.audio = Some(AudioState {
            path,
            offloaded: false,
            _permit: None,
        });
        Ok(())
    }

    fn pause(inner: &Arc<Self>) -> Result<(), PlaybackError> {
        let mut teardown_delay = None;
        {
            let mut guard = inner.session.lock();
            let core = &mut *guard;
            match core.state {
                // Symmetric idempotence with play().
                SessionState::Paused | SessionState::Prepared | SessionState::AtEos => {
                    return Ok(());
                }
                SessionState::Playing => {}
                _ => return Err(PlaybackError::InvalidState("pause before prepared")),
            }

            let now = inner.clock.now_us();
            core.media_anchor_us = core.media_now(now);

            let flush_committed = core.flags.audio_at_eos;
            if let Some(audio) = core.audio.as_mut() {
                // At end of stream, committed device samples finish
                // flushing; otherwise they are discarded.
                audio.path.pause(flush_committed);
                core.flags.audio_running = false;
                if audio.offloaded {
                    teardown_delay = Some(inner.config.paused_audio_teardown);
                }
            }
            core.state = SessionState::Paused;
        }
        if let Some(delay) = teardown_delay {
            inner.post_audio_teardown(delay);
        }
        inner.notify(Notification::Paused);
        Ok(())
    }

    fn seek_to(inner: &Arc<Self>, time_us: i64) -> Result<(), PlaybackError> {
        let mut notifications = Vec::new();
        let mut kick_video = false;
        {
            let mut guard = inner.session.lock();
            let core = &mut *guard;
            if !core.state.is_ready() {
                return Err(PlaybackError::InvalidState("seek before prepared"));
            }
            let now = inner.clock.now_us();
            inner.stats.lock().note_seek_started(now);

            // A seek cancels any pending end-of-stream condition.
            core.flags.clear_eos();
            inner.queue.cancel(EVENT_STREAM_DONE);
            if matches!(core.state, SessionState::AtEos) {
                core.state = SessionState::Paused;
            }

            if matches!(core.state, SessionState::Playing) {
                // UI-facing convention: a seek while playing reports paused
                // immediately, and the generation bump suppresses any stale
                // started notification from before the seek.
                core.generation += 1;
                notifications.push(Notification::Paused);
            }

            core.media_anchor_us = time_us;
            core.anchor_real_us = now;
            core.drift.reset();

            if core.video.is_some() {
                // Two-phase (video first, audio follows) when the read
                // cursor would otherwise oscillate between distant byte
                // offsets: network-streamed sources and offloaded audio.
                let two_phase = core.is_networked()
                    || core.audio.as_ref().is_some_and(|a| a.offloaded);
                core.seek = Some(PendingSeek {
                    target_us: time_us,
                    video_only: false,
                    two_phase_audio: two_phase,
                    applied: false,
                });
                core.flags.seek_pending = true;
                if !two_phase && let Some(audio) = core.audio.as_mut() {
                    audio.path.seek_to(time_us)?;
                }
                kick_video = matches!(core.state, SessionState::Playing);
            } else if let Some(audio) = core.audio.as_mut() {
                // Audio-only: seek the audio path directly.
                audio.path.seek_to(time_us)?;
                inner.stats.lock().note_seek_finished(now);
                notifications.push(Notification::SeekComplete);
            }

            inner.position.lock().position_us = time_us;
        }

        if kick_video {
            inner.post_video_event(Duration::ZERO);
        }
        inner.notify_all(notifications);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timed events
    // ------------------------------------------------------------------

    fn on_video_event(inner: &Arc<Self>) {
        let mut notifications = Vec::new();
        let repost = {
            let mut guard = inner.session.lock();
            Self::video_step(inner, &mut guard, &mut notifications)
        };
        inner.notify_all(notifications);
        if let Some(delay) = repost {
            inner.post_video_event(delay);
        }
    }

    /// One firing of the video timed event. Returns the re-post delay, or
    /// `None` when the loop should stop (EOS, error, not playing).
    fn video_step(
        inner: &Arc<Self>,
        core: &mut SessionCore,
        notifications: &mut Vec<Notification>,
    ) -> Option<Duration> {
        if !matches!(core.state, SessionState::Playing) {
            return None;
        }
        if core.flags.cache_underrun {
            // Wait out the buffering pause.
            return Some(Duration::from_millis(100));
        }
        if core.video.is_none() {
            return None;
        }

        // Apply a pending seek to the read options, selecting the
        // sync-search mode by seek kind: user seeks restart from a sync
        // sample, video-only refinements land on the closest sample.
        if let Some(mut seek) = core.seek.take() {
            if !seek.applied {
                let mode = if seek.video_only {
                    SeekMode::Closest
                } else {
                    SeekMode::ClosestSync
                };
                if let Some(video) = core.video.as_mut() {
                    video.seek(seek.target_us, mode);
                }
                core.flags.clear_eos();
                core.last_drop_media_us = None;
                core.rendering_started = false;
                seek.applied = true;
            }
            core.seek = Some(seek);
        }

        let frame = {
            let video = core.video.as_mut().expect("checked above");
            match video.read_frame() {
                Ok(FrameRead::Frame(frame)) => frame,
                Ok(FrameRead::EndOfStream) => {
                    Self::finalize_seek(inner, core, notifications);
                    // A stalled audio path waiting on this video frame gets
                    // started before completion is evaluated.
                    if let Some(audio) = core.audio.as_mut()
                        && !core.flags.audio_running
                        && audio.path.start().is_ok()
                    {
                        core.flags.audio_running = true;
                    }
                    core.flags.video_at_eos = true;
                    inner.post_stream_done();
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "video read failed");
                    notifications.push(Notification::Error {
                        kind: e.kind(),
                        detail: e.to_string(),
                    });
                    core.state = SessionState::Paused;
                    if let Some(audio) = core.audio.as_mut() {
                        audio.path.pause(false);
                        core.flags.audio_running = false;
                    }
                    return None;
                }
            }
        };

        let now = inner.clock.now_us();
        let media_now = core.media_now(now);
        let lateness = media_now - frame.presentation_time_us;
        {
            let mut stats = inner.stats.lock();
            stats.worst_video_lateness_us = stats.worst_video_lateness_us.max(lateness);
        }

        let ctx = PolicyContext {
            audio_available: core.audio.as_ref().is_some_and(|a| a.path.position_us().is_some()),
            adaptive_content: core.adaptive_content,
            seek_in_flight: core.flags.seek_pending,
            last_drop_media_us: core.last_drop_media_us,
            media_now_us: media_now,
        };

        match policy::decide(lateness, &inner.config, &ctx) {
            VideoAction::CatchUpSeek => {
                debug!(lateness, "video badly late, seeking ahead to audio time");
                if let Some(video) = core.video.as_mut() {
                    video.discard(&frame);
                }
                core.seek = Some(PendingSeek {
                    target_us: media_now,
                    video_only: true,
                    two_phase_audio: false,
                    applied: false,
                });
                core.flags.seek_pending = true;
                notifications.push(Notification::Info(InfoEvent::VideoTrackLagging {
                    ms: lateness / 1000,
                }));
                Some(Duration::ZERO)
            }
            VideoAction::Drop => {
                if let Some(video) = core.video.as_mut() {
                    video.discard(&frame);
                }
                core.last_drop_media_us = Some(media_now);
                let dropped = {
                    let mut stats = inner.stats.lock();
                    stats.frames_dropped += 1;
                    stats.frames_dropped
                };
                if dropped % 30 == 0 {
                    notifications.push(Notification::Info(InfoEvent::FramesSkipped {
                        count: 30,
                    }));
                }
                Some(Duration::ZERO)
            }
            VideoAction::RescheduleEarly { delay_us } => {
                if let Some(video) = core.video.as_mut() {
                    video.store_pending(frame);
                }
                Some(Duration::from_micros(delay_us.max(0) as u64))
            }
            VideoAction::Render => {
                let render_result = core
                    .video
                    .as_mut()
                    .expect("checked above")
                    .render(&frame);
                if let Err(e) = render_result {
                    notifications.push(Notification::Error {
                        kind: e.kind(),
                        detail: e.to_string(),
                    });
                    core.state = SessionState::Paused;
                    return None;
                }
                inner.stats.lock().frames_rendered += 1;
                inner.position.lock().position_us = frame.presentation_time_us;
                if !core.rendering_started {
                    core.rendering_started = true;
                    notifications.push(Notification::Info(InfoEvent::RenderingStart));
                }
                Self::finalize_seek(inner, core, notifications);

                // One-frame look-ahead: read the next frame now and schedule
                // by its deadline.
                let video = core.video.as_mut().expect("checked above");
                match video.read_frame() {
                    Ok(FrameRead::Frame(next)) => {
                        let delay_us = (next.presentation_time_us - media_now).max(0);
                        video.store_pending(next);
                        Some(Duration::from_micros(delay_us as u64))
                    }
                    Ok(FrameRead::EndOfStream) | Err(_) => {
                        // Let the next firing observe EOS/the error itself.
                        Some(Duration::ZERO)
                    }
                }
            }
        }
    }

    /// Complete a pending seek once its first frame lands (or EOS).
    fn finalize_seek(
        inner: &Arc<Self>,
        core: &mut SessionCore,
        notifications: &mut Vec<Notification>,
    ) {
        if !core.flags.seek_pending {
            return;
        }
        let Some(seek) = core.seek.take() else {
            core.flags.seek_pending = false;
            return;
        };
        if !seek.applied {
            // Not yet handed to the reader; keep waiting.
            core.seek = Some(seek);
            return;
        }
        core.flags.seek_pending = false;

        if seek.video_only {
            // Internal refinement: no external notifications.
            return;
        }
        if seek.two_phase_audio
            && let Some(audio) = core.audio.as_mut()
        {
            // Audio follows the video phase of the seek.
            if let Err(e) = audio.path.seek_to(seek.target_us) {
                warn!(error = %e, "audio phase of two-phase seek failed");
            }
            core.drift.reset();
        }
        inner.stats.lock().note_seek_finished(inner.clock.now_us());
        notifications.push(Notification::SeekComplete);
    }

    fn on_audio_status_event(inner: &Arc<Self>) {
        let mut repost = false;
        let mut signal_done = false;
        {
            let mut guard = inner.session.lock();
            let core = &mut *guard;
            if matches!(core.state, SessionState::Playing)
                && let Some(audio) = core.audio.as_ref()
            {
                if audio.path.reached_eos() && !core.flags.audio_at_eos {
                    debug!("audio track reached end of stream");
                    core.flags.audio_at_eos = true;
                    signal_done = true;
                }
                // Audio-only sessions publish their position from the
                // device clock.
                if core.video.is_none()
                    && let Some(position) = audio.path.position_us()
                {
                    inner.position.lock().position_us = position;
                }
                repost = true;
            }
        }
        if signal_done {
            inner.post_stream_done();
        }
        if repost {
            inner.post_audio_status_event(inner.config.audio_status_poll_interval);
        }
    }

    fn on_stream_done(inner: &Arc<Self>) {
        let mut notifications = Vec::new();
        let mut restart_video = false;
        {
            let mut guard = inner.session.lock();
            let core = &mut *guard;
            // Completion is only evaluated for a live playing session; a
            // duplicate completion event after the transition is a no-op.
            if !matches!(core.state, SessionState::Playing) {
                return;
            }
            let has_audio = core.audio.is_some();
            let has_video = core.selected_video.is_some();
            // Overall completion is a join over per-track EOS flags; audio
            // and video may arrive in either order.
            if !core.flags.all_tracks_at_eos(has_audio, has_video) {
                return;
            }

            if core.flags.looping {
                debug!("looping: restarting from the top");
                core.flags.clear_eos();
                core.seek = Some(PendingSeek {
                    target_us: 0,
                    video_only: false,
                    two_phase_audio: false,
                    applied: false,
                });
                core.flags.seek_pending = true;
                core.media_anchor_us = 0;
                core.anchor_real_us = inner.clock.now_us();
                core.drift.reset();
                if let Some(audio) = core.audio.as_mut() {
                    let _ = audio.path.seek_to(0);
                    if audio.path.start().is_ok() {
                        core.flags.audio_running = true;
                    }
                }
                restart_video = core.video.is_some();
            } else {
                core.state = SessionState::AtEos;
                if let Some(audio) = core.audio.as_mut() {
                    // End-of-stream pause: let committed samples flush.
                    audio.path.pause(true);
                    core.flags.audio_running = false;
                }
                {
                    let mut position = inner.position.lock();
                    position.position_us = position.duration_us;
                }
                notifications.push(Notification::PlaybackComplete);
            }
        }
        if restart_video {
            inner.post_video_event(Duration::ZERO);
        }
        inner.notify_all(notifications);
    }

    fn on_buffering_event(inner: &Arc<Self>) {
        let mut notifications = Vec::new();
        let repost;
        {
            let mut guard = inner.session.lock();
            let core = &mut *guard;
            let Some(source) = core.source.clone() else {
                return;
            };
            if source.is_local() {
                return;
            }

            let status = source.cache_status();
            let position_us = inner.position.lock().position_us;
            let consumed = core.consumed_bytes_estimate(position_us);
            let playing = matches!(core.state, SessionState::Playing);
            let preparing =
                matches!(core.state, SessionState::Preparing(PrepareStage::Buffering));

            if let Some(bitrate) = status.bitrate_bps {
                notifications.push(Notification::Info(InfoEvent::NetworkBandwidth {
                    kbps: bitrate / 1000,
                }));
            }

            let events = core.monitor.evaluate(&status, consumed, playing, preparing);
            for event in events {
                match event {
                    BufferingEvent::EnterUnderrun => {
                        let now = inner.clock.now_us();
                        core.media_anchor_us = core.media_now(now);
                        core.flags.cache_underrun = true;
                        if let Some(audio) = core.audio.as_mut() {
                            audio.path.pause(false);
                            core.flags.audio_running = false;
                        }
                        source.resume_fetch();
                        inner.stats.lock().note_buffering_started(now);
                        notifications.push(Notification::Info(InfoEvent::BufferingStart));
                    }
                    BufferingEvent::ExitUnderrun => {
                        core.flags.cache_underrun = false;
                        if matches!(core.state, SessionState::Playing)
                            && let Some(audio) = core.audio.as_mut()
                            && audio.path.start().is_ok()
                        {
                            core.flags.audio_running = true;
                        }
                        core.anchor_real_us = inner.clock.now_us();
                        inner
                            .stats
                            .lock()
                            .note_buffering_ended(inner.clock.now_us());
                        notifications.push(Notification::Info(InfoEvent::BufferingEnd));
                    }
                    BufferingEvent::PrepareBufferingDone => {
                        core.state = SessionState::Prepared;
                        core.prepare_token = None;
                        notifications.push(Notification::Prepared);
                    }
                    BufferingEvent::Percent(percent) => {
                        notifications.push(Notification::BufferingUpdate { percent });
                    }
                }
            }

            repost = !matches!(core.state, SessionState::Idle);
        }
        inner.notify_all(notifications);
        if repost {
            inner.post_buffering_event(inner.config.buffering_poll_interval);
        }
    }

    /// Deferred power-management teardown: paused on an offloaded path for
    /// long enough that the audio device should be released.
    fn on_audio_teardown(inner: &Arc<Self>) {
        let mut guard = inner.session.lock();
        let core = &mut *guard;
        if !matches!(core.state, SessionState::Paused) {
            return;
        }
        let Some(audio) = core.audio.as_mut() else {
            return;
        };
        if !audio.offloaded {
            return;
        }

        let position_us = inner.position.lock().position_us;
        info!(position_us, "tearing down offloaded audio after long pause");
        audio.path.teardown();
        core.audio = None;
        core.flags.audio_running = false;
        core.saved_session = Some(SavedSession {
            position_us,
            was_playing: false,
        });
        inner.stats.lock().offload_teardowns += 1;
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_pending_seek_defaults() {
        let seek = PendingSeek {
            target_us: 5,
            video_only: false,
            two_phase_audio: true,
            applied: false,
        };
        assert!(!seek.applied);
        assert!(seek.two_phase_audio);
    }
}
