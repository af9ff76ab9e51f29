//! Simulated collaborators: pass-through decoder, counting renderer and a
//! clock-driven audio path. Used by the headless CLI player and by tests.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use demux::{DemuxError, Sample, TrackInfo, TrackSource};
use media_types::{Resolution, Rotation};

use crate::PlaybackError;
use crate::actors::{
    AudioPath, DecodeEvent, DecoderFactory, VideoDecoder, VideoFrame, VideoRenderer,
};
use crate::clock::ClockSource;
use crate::state::VideoScalingMode;

/// Pass-through decoder: every submitted sample becomes one frame with the
/// sample's presentation timestamp.
pub struct SimVideoDecoder {
    queued: VecDeque<VideoFrame>,
    eos_signaled: bool,
}

impl SimVideoDecoder {
    pub fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            eos_signaled: false,
        }
    }
}

impl Default for SimVideoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoder for SimVideoDecoder {
    fn submit(&mut self, sample: &Sample) -> Result<(), PlaybackError> {
        self.queued.push_back(VideoFrame {
            presentation_time_us: sample.presentation_time_us,
            buffer: Bytes::new(),
        });
        Ok(())
    }

    fn poll(&mut self) -> Result<DecodeEvent, PlaybackError> {
        if let Some(frame) = self.queued.pop_front() {
            return Ok(DecodeEvent::Frame(frame));
        }
        if self.eos_signaled {
            Ok(DecodeEvent::EndOfStream)
        } else {
            Ok(DecodeEvent::NeedsData)
        }
    }

    fn signal_end_of_stream(&mut self) {
        self.eos_signaled = true;
    }

    fn flush(&mut self) {
        self.queued.clear();
        self.eos_signaled = false;
    }
}

/// Shared render/drop counters exposed by [`SimVideoRenderer`].
#[derive(Debug, Default)]
pub struct RenderStats {
    pub rendered: u64,
    pub discarded: u64,
    pub last_pts_us: i64,
    pub inits: u32,
}

pub struct SimVideoRenderer {
    stats: Arc<Mutex<RenderStats>>,
}

impl SimVideoRenderer {
    pub fn new() -> (Self, Arc<Mutex<RenderStats>>) {
        let stats = Arc::new(Mutex::new(RenderStats::default()));
        (
            Self {
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }
}

impl VideoRenderer for SimVideoRenderer {
    fn init(
        &mut self,
        geometry: Resolution,
        _rotation: Rotation,
        _scaling: VideoScalingMode,
    ) -> Result<(), PlaybackError> {
        trace!(%geometry, "sim renderer init");
        self.stats.lock().inits += 1;
        Ok(())
    }

    fn render(&mut self, frame: &VideoFrame) -> Result<(), PlaybackError> {
        let mut stats = self.stats.lock();
        stats.rendered += 1;
        stats.last_pts_us = frame.presentation_time_us;
        Ok(())
    }

    fn discard(&mut self, _frame: &VideoFrame) {
        self.stats.lock().discarded += 1;
    }
}

/// Audio path whose device clock is a [`ClockSource`]: while started, the
/// media position advances with the clock.
pub struct SimAudioPath {
    clock: Arc<dyn ClockSource>,
    duration_us: i64,
    offloaded: bool,
    playing: bool,
    media_offset_us: i64,
    started_at_us: i64,
    torn_down: bool,
    /// Injected failure budget shared with the factory: while positive,
    /// `start` fails and decrements it (fallback tests).
    start_failures: Arc<Mutex<u32>>,
}

impl SimAudioPath {
    pub fn new(clock: Arc<dyn ClockSource>, duration_us: i64, offloaded: bool) -> Self {
        Self {
            clock,
            duration_us,
            offloaded,
            playing: false,
            media_offset_us: 0,
            started_at_us: 0,
            torn_down: false,
            start_failures: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_shared_failures(mut self, failures: Arc<Mutex<u32>>) -> Self {
        self.start_failures = failures;
        self
    }

    fn clamped_position(&self) -> i64 {
        let position = if self.playing {
            self.media_offset_us + (self.clock.now_us() - self.started_at_us)
        } else {
            self.media_offset_us
        };
        position.min(self.duration_us)
    }
}

impl AudioPath for SimAudioPath {
    fn start(&mut self) -> Result<(), PlaybackError> {
        {
            let mut failures = self.start_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(PlaybackError::Audio("simulated start failure".into()));
            }
        }
        if !self.playing {
            self.started_at_us = self.clock.now_us();
            self.playing = true;
        }
        Ok(())
    }

    fn pause(&mut self, _flush_committed: bool) {
        if self.playing {
            self.media_offset_us = self.clamped_position();
            self.playing = false;
        }
    }

    fn seek_to(&mut self, time_us: i64) -> Result<(), PlaybackError> {
        self.media_offset_us = time_us.clamp(0, self.duration_us);
        self.started_at_us = self.clock.now_us();
        Ok(())
    }

    fn position_us(&self) -> Option<i64> {
        if self.torn_down {
            return None;
        }
        Some(self.clamped_position())
    }

    fn realtime_anchor(&self) -> Option<(i64, i64)> {
        if self.torn_down {
            return None;
        }
        Some((self.clock.now_us(), self.clamped_position()))
    }

    fn reached_eos(&self) -> bool {
        !self.torn_down && self.clamped_position() >= self.duration_us
    }

    fn is_offloaded(&self) -> bool {
        self.offloaded
    }

    fn teardown(&mut self) {
        self.playing = false;
        self.torn_down = true;
    }
}

/// Factory wiring the simulated collaborators together.
pub struct SimFactory {
    clock: Arc<dyn ClockSource>,
    render_stats: Arc<Mutex<RenderStats>>,
    audio_start_failures: Arc<Mutex<u32>>,
}

impl SimFactory {
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            clock,
            render_stats: Arc::new(Mutex::new(RenderStats::default())),
            audio_start_failures: Arc::new(Mutex::new(0)),
        }
    }

    pub fn render_stats(&self) -> Arc<Mutex<RenderStats>> {
        Arc::clone(&self.render_stats)
    }

    /// Make the next `failures` audio-path starts fail (fallback testing).
    /// The budget is shared with paths already handed out.
    pub fn fail_audio_starts(&self, failures: u32) {
        *self.audio_start_failures.lock() = failures;
    }
}

impl DecoderFactory for SimFactory {
    fn video_decoder(&self, _info: &TrackInfo) -> Result<Box<dyn VideoDecoder>, PlaybackError> {
        Ok(Box::new(SimVideoDecoder::new()))
    }

    fn video_renderer(&self, _info: &TrackInfo) -> Result<Box<dyn VideoRenderer>, PlaybackError> {
        Ok(Box::new(SimVideoRenderer {
            stats: Arc::clone(&self.render_stats),
        }))
    }

    fn audio_path(
        &self,
        source: TrackSource,
        offloaded: bool,
    ) -> Result<Box<dyn AudioPath>, PlaybackError> {
        let duration_us = source.info().duration_us.unwrap_or(0);
        let path = SimAudioPath::new(Arc::clone(&self.clock), duration_us, offloaded)
            .with_shared_failures(Arc::clone(&self.audio_start_failures));
        Ok(Box::new(path))
    }
}

/// A decoder whose poll emits a scripted event sequence; for loop tests.
pub struct ScriptedDecoder {
    pub script: VecDeque<DecodeEvent>,
    pub submitted: Vec<i64>,
}

impl ScriptedDecoder {
    pub fn new(script: Vec<DecodeEvent>) -> Self {
        Self {
            script: script.into(),
            submitted: Vec::new(),
        }
    }
}

impl VideoDecoder for ScriptedDecoder {
    fn submit(&mut self, sample: &Sample) -> Result<(), PlaybackError> {
        self.submitted.push(sample.decode_time_us);
        Ok(())
    }

    fn poll(&mut self) -> Result<DecodeEvent, PlaybackError> {
        match self.script.pop_front() {
            Some(event) => Ok(event),
            None => Err(DemuxError::EndOfStream.into()),
        }
    }

    fn signal_end_of_stream(&mut self) {}

    fn flush(&mut self) {}
}
