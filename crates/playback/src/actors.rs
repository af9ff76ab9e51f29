//! External collaborator interfaces: decoders, renderer, the audio path and
//! platform capability negotiation.
//!
//! The orchestrator's state machine is provider-agnostic; hardware-specific
//! paths live behind these traits and are chosen through the capability
//! provider at prepare time.

use bytes::Bytes;
use demux::{Sample, TrackInfo, TrackSource};
use media_types::{Resolution, Rotation};

use crate::PlaybackError;
use crate::state::VideoScalingMode;

/// One decoded video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub presentation_time_us: i64,
    /// Opaque decoded buffer; may be empty for null/simulated decoders.
    pub buffer: Bytes,
}

/// What a decoder poll produced.
#[derive(Debug, Clone)]
pub enum DecodeEvent {
    Frame(VideoFrame),
    /// Output geometry changed; the renderer must be reinitialized.
    FormatChanged(Resolution),
    /// A zero-length output buffer; skipped by the read loop.
    EmptyBuffer,
    /// The decoder wants another compressed sample.
    NeedsData,
    EndOfStream,
}

/// Opaque decoder actor consuming compressed samples and producing frames.
pub trait VideoDecoder: Send {
    fn submit(&mut self, sample: &Sample) -> Result<(), PlaybackError>;
    fn poll(&mut self) -> Result<DecodeEvent, PlaybackError>;
    /// No more input will arrive; drain and then report end of stream.
    fn signal_end_of_stream(&mut self);
    fn flush(&mut self);
}

/// Display sink for decoded frames.
pub trait VideoRenderer: Send {
    fn init(
        &mut self,
        geometry: Resolution,
        rotation: Rotation,
        scaling: VideoScalingMode,
    ) -> Result<(), PlaybackError>;
    fn render(&mut self, frame: &VideoFrame) -> Result<(), PlaybackError>;
    /// Release a frame without rendering it (frame drop).
    fn discard(&mut self, _frame: &VideoFrame) {}
}

/// The audio decode/output path: a sink plus the device clock.
pub trait AudioPath: Send {
    fn start(&mut self) -> Result<(), PlaybackError>;
    /// Pause output. When `flush_committed` is set, samples already written
    /// to the device are allowed to finish playing (end-of-stream pause);
    /// otherwise they are discarded.
    fn pause(&mut self, flush_committed: bool);
    fn seek_to(&mut self, time_us: i64) -> Result<(), PlaybackError>;
    /// Current media position from the device clock.
    fn position_us(&self) -> Option<i64>;
    /// Latest (real time, media time) pair published by the sink.
    fn realtime_anchor(&self) -> Option<(i64, i64)>;
    fn reached_eos(&self) -> bool;
    fn is_offloaded(&self) -> bool;
    /// Release the device entirely (power management teardown).
    fn teardown(&mut self);
}

/// Capability negotiation: "can this platform offer path X for this
/// content". Zero or more concrete providers implement it.
pub trait CapabilityProvider: Send + Sync {
    fn supports_audio_offload(&self, _info: &TrackInfo) -> bool {
        false
    }
}

/// Default provider: software paths only.
pub struct SoftwareOnly;

impl CapabilityProvider for SoftwareOnly {}

/// Constructs the concrete collaborator instances at prepare time.
pub trait DecoderFactory: Send + Sync {
    fn video_decoder(&self, info: &TrackInfo) -> Result<Box<dyn VideoDecoder>, PlaybackError>;
    fn video_renderer(&self, info: &TrackInfo) -> Result<Box<dyn VideoRenderer>, PlaybackError>;
    fn audio_path(
        &self,
        source: TrackSource,
        offloaded: bool,
    ) -> Result<Box<dyn AudioPath>, PlaybackError>;
}
