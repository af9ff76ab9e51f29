//! Session state machine vocabulary and listener notifications.

use std::sync::Arc;

/// Phase within `Preparing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareStage {
    /// Resolving the data source and instantiating the extractor.
    Connecting,
    /// Connected; waiting for the cache to reach the high watermark.
    Buffering,
}

/// Primary session state. Orthogonal conditions (cache underrun, pending
/// seek, per-track EOS) live in [`SessionFlags`] so that illegal
/// combinations of the primary states stay unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Preparing(PrepareStage),
    Prepared,
    Playing,
    Paused,
    AtEos,
}

impl SessionState {
    pub fn is_preparing(&self) -> bool {
        matches!(self, SessionState::Preparing(_))
    }

    /// Whether control calls that require a prepared session may proceed.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            SessionState::Prepared | SessionState::Playing | SessionState::Paused | SessionState::AtEos
        )
    }
}

/// Orthogonal boolean sub-state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// Forced buffering pause driven by the cache watermarks.
    pub cache_underrun: bool,
    /// A seek target is stored and not yet applied by the read loops.
    pub seek_pending: bool,
    pub audio_running: bool,
    pub text_running: bool,
    pub audio_at_eos: bool,
    pub video_at_eos: bool,
    pub looping: bool,
}

impl SessionFlags {
    /// Stream completion joins the per-track EOS flags for the tracks that
    /// exist; missing tracks are vacuously complete.
    pub fn all_tracks_at_eos(&self, has_audio: bool, has_video: bool) -> bool {
        (!has_audio || self.audio_at_eos) && (!has_video || self.video_at_eos)
    }

    pub fn clear_eos(&mut self) {
        self.audio_at_eos = false;
        self.video_at_eos = false;
    }
}

/// Informational events surfaced alongside the main notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoEvent {
    /// First frame rendered after prepare or seek.
    RenderingStart,
    /// Video is falling behind the audio clock by this many milliseconds.
    VideoTrackLagging { ms: i64 },
    BufferingStart,
    BufferingEnd,
    NetworkBandwidth { kbps: u32 },
    /// Frames were dropped to catch up.
    FramesSkipped { count: u32 },
}

/// Error classification surfaced to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Malformed,
    Unsupported,
    Decoder,
    Audio,
    Cancelled,
}

/// Status vocabulary delivered to the session listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Prepared,
    Started,
    Paused,
    Stopped,
    PlaybackComplete,
    SeekComplete,
    BufferingUpdate { percent: u8 },
    Info(InfoEvent),
    Error { kind: ErrorKind, detail: String },
}

/// Listener callback; invoked from the event worker without holding the
/// session lock.
pub type Listener = Arc<dyn Fn(Notification) + Send + Sync>;

/// Video scaling mode forwarded to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoScalingMode {
    #[default]
    Fit,
    FillCrop,
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_ready_states() {
        assert!(!SessionState::Idle.is_ready());
        assert!(!SessionState::Preparing(PrepareStage::Connecting).is_ready());
        assert!(SessionState::Prepared.is_ready());
        assert!(SessionState::Playing.is_ready());
        assert!(SessionState::AtEos.is_ready());
    }

    #[test]
    fn test_eos_join() {
        let mut flags = SessionFlags::default();
        // Both tracks selected: completion requires both, in either order.
        assert!(!flags.all_tracks_at_eos(true, true));
        flags.audio_at_eos = true;
        assert!(!flags.all_tracks_at_eos(true, true));
        flags.video_at_eos = true;
        assert!(flags.all_tracks_at_eos(true, true));

        // Video-only session ignores the audio flag.
        let flags = SessionFlags {
            video_at_eos: true,
            ..SessionFlags::default()
        };
        assert!(flags.all_tracks_at_eos(false, true));
        assert!(!flags.all_tracks_at_eos(true, true));
    }
}
