use std::time::Duration;

/// Cache watermarks driving buffering transitions.
///
/// When the content bitrate is known, cached data is measured in playable
/// microseconds; otherwise raw byte counts apply.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkConfig {
    pub low_duration_us: i64,
    pub high_duration_us: i64,
    pub low_bytes: u64,
    pub high_bytes: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            low_duration_us: 2_000_000,
            high_duration_us: 5_000_000,
            low_bytes: 40_000,
            high_bytes: 200_000,
        }
    }
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Lateness beyond which a frame may be dropped instead of rendered.
    pub avsync_late_margin_us: i64,
    /// Earliness beyond which the render is rescheduled instead of spinning.
    pub early_reschedule_threshold_us: i64,
    /// When earlier than this, the reschedule delay itself is clamped so
    /// intervening pause/seek/stop commands stay responsive.
    pub early_clamp_threshold_us: i64,
    pub early_clamp_delay_us: i64,
    /// Lateness after which the video path re-seeks to the audio position
    /// instead of rendering (skip-ahead catch-up).
    pub catch_up_lateness_us: i64,
    /// Policy switch for the skip-ahead heuristic; adaptive-streaming
    /// content disables it and lets the decoder catch up on its own.
    pub allow_seek_catch_up: bool,
    /// Frequency limit for frame drops.
    pub min_drop_spacing_us: i64,
    pub allow_frame_drops: bool,
    pub watermarks: WatermarkConfig,
    pub buffering_poll_interval: Duration,
    pub audio_status_poll_interval: Duration,
    /// Paused-for-this-long on an offloaded path tears the audio device
    /// down so the DSP can power off.
    pub paused_audio_teardown: Duration,
    pub min_sniff_bytes: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            avsync_late_margin_us: 40_000,
            early_reschedule_threshold_us: 30_000,
            early_clamp_threshold_us: 60_000,
            early_clamp_delay_us: 30_000,
            catch_up_lateness_us: 500_000,
            allow_seek_catch_up: true,
            min_drop_spacing_us: 100_000,
            allow_frame_drops: true,
            watermarks: WatermarkConfig::default(),
            buffering_poll_interval: Duration::from_secs(1),
            audio_status_poll_interval: Duration::from_millis(250),
            paused_audio_teardown: Duration::from_secs(60),
            min_sniff_bytes: 4096,
        }
    }
}
