//! Per-frame render decision: the lateness policy of the video loop.
//!
//! Kept as a pure function so every branch is testable against scripted
//! clocks without running the event loop.

use crate::config::PlayerConfig;

/// What the video loop should do with the frame it just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoAction {
    /// Discard the frame and re-issue a video-only seek to the audio
    /// position (skip-ahead catch-up after a badly missed deadline).
    CatchUpSeek,
    /// Release the frame without rendering and read the next immediately.
    Drop,
    /// The frame is early; hold it and fire again after `delay_us`.
    RescheduleEarly { delay_us: i64 },
    Render,
}

/// Inputs beyond lateness that gate the policy branches.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext {
    /// An audio time mapping exists (catch-up needs a trustworthy clock).
    pub audio_available: bool,
    /// Adaptive-streaming content: the decoder is allowed to fall behind
    /// and recover on its own, so skip-ahead is disabled.
    pub adaptive_content: bool,
    /// A seek is already pending; never stack a catch-up on top of it.
    pub seek_in_flight: bool,
    /// Media time of the most recent drop, for the drop-frequency limit.
    pub last_drop_media_us: Option<i64>,
    pub media_now_us: i64,
}

pub fn decide(lateness_us: i64, config: &PlayerConfig, ctx: &PolicyContext) -> VideoAction {
    // Badly late: seek ahead to the audio clock rather than render, unless
    // policy says this content tolerates falling behind better than
    // skipping.
    if lateness_us > config.catch_up_lateness_us
        && ctx.audio_available
        && config.allow_seek_catch_up
        && !ctx.adaptive_content
        && !ctx.seek_in_flight
    {
        return VideoAction::CatchUpSeek;
    }

    // Moderately late: drop, frequency-limited.
    if lateness_us > config.avsync_late_margin_us && config.allow_frame_drops {
        let spaced_out = ctx
            .last_drop_media_us
            .is_none_or(|last| ctx.media_now_us - last >= config.min_drop_spacing_us);
        if spaced_out {
            return VideoAction::Drop;
        }
    }

    // Notably early: wait, but clamp the wait so intervening pause/seek/stop
    // commands stay responsive.
    let early_us = -lateness_us;
    if early_us > config.early_reschedule_threshold_us {
        let delay_us = if early_us > config.early_clamp_threshold_us {
            config.early_clamp_delay_us
        } else {
            (early_us - config.early_reschedule_threshold_us).max(0)
        };
        return VideoAction::RescheduleEarly { delay_us };
    }

    VideoAction::Render
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    fn ctx() -> PolicyContext {
        PolicyContext {
            audio_available: true,
            adaptive_content: false,
            seek_in_flight: false,
            last_drop_media_us: None,
            media_now_us: 10_000_000,
        }
    }

    #[test]
    fn test_on_time_renders() {
        let config = PlayerConfig::default();
        assert_eq!(decide(0, &config, &ctx()), VideoAction::Render);
        assert_eq!(decide(10_000, &config, &ctx()), VideoAction::Render);
        assert_eq!(decide(-10_000, &config, &ctx()), VideoAction::Render);
    }

    #[test]
    fn test_moderately_late_drops() {
        let config = PlayerConfig::default();
        assert_eq!(decide(50_000, &config, &ctx()), VideoAction::Drop);
    }

    #[test]
    fn test_drop_frequency_limited() {
        let config = PlayerConfig::default();
        let recent_drop = PolicyContext {
            last_drop_media_us: Some(9_950_000), // 50ms ago < 100ms spacing
            ..ctx()
        };
        assert_eq!(decide(50_000, &config, &recent_drop), VideoAction::Render);

        let old_drop = PolicyContext {
            last_drop_media_us: Some(9_000_000),
            ..ctx()
        };
        assert_eq!(decide(50_000, &config, &old_drop), VideoAction::Drop);
    }

    #[test]
    fn test_drops_can_be_disabled() {
        let config = PlayerConfig {
            allow_frame_drops: false,
            ..PlayerConfig::default()
        };
        assert_eq!(decide(50_000, &config, &ctx()), VideoAction::Render);
    }

    #[test]
    fn test_badly_late_catches_up() {
        let config = PlayerConfig::default();
        assert_eq!(decide(600_000, &config, &ctx()), VideoAction::CatchUpSeek);
    }

    #[test]
    fn test_catch_up_requires_audio_clock() {
        let config = PlayerConfig::default();
        let no_audio = PolicyContext {
            audio_available: false,
            ..ctx()
        };
        // Falls through to the drop branch instead.
        assert_eq!(decide(600_000, &config, &no_audio), VideoAction::Drop);
    }

    #[test]
    fn test_catch_up_disabled_for_adaptive_content() {
        let config = PlayerConfig::default();
        let adaptive = PolicyContext {
            adaptive_content: true,
            ..ctx()
        };
        assert_eq!(decide(600_000, &config, &adaptive), VideoAction::Drop);
    }

    #[test]
    fn test_catch_up_policy_switch() {
        let config = PlayerConfig {
            allow_seek_catch_up: false,
            ..PlayerConfig::default()
        };
        assert_eq!(decide(600_000, &config, &ctx()), VideoAction::Drop);
    }

    #[test]
    fn test_early_reschedules_with_margin() {
        let config = PlayerConfig::default();
        // 45ms early: delay = 45ms - 30ms threshold = 15ms.
        assert_eq!(
            decide(-45_000, &config, &ctx()),
            VideoAction::RescheduleEarly { delay_us: 15_000 }
        );
    }

    #[test]
    fn test_very_early_clamps_delay() {
        let config = PlayerConfig::default();
        // 200ms early: delay clamps to 30ms, staying responsive to
        // intervening commands.
        assert_eq!(
            decide(-200_000, &config, &ctx()),
            VideoAction::RescheduleEarly { delay_us: 30_000 }
        );
    }
}
