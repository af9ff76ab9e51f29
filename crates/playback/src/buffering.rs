//! Buffering monitor: periodic watermark evaluation over the data source's
//! cache status.
//!
//! Pure decision logic; the orchestrator applies the resulting transitions.
//! Hysteresis is strict: one underrun entry per crossing below the low
//! watermark, one exit per subsequent crossing above the high watermark,
//! and no oscillation on values between the two.

use demux::CacheStatus;
use tracing::debug;

use crate::config::WatermarkConfig;

/// Transitions decided by one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingEvent {
    /// Cached data fell below the low watermark while playing.
    EnterUnderrun,
    /// Cached data recovered past the high watermark.
    ExitUnderrun,
    /// During prepare: the initial buffering phase is complete.
    PrepareBufferingDone,
    /// Cache fill percentage changed (for buffering-update notifications).
    Percent(u8),
}

#[derive(Debug)]
pub struct BufferingMonitor {
    config: WatermarkConfig,
    in_underrun: bool,
    last_percent: Option<u8>,
}

impl BufferingMonitor {
    pub fn new(config: WatermarkConfig) -> Self {
        Self {
            config,
            in_underrun: false,
            last_percent: None,
        }
    }

    pub fn in_underrun(&self) -> bool {
        self.in_underrun
    }

    pub fn reset(&mut self) {
        self.in_underrun = false;
        self.last_percent = None;
    }

    /// Evaluate the cache against the watermarks.
    ///
    /// `consumed_bytes` approximates the playback read position so cached
    /// data ahead of it is what counts. `playing` gates underrun entry;
    /// `preparing` switches to the prepare-completion decision.
    pub fn evaluate(
        &mut self,
        status: &CacheStatus,
        consumed_bytes: u64,
        playing: bool,
        preparing: bool,
    ) -> Vec<BufferingEvent> {
        let mut events = Vec::new();
        let cached_bytes = status.cached_bytes_from(consumed_bytes);

        // Depending on whether bitrate is known, compare cached duration or
        // cached byte count.
        let (below_low, above_high) = match status.bitrate_bps {
            Some(bitrate) if bitrate > 0 => {
                let cached_us = cached_bytes as i64 * 8 * 1_000_000 / bitrate as i64;
                (
                    cached_us < self.config.low_duration_us,
                    cached_us >= self.config.high_duration_us,
                )
            }
            _ => (
                cached_bytes < self.config.low_bytes,
                cached_bytes >= self.config.high_bytes,
            ),
        };

        // A finished source can never underrun again.
        let below_low = below_low && !status.reached_end;
        let above_high = above_high || status.reached_end;

        if preparing {
            if above_high {
                events.push(BufferingEvent::PrepareBufferingDone);
            }
        } else if self.in_underrun {
            if above_high {
                debug!("cache recovered past high watermark");
                self.in_underrun = false;
                events.push(BufferingEvent::ExitUnderrun);
            }
        } else if below_low && playing {
            debug!("cache fell below low watermark");
            self.in_underrun = true;
            events.push(BufferingEvent::EnterUnderrun);
        }

        if let Some(total) = status.total_len.filter(|&t| t > 0) {
            let percent = ((status.cached_to.min(total) * 100) / total) as u8;
            if self.last_percent != Some(percent) {
                self.last_percent = Some(percent);
                events.push(BufferingEvent::Percent(percent));
            }
        }

        events
    }
}
