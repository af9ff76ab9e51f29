//! Telemetry record behind its own lock so a diagnostics dump never blocks
//! playback.

/// Counters and latency accounting for one session.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub frames_rendered: u64,
    pub frames_dropped: u64,
    pub seek_count: u64,
    pub underrun_count: u64,
    pub software_fallbacks: u32,
    pub offload_teardowns: u32,
    /// Wall-clock time of the last seek request, for latency accounting.
    pub last_seek_started_us: Option<i64>,
    pub last_seek_latency_us: Option<i64>,
    /// Wall-clock time buffering started, while in underrun.
    pub buffering_started_us: Option<i64>,
    pub total_buffering_us: i64,
    pub worst_video_lateness_us: i64,
}

impl SessionStats {
    pub fn reset(&mut self) {
        *self = SessionStats::default();
    }

    pub fn note_seek_started(&mut self, now_us: i64) {
        self.seek_count += 1;
        self.last_seek_started_us = Some(now_us);
    }

    pub fn note_seek_finished(&mut self, now_us: i64) {
        if let Some(started) = self.last_seek_started_us.take() {
            self.last_seek_latency_us = Some(now_us - started);
        }
    }

    pub fn note_buffering_started(&mut self, now_us: i64) {
        self.underrun_count += 1;
        self.buffering_started_us = Some(now_us);
    }

    pub fn note_buffering_ended(&mut self, now_us: i64) {
        if let Some(started) = self.buffering_started_us.take() {
            self.total_buffering_us += now_us - started;
        }
    }

    /// Human-readable diagnostics block.
    pub fn dump(&self) -> String {
        format!(
            "frames: rendered={} dropped={}\n\
             seeks: count={} last_latency_us={:?}\n\
             buffering: underruns={} total_us={}\n\
             fallbacks: software={} offload_teardowns={}\n\
             worst_video_lateness_us={}",
            self.frames_rendered,
            self.frames_dropped,
            self.seek_count,
            self.last_seek_latency_us,
            self.underrun_count,
            self.total_buffering_us,
            self.software_fallbacks,
            self.offload_teardowns,
            self.worst_video_lateness_us,
        )
    }
}
