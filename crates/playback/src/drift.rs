//! Windowed linear-fit drift estimator reconciling the audio device clock
//! with the system clock.
//!
//! Audio output devices report playback position with jitter; instead of
//! consuming raw readings, the orchestrator feeds (system time, audio time)
//! pairs into this estimator and uses the fitted mapping, which smooths the
//! jitter while tracking real drift between the two clocks.

const WINDOW: usize = 32;

#[derive(Debug, Default, Clone)]
pub struct DriftEstimator {
    /// (system_us, audio_us) pairs, oldest first.
    samples: Vec<(i64, i64)>,
}

impl DriftEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Record one (system time, audio device time) observation.
    pub fn add_sample(&mut self, system_us: i64, audio_us: i64) {
        if self.samples.len() == WINDOW {
            self.samples.remove(0);
        }
        self.samples.push((system_us, audio_us));
    }

    /// Estimated audio-clock value at `system_us`, from the windowed fit.
    ///
    /// With fewer than two observations the estimate falls back to the last
    /// observed offset.
    pub fn estimated_audio_time(&self, system_us: i64) -> Option<i64> {
        match self.samples.len() {
            0 => None,
            1 => {
                let (s, a) = self.samples[0];
                Some(a + (system_us - s))
            }
            _ => {
                let (slope, intercept) = self.fit()?;
                Some((slope * system_us as f64 + intercept) as i64)
            }
        }
    }

    /// Estimated system-clock ("real") time at which the audio clock reads
    /// `audio_us` — the inverse mapping.
    pub fn estimated_real_time(&self, audio_us: i64) -> Option<i64> {
        match self.samples.len() {
            0 => None,
            1 => {
                let (s, a) = self.samples[0];
                Some(s + (audio_us - a))
            }
            _ => {
                let (slope, intercept) = self.fit()?;
                if slope.abs() < f64::EPSILON {
                    return None;
                }
                Some(((audio_us as f64 - intercept) / slope) as i64)
            }
        }
    }

    /// Least-squares fit `audio = slope * system + intercept` over the
    /// window. Inputs are re-centered to keep the arithmetic stable.
    fn fit(&self) -> Option<(f64, f64)> {
        let n = self.samples.len() as f64;
        let (s0, a0) = self.samples[0];
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xx = 0.0;
        let mut sum_xy = 0.0;
        for &(s, a) in &self.samples {
            let x = (s - s0) as f64;
            let y = (a - a0) as f64;
            sum_x += x;
            sum_y += y;
            sum_xx += x * x;
            sum_xy += x * y;
        }
        let denom = n * sum_xx - sum_x * sum_x;
        if denom.abs() < f64::EPSILON {
            return None;
        }
        let slope = (n * sum_xy - sum_x * sum_y) / denom;
        let intercept_local = (sum_y - slope * sum_x) / n;
        // Undo the re-centering.
        let intercept = a0 as f64 + intercept_local - slope * s0 as f64;
        Some((slope, intercept))
    }
}
