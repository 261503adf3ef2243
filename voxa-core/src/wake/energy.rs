//! Energy-heuristic wake model.
//!
//! Not a real keyword spotter: it fires when input energy stays above a
//! threshold for a run of consecutive chunks, then re-arms only after the
//! signal falls silent again. Useful as a default on boards without a
//! neural model, in the demo host, and as the reference implementation of
//! the `WakeModel` contract.

use super::WakeModel;

/// Chunk stride: 80 ms at 16 kHz.
const CHUNK_SAMPLES: usize = 1280;

/// Sustained-RMS wake heuristic.
pub struct EnergyWakeModel {
    phrase: String,
    /// RMS threshold in [0, 1] (full-scale i16 normalised).
    threshold: f32,
    /// Consecutive loud chunks required to fire.
    required_chunks: u32,
    loud_streak: u32,
    /// Set when a detection is waiting to be polled.
    pending: bool,
    /// Set after firing; cleared by a quiet chunk (re-arm).
    latched: bool,
}

impl EnergyWakeModel {
    pub fn new(phrase: impl Into<String>, threshold: f32, required_chunks: u32) -> Self {
        Self {
            phrase: phrase.into(),
            threshold,
            required_chunks: required_chunks.max(1),
            loud_streak: 0,
            pending: false,
            latched: false,
        }
    }

    fn rms(pcm: &[i16]) -> f32 {
        if pcm.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = pcm
            .iter()
            .map(|&s| {
                let x = f64::from(s) / 32768.0;
                x * x
            })
            .sum();
        ((sum_sq / pcm.len() as f64) as f32).sqrt()
    }
}

impl Default for EnergyWakeModel {
    fn default() -> Self {
        Self::new("hey voxa", 0.05, 3)
    }
}

impl WakeModel for EnergyWakeModel {
    fn chunk_samples(&self) -> usize {
        CHUNK_SAMPLES
    }

    fn feed(&mut self, pcm: &[i16]) {
        let loud = Self::rms(pcm) >= self.threshold;

        if loud {
            if self.latched {
                return;
            }
            self.loud_streak += 1;
            if self.loud_streak >= self.required_chunks {
                self.pending = true;
                self.latched = true;
                self.loud_streak = 0;
            }
        } else {
            self.loud_streak = 0;
            self.latched = false;
        }
    }

    fn poll(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    fn reset(&mut self) {
        self.loud_streak = 0;
        self.pending = false;
        self.latched = false;
    }

    fn phrase(&self) -> &str {
        &self.phrase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    fn loud() -> Vec<i16> {
        vec![8000; CHUNK_SAMPLES]
    }

    fn quiet() -> Vec<i16> {
        vec![0; CHUNK_SAMPLES]
    }

    #[test]
    fn fires_after_sustained_energy() {
        let mut model = EnergyWakeModel::new("test", 0.05, 3);
        model.feed(&loud());
        model.feed(&loud());
        assert!(!model.poll(), "fired too early");
        model.feed(&loud());
        assert!(model.poll());
    }

    #[test]
    fn poll_reports_each_detection_once() {
        let mut model = EnergyWakeModel::new("test", 0.05, 1);
        model.feed(&loud());
        assert!(model.poll());
        assert!(!model.poll());
    }

    #[test]
    fn stays_latched_until_silence() {
        let mut model = EnergyWakeModel::new("test", 0.05, 1);
        model.feed(&loud());
        assert!(model.poll());

        // Continued loudness must not retrigger.
        model.feed(&loud());
        model.feed(&loud());
        assert!(!model.poll());

        // Silence re-arms, loudness fires again.
        model.feed(&quiet());
        model.feed(&loud());
        assert!(model.poll());
    }

    #[test]
    fn quiet_input_interrupts_the_streak() {
        let mut model = EnergyWakeModel::new("test", 0.05, 2);
        model.feed(&loud());
        model.feed(&quiet());
        model.feed(&loud());
        assert!(!model.poll());
    }

    #[test]
    fn reset_clears_pending_detection() {
        let mut model = EnergyWakeModel::new("test", 0.05, 1);
        model.feed(&loud());
        model.reset();
        assert!(!model.poll());
    }

    #[test]
    fn rms_of_a_square_wave_matches_its_amplitude() {
        // ±8192 against full scale 32768 → RMS 0.25.
        let samples: Vec<i16> = (0..CHUNK_SAMPLES)
            .map(|i| if i % 2 == 0 { 8192 } else { -8192 })
            .collect();
        assert_relative_eq!(EnergyWakeModel::rms(&samples), 0.25, epsilon = 1e-4);
    }
}
