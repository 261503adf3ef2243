//! PCM sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! The pipeline runs at two canonical rates — 16 kHz capture, 24 kHz
//! playback — while devices report whatever their hardware clock does.
//! `RateConverter` bridges the gap on the owning engine's task, where
//! allocation is allowed.
//!
//! When the rates already match, `RateConverter` is a pure passthrough —
//! no rubato session is created and input comes back unchanged.
//!
//! State (rubato's filter history and any partial input block) is
//! preserved between calls, so phase stays continuous across block
//! boundaries.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoxaError};

/// Converts i16 mono PCM from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == output rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer — holds partial input blocks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `in_rate`: Sample rate of the incoming PCM (Hz).
    /// - `out_rate`: Sample rate to produce (Hz).
    /// - `chunk_size`: Input frame count per rubato call (typically one
    ///   audio frame's worth of device samples).
    ///
    /// # Errors
    /// Returns `VoxaError::AudioDevice` if rubato fails to initialise.
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> Result<Self> {
        if in_rate == out_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = out_rate as f64 / in_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| VoxaError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(in_rate, out_rate, chunk_size, max_out, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty
    /// while a partial block accumulates).
    ///
    /// In passthrough mode the input is returned unchanged.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf
            .extend(samples.iter().map(|&s| f32::from(s) / 32768.0));

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend(
                        self.output_buf[0][..produced]
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
                    );
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Returns `true` when input rate == output rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<i16> = (0..480).map(|i| (i * 13 % 1000) as i16).collect();
        let out = rc.process(&samples);
        assert_eq!(out, samples);
    }

    #[test]
    fn ratio_48k_to_16k_correct_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());
        // 960 input samples at 48 kHz → ~320 at 16 kHz
        let samples = vec![0i16; 960];
        let out = rc.process(&samples);
        assert!(!out.is_empty(), "expected non-empty output");
        assert_relative_eq!(out.len() as f64, 320.0, max_relative = 0.04);
    }

    #[test]
    fn upsampling_24k_to_48k_roughly_doubles() {
        let mut rc = RateConverter::new(24_000, 48_000, 480).unwrap();
        let out = rc.process(&vec![0i16; 480]);
        assert_relative_eq!(out.len() as f64, 960.0, max_relative = 0.04);
    }

    #[test]
    fn partial_block_returns_empty() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        // Fewer than chunk_size samples → nothing output yet
        let out = rc.process(&vec![0i16; 500]);
        assert!(
            out.is_empty(),
            "expected empty output for partial block, got {}",
            out.len()
        );
    }

    #[test]
    fn partial_blocks_accumulate_across_calls() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let out1 = rc.process(&vec![0i16; 500]);
        assert!(out1.is_empty());
        let out2 = rc.process(&vec![0i16; 500]);
        assert!(!out2.is_empty(), "second push should trigger processing");
    }

    #[test]
    fn full_scale_input_does_not_wrap() {
        let mut rc = RateConverter::new(48_000, 24_000, 480).unwrap();
        let samples = vec![i16::MAX; 960];
        let out = rc.process(&samples);
        // Cubic interpolation can overshoot slightly; the clamp must hold.
        assert!(out.iter().all(|&s| s >= -32768));
    }
}
