//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! The conversation runs at 16 kHz mono; sound cards commonly run at 44.1 or
//! 48 kHz. Capture converts device → 16 kHz on the control thread, playback
//! converts 16 kHz → device on the drain thread. Both sides allocate freely,
//! neither runs inside a real-time callback.
//!
//! Equal rates skip rubato entirely.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VesperError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when both rates are equal.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// `[1][output_frames_max]`, reused across calls.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `VesperError::AudioDevice` if rubato rejects the ratio or chunk size.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler =
            FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
                .map_err(|e| VesperError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::info!(from_rate, to_rate, chunk_size, max_out, "resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Feed samples and collect whatever output is ready (possibly none).
    ///
    /// Input is buffered until a full `chunk_size` block is available.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let block = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Push out buffered input by padding it with silence to a full block.
    ///
    /// Used at the end of a playback stream so the last few milliseconds are
    /// not stranded in the accumulator.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            self.input_buf.clear();
            return Vec::new();
        }
        let pad = self.chunk_size - self.input_buf.len();
        self.process(&vec![0.0; pad])
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 480).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn downsample_48k_to_16k_has_expected_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn upsample_16k_to_48k_triples_length() {
        let mut rc = RateConverter::new(16_000, 48_000, 320).unwrap();
        let out = rc.process(&vec![0.0f32; 320]);
        assert!(
            (out.len() as isize - 960).unsigned_abs() <= 20,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_input_waits_for_a_full_block() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn flush_emits_buffered_remainder() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.1f32; 100]).is_empty());
        assert!(!rc.flush().is_empty());
        assert!(rc.flush().is_empty());
    }
}
