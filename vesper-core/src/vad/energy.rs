//! Energy-based VAD using RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming frame.
//! 2. If RMS ≥ `threshold` → emit `Speech`, reset hangover counter.
//! 3. If RMS < `threshold` and hangover counter > 0 → emit `Speech`,
//!    decrement counter (prevents clipping syllable endings).
//! 4. Otherwise → emit `Silence`.

use super::{frame_rms, VadDecision, VoiceActivityDetector};

/// A simple energy-based voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS amplitude threshold. Frames above this are considered speech.
    /// Typical range: 0.01–0.05 for a quiet microphone.
    threshold: f32,
    hangover_frames: u32,
    hangover_counter: u32,
}

impl EnergyVad {
    /// - `threshold`: RMS level above which a frame is considered speech.
    /// - `hangover_frames`: silent frames still reported as speech after
    ///   real speech ends.
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
        }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02, 3)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, frame: &[i16]) -> VadDecision {
        if frame_rms(frame) >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 480;

    fn loud() -> Vec<i16> {
        vec![16_000; FRAME]
    }

    fn silent() -> Vec<i16> {
        vec![0; FRAME]
    }

    #[test]
    fn silence_below_threshold() {
        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(vad.classify(&silent()), VadDecision::Silence);
    }

    #[test]
    fn speech_above_threshold() {
        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(vad.classify(&loud()), VadDecision::Speech);
    }

    #[test]
    fn hangover_extends_speech() {
        let mut vad = EnergyVad::new(0.02, 3);
        assert_eq!(vad.classify(&loud()), VadDecision::Speech);

        for _ in 0..3 {
            assert_eq!(vad.classify(&silent()), VadDecision::Speech);
        }
        assert_eq!(vad.classify(&silent()), VadDecision::Silence);
    }

    #[test]
    fn reset_clears_hangover() {
        let mut vad = EnergyVad::new(0.02, 5);
        vad.classify(&loud());
        vad.reset();
        assert_eq!(vad.classify(&silent()), VadDecision::Silence);
    }

    #[test]
    fn empty_frame_is_silence() {
        let mut vad = EnergyVad::default();
        assert_eq!(vad.classify(&[]), VadDecision::Silence);
    }

    #[test]
    fn rms_of_square_wave() {
        let frame: Vec<i16> = (0..256)
            .map(|i| if i % 2 == 0 { 16_384 } else { -16_384 })
            .collect();
        assert!((frame_rms(&frame) - 0.5).abs() < 1e-5);
    }
}
