//! Wake-word detection seam.
//!
//! A real deployment plugs a keyword-spotting model in behind
//! [`WakeWordDetector`]. [`EnergyWakeTrigger`] is a stand-in that fires after
//! a run of consecutive loud frames, enough to drive the appliance from a
//! desk microphone with a clap or a spoken word.

use crate::vad::frame_rms;

/// Per-frame wake verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeVerdict {
    Detected,
    NotDetected,
}

impl WakeVerdict {
    pub fn is_detected(self) -> bool {
        self == WakeVerdict::Detected
    }
}

pub trait WakeWordDetector: Send + 'static {
    /// Samples per frame the detector expects; the capture frame size follows it.
    fn frame_len(&self) -> usize;

    fn detect(&mut self, frame: &[i16]) -> WakeVerdict;

    fn reset(&mut self);
}

/// Fires once `required_frames` consecutive frames exceed `threshold`, then
/// stays quiet until the level drops again.
#[derive(Debug, Clone)]
pub struct EnergyWakeTrigger {
    frame_len: usize,
    threshold: f32,
    required_frames: u32,
    consecutive: u32,
    fired: bool,
}

impl EnergyWakeTrigger {
    pub fn new(frame_len: usize, threshold: f32, required_frames: u32) -> Self {
        Self {
            frame_len,
            threshold,
            required_frames: required_frames.max(1),
            consecutive: 0,
            fired: false,
        }
    }
}

impl Default for EnergyWakeTrigger {
    /// 30 ms frames at 16 kHz; ~300 ms of sustained level.
    fn default() -> Self {
        Self::new(480, 0.08, 10)
    }
}

impl WakeWordDetector for EnergyWakeTrigger {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn detect(&mut self, frame: &[i16]) -> WakeVerdict {
        if frame_rms(frame) >= self.threshold {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 0;
            self.fired = false;
        }
        if !self.fired && self.consecutive >= self.required_frames {
            self.fired = true;
            WakeVerdict::Detected
        } else {
            WakeVerdict::NotDetected
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
        self.fired = false;
    }
}
