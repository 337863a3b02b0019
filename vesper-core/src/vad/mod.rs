//! Voice Activity Detection (VAD) abstraction.
//!
//! The `VoiceActivityDetector` trait is the seam where a model-backed
//! detector plugs in. `EnergyVad` is the built-in stand-in.

pub mod energy;

pub use energy::EnergyVad;

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The frame contains speech energy above threshold.
    Speech,
    /// The frame is silent (or below threshold, including hangover period).
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful (hangover counters, RNN hidden states, etc.).
pub trait VoiceActivityDetector: Send + 'static {
    /// Classify one capture frame (16 kHz mono).
    fn classify(&mut self, frame: &[i16]) -> VadDecision;

    /// Reset any internal state (e.g. hangover counters, hidden states).
    fn reset(&mut self);
}

/// Root-mean-square of a 16-bit frame, normalised to [0.0, 1.0].
pub fn frame_rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame
        .iter()
        .map(|s| {
            let v = *s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum_sq / frame.len() as f64).sqrt() as f32
}
