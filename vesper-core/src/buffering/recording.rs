//! Linear capture buffer for a single utterance.
//!
//! Append-only until cleared. Appends that would exceed the fixed capacity are
//! rejected whole; the buffer never wraps or truncates.

use tracing::{info, warn};

use super::reserve_exact;
use crate::error::Result;

#[derive(Debug)]
pub struct RecordingAccumulator {
    samples: Vec<i16>,
    capacity: usize,
    sample_rate: u32,
    recording: bool,
}

impl RecordingAccumulator {
    /// Allocate room for `max_seconds` of audio at `sample_rate`.
    ///
    /// # Errors
    /// `VesperError::Allocation` if the buffer cannot be reserved.
    pub fn new(sample_rate: u32, max_seconds: u32) -> Result<Self> {
        let capacity = sample_rate as usize * max_seconds as usize;
        Self::with_capacity(sample_rate, capacity)
    }

    pub fn with_capacity(sample_rate: u32, capacity: usize) -> Result<Self> {
        let samples = reserve_exact("recording buffer", capacity)?;
        info!(
            bytes = capacity * std::mem::size_of::<i16>(),
            seconds = capacity as f32 / sample_rate.max(1) as f32,
            "recording buffer allocated"
        );
        Ok(Self {
            samples,
            capacity,
            sample_rate,
            recording: false,
        })
    }

    /// Begin a new recording: discards previous contents.
    pub fn start(&mut self) {
        self.samples.clear();
        self.recording = true;
        info!("recording started");
    }

    /// Stop accepting samples. Keeps the captured data.
    pub fn stop(&mut self) {
        self.recording = false;
        info!(
            samples = self.samples.len(),
            seconds = format_args!("{:.2}", self.duration_secs()),
            "recording stopped"
        );
    }

    /// Append a frame. Returns `false` without touching the buffer when not
    /// recording or when the frame does not fit.
    pub fn append(&mut self, frame: &[i16]) -> bool {
        if !self.recording {
            return false;
        }
        if self.samples.len() + frame.len() > self.capacity {
            warn!(
                length = self.samples.len(),
                capacity = self.capacity,
                incoming = frame.len(),
                "recording buffer full"
            );
            return false;
        }
        self.samples.extend_from_slice(frame);
        true
    }

    /// Reset the length to zero regardless of the recording flag.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Read-only view of everything captured so far.
    pub fn snapshot(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate.max(1) as f32
    }
}
