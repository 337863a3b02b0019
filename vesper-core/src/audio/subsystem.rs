//! `AudioSubsystem`: the façade the conversation layer talks to.
//!
//! Owns the recording accumulator, the legacy reply buffer, the streaming
//! ring and the drain thread. All fixed buffers are reserved in [`AudioSubsystem::new`];
//! if any reservation fails, whatever was already acquired is dropped and the
//! error is returned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{
    drain::{DrainConfig, PlaybackDrainTask},
    AudioOutput,
};
use crate::buffering::{
    EchoSink, RecordingAccumulator, ReplyBuffer, StreamDiagnosticsSnapshot, StreamingRingBuffer,
};
use crate::error::{Result, VesperError};

#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Conversation sample rate (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Recording accumulator length. Default: 10 s.
    pub max_recording_seconds: u32,
    /// Legacy reply buffer length. Default: 32 s.
    pub max_reply_seconds: u32,
    /// Streaming ring capacity in bytes. Default: 256 KiB (~8 s at 16 kHz).
    pub stream_capacity: usize,
    pub drain: DrainConfig,
    /// `play_reply` attempts. Default: 3.
    pub reply_retry_attempts: u32,
    pub reply_retry_backoff: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            max_recording_seconds: 10,
            max_reply_seconds: 32,
            stream_capacity: 256 * 1024,
            drain: DrainConfig::default(),
            reply_retry_attempts: 3,
            reply_retry_backoff: Duration::from_millis(100),
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(VesperError::Config("sample rate must be non-zero".into()));
        }
        if self.drain.chunk_bytes == 0 {
            return Err(VesperError::Config("drain chunk must be non-zero".into()));
        }
        if self.drain.chunk_bytes >= self.stream_capacity {
            return Err(VesperError::Config(format!(
                "drain chunk ({}) must be smaller than the stream capacity ({})",
                self.drain.chunk_bytes, self.stream_capacity
            )));
        }
        if self.reply_retry_attempts == 0 {
            return Err(VesperError::Config("reply retry attempts must be at least 1".into()));
        }
        Ok(())
    }
}

pub struct AudioSubsystem {
    config: AudioConfig,
    recording: RecordingAccumulator,
    reply: ReplyBuffer,
    stream: Arc<StreamingRingBuffer>,
    output: Arc<dyn AudioOutput>,
    _drain: PlaybackDrainTask,
}

impl AudioSubsystem {
    /// Reserve every buffer and start the drain thread.
    pub fn new(
        config: AudioConfig,
        output: Arc<dyn AudioOutput>,
        echo: Option<EchoSink>,
    ) -> Result<Self> {
        config.validate()?;
        let recording =
            RecordingAccumulator::new(config.sample_rate, config.max_recording_seconds)?;
        let reply = ReplyBuffer::new(config.sample_rate, config.max_reply_seconds)?;
        let stream = Arc::new(StreamingRingBuffer::new(config.stream_capacity)?);
        let drain =
            PlaybackDrainTask::spawn(Arc::clone(&stream), Arc::clone(&output), echo, config.drain)?;

        info!(
            recording_samples = recording.capacity(),
            reply_bytes = reply.capacity(),
            stream_bytes = stream.capacity(),
            "audio subsystem ready"
        );
        Ok(Self {
            config,
            recording,
            reply,
            stream,
            output,
            _drain: drain,
        })
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    // ── Recording ────────────────────────────────────────────────────────────

    pub fn start_recording(&mut self) {
        self.recording.start();
    }

    pub fn stop_recording(&mut self) {
        self.recording.stop();
    }

    pub fn append_recording(&mut self, frame: &[i16]) -> bool {
        self.recording.append(frame)
    }

    pub fn clear_recording(&mut self) {
        self.recording.clear();
    }

    pub fn recording(&self) -> &RecordingAccumulator {
        &self.recording
    }

    // ── Legacy reply ─────────────────────────────────────────────────────────

    pub fn receive_reply(&mut self, data: &[u8]) -> bool {
        let stored = self.reply.receive_complete(data);
        if !stored {
            warn!(
                bytes = data.len(),
                capacity = self.reply.capacity(),
                "reply exceeds buffer capacity"
            );
        }
        stored
    }

    pub fn has_reply(&self) -> bool {
        !self.reply.is_empty()
    }

    /// Play the stored reply, retrying the output driver with a fixed backoff.
    /// `delay` is called between failed attempts.
    pub fn play_reply(&mut self, mut delay: impl FnMut(Duration)) -> Result<()> {
        if self.reply.is_empty() {
            return Err(VesperError::NothingToPlay);
        }
        let attempts = self.config.reply_retry_attempts;
        let mut last = None;
        for attempt in 1..=attempts {
            match self.output.play_buffer(self.reply.bytes()) {
                Ok(()) => {
                    self.reply.mark_played();
                    info!(attempt, samples = self.reply.sample_count(), "reply played");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, attempts, "reply playback failed: {e}");
                    last = Some(e);
                    if attempt < attempts {
                        delay(self.config.reply_retry_backoff);
                    }
                }
            }
        }
        Err(last.unwrap_or(VesperError::NothingToPlay))
    }

    pub fn reply_played(&self) -> bool {
        self.reply.played()
    }

    pub fn reset_reply_played(&mut self) {
        self.reply.reset_played();
    }

    pub fn clear_reply(&mut self) {
        self.reply.clear();
    }

    /// Single attempt, never retried.
    pub fn play_one_shot(&self, pcm: &[u8]) -> Result<()> {
        self.output.play_buffer(pcm)
    }

    // ── Streaming ────────────────────────────────────────────────────────────

    pub fn begin_streaming(&self) {
        self.stream.begin_streaming();
    }

    pub fn write_stream_chunk(&self, data: &[u8]) -> bool {
        self.stream.write_chunk(data)
    }

    pub fn finish_streaming(&self) {
        self.stream.mark_finishing();
    }

    pub fn is_streaming_active(&self) -> bool {
        self.stream.is_active()
    }

    /// The current stream has been closed and is draining its remainder.
    pub fn is_stream_finishing(&self) -> bool {
        self.stream.is_finishing()
    }

    pub fn stream_diagnostics(&self) -> StreamDiagnosticsSnapshot {
        self.stream.diagnostics().snapshot()
    }

    /// Shared handle to the ring, for observers outside the control thread.
    pub fn shared_stream(&self) -> Arc<StreamingRingBuffer> {
        Arc::clone(&self.stream)
    }
}
