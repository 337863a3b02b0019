//! Playback drain activity.
//!
//! Runs on its own thread, independent of the control loop:
//!
//! ```text
//! loop {
//!     drain_step(chunk)
//!       Inactive  → sleep inactive_poll
//!       Idle      → sleep idle_poll
//!       Chunk(n)  → output.play_stream_chunk, echo.forward
//!       Tail(n)   → output.play_stream_chunk, echo.forward, output.stop_output
//!       Finished  → output.stop_output
//! }
//! ```
//!
//! Output calls block; that is acceptable here because the control loop only
//! ever polls [`StreamingRingBuffer::is_active`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::AudioOutput;
use crate::buffering::{DrainStep, EchoSink, StreamingRingBuffer};
use crate::error::{Result, VesperError};

#[derive(Debug, Clone, Copy)]
pub struct DrainConfig {
    /// Bytes handed to the output driver per call.
    pub chunk_bytes: usize,
    /// Sleep while streaming but starved.
    pub idle_poll: Duration,
    /// Sleep while no stream is active.
    pub inactive_poll: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 1024,
            idle_poll: Duration::from_millis(10),
            inactive_poll: Duration::from_millis(100),
        }
    }
}

/// Handle to the running drain thread. Dropping it stops and joins the thread.
pub struct PlaybackDrainTask {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackDrainTask {
    pub fn spawn(
        ring: Arc<StreamingRingBuffer>,
        output: Arc<dyn AudioOutput>,
        echo: Option<EchoSink>,
        config: DrainConfig,
    ) -> Result<Self> {
        if config.chunk_bytes == 0 {
            return Err(VesperError::Config("drain chunk must be non-zero".into()));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("vesper-playback-drain".into())
            .spawn(move || drain_loop(&ring, output.as_ref(), echo.as_ref(), config, &stop))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit after its current step and wait for it.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("playback drain thread panicked");
            }
        }
    }
}

impl Drop for PlaybackDrainTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_loop(
    ring: &StreamingRingBuffer,
    output: &dyn AudioOutput,
    echo: Option<&EchoSink>,
    config: DrainConfig,
    shutdown: &AtomicBool,
) {
    info!(chunk_bytes = config.chunk_bytes, "playback drain running");
    let started = Instant::now();
    let mut chunk = vec![0u8; config.chunk_bytes];

    while !shutdown.load(Ordering::Acquire) {
        match ring.drain_step(&mut chunk) {
            DrainStep::Inactive => thread::sleep(config.inactive_poll),
            DrainStep::Idle => thread::sleep(config.idle_poll),
            DrainStep::Chunk(n) => {
                play_and_forward(ring, output, echo, &chunk[..n], started);
            }
            DrainStep::Tail(n) => {
                debug!(bytes = n, "draining final short chunk");
                play_and_forward(ring, output, echo, &chunk[..n], started);
                finish(ring, output);
            }
            DrainStep::Finished => finish(ring, output),
        }
    }
    info!("playback drain stopped");
}

fn play_and_forward(
    ring: &StreamingRingBuffer,
    output: &dyn AudioOutput,
    echo: Option<&EchoSink>,
    pcm: &[u8],
    started: Instant,
) {
    if let Err(e) = output.play_stream_chunk(pcm) {
        ring.diagnostics()
            .output_errors
            .fetch_add(1, Ordering::Relaxed);
        warn!(bytes = pcm.len(), "stream chunk output failed: {e}");
    }
    if let Some(sink) = echo {
        let timestamp_ms = started.elapsed().as_millis() as u32;
        let dropped = sink.forward(pcm, timestamp_ms);
        if dropped > 0 {
            ring.diagnostics()
                .echo_dropped
                .fetch_add(dropped, Ordering::Relaxed);
        }
    }
}

fn finish(ring: &StreamingRingBuffer, output: &dyn AudioOutput) {
    if let Err(e) = output.stop_output() {
        ring.diagnostics()
            .output_errors
            .fetch_add(1, Ordering::Relaxed);
        warn!("stop_output failed: {e}");
    }
    info!("streaming playback drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::EchoReference;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Chunk(Vec<u8>),
        Stop,
    }

    #[derive(Default)]
    struct RecordingOutput {
        calls: Mutex<Vec<Call>>,
        fail_chunks: bool,
    }

    impl AudioOutput for RecordingOutput {
        fn play_buffer(&self, _pcm: &[u8]) -> Result<()> {
            Ok(())
        }
        fn play_stream_chunk(&self, pcm: &[u8]) -> Result<()> {
            self.calls.lock().push(Call::Chunk(pcm.to_vec()));
            if self.fail_chunks {
                return Err(VesperError::Output("speaker unplugged".into()));
            }
            Ok(())
        }
        fn stop_output(&self) -> Result<()> {
            self.calls.lock().push(Call::Stop);
            Ok(())
        }
    }

    fn fast_config(chunk_bytes: usize) -> DrainConfig {
        DrainConfig {
            chunk_bytes,
            idle_poll: Duration::from_millis(1),
            inactive_poll: Duration::from_millis(1),
        }
    }

    fn wait_inactive(ring: &StreamingRingBuffer) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while ring.is_active() {
            assert!(Instant::now() < deadline, "drain did not finish");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn drains_full_chunks_then_the_tail_then_stops_output() {
        let ring = Arc::new(StreamingRingBuffer::new(64).unwrap());
        let output = Arc::new(RecordingOutput::default());
        let mut task =
            PlaybackDrainTask::spawn(Arc::clone(&ring), output.clone(), None, fast_config(8))
                .unwrap();

        ring.begin_streaming();
        let data: Vec<u8> = (0..20).collect();
        assert!(ring.write_chunk(&data));
        ring.mark_finishing();
        wait_inactive(&ring);
        task.stop();

        let calls = output.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                Call::Chunk((0..8).collect()),
                Call::Chunk((8..16).collect()),
                Call::Chunk((16..20).collect()),
                Call::Stop,
            ]
        );
    }

    #[test]
    fn finishing_an_empty_stream_makes_no_chunk_call() {
        let ring = Arc::new(StreamingRingBuffer::new(64).unwrap());
        let output = Arc::new(RecordingOutput::default());
        let mut task =
            PlaybackDrainTask::spawn(Arc::clone(&ring), output.clone(), None, fast_config(8))
                .unwrap();

        ring.begin_streaming();
        ring.mark_finishing();
        wait_inactive(&ring);
        task.stop();

        assert_eq!(output.calls.lock().clone(), vec![Call::Stop]);
    }

    #[test]
    fn drained_audio_is_forwarded_as_echo_reference() {
        let ring = Arc::new(StreamingRingBuffer::new(4096).unwrap());
        let output = Arc::new(RecordingOutput::default());
        let (tx, rx) = crossbeam_channel::bounded::<EchoReference>(8);
        let mut task = PlaybackDrainTask::spawn(
            Arc::clone(&ring),
            output,
            Some(EchoSink::new(tx)),
            fast_config(1024),
        )
        .unwrap();

        ring.begin_streaming();
        let pcm = crate::buffering::pcm::samples_to_bytes(&[7i16; 512]);
        assert!(ring.write_chunk(&pcm));
        ring.mark_finishing();
        wait_inactive(&ring);
        task.stop();

        let counts: Vec<usize> = rx.try_iter().map(|r| r.count).collect();
        assert_eq!(counts, vec![320, 192]);
    }

    #[test]
    fn output_failures_are_counted_and_draining_continues() {
        let ring = Arc::new(StreamingRingBuffer::new(64).unwrap());
        let output = Arc::new(RecordingOutput {
            fail_chunks: true,
            ..Default::default()
        });
        let mut task =
            PlaybackDrainTask::spawn(Arc::clone(&ring), output, None, fast_config(4)).unwrap();

        ring.begin_streaming();
        ring.write_chunk(&[1; 8]);
        ring.mark_finishing();
        wait_inactive(&ring);
        task.stop();

        assert_eq!(ring.diagnostics().snapshot().output_errors, 2);
    }

    #[test]
    fn zero_chunk_is_rejected() {
        let ring = Arc::new(StreamingRingBuffer::new(64).unwrap());
        let output = Arc::new(RecordingOutput::default());
        assert!(PlaybackDrainTask::spawn(ring, output, None, fast_config(0)).is_err());
    }
}
