//! Echo-reference records forwarded from the playback path.
//!
//! An echo canceller subtracts what the speaker just played from the
//! microphone signal. The drain thread pushes every played chunk into a
//! bounded queue; when the queue is full the record is dropped rather than
//! stalling playback.

use crossbeam_channel::{Sender, TrySendError};
use tracing::trace;

use super::pcm::bytes_to_samples_into;

/// Maximum samples per record (20 ms at 16 kHz).
pub const ECHO_REFERENCE_SAMPLES: usize = 320;

/// One batch of played samples.
#[derive(Debug, Clone, Copy)]
pub struct EchoReference {
    pub samples: [i16; ECHO_REFERENCE_SAMPLES],
    /// Valid samples in `samples`.
    pub count: usize,
    /// Milliseconds since the drain thread started.
    pub timestamp_ms: u32,
}

impl EchoReference {
    pub fn as_slice(&self) -> &[i16] {
        &self.samples[..self.count]
    }
}

/// Non-blocking producer side of the echo-reference queue.
#[derive(Debug, Clone)]
pub struct EchoSink {
    tx: Sender<EchoReference>,
}

impl EchoSink {
    pub fn new(tx: Sender<EchoReference>) -> Self {
        Self { tx }
    }

    /// Split `pcm` into records of at most [`ECHO_REFERENCE_SAMPLES`] and push
    /// each without blocking. Returns how many records were dropped.
    pub fn forward(&self, pcm: &[u8], timestamp_ms: u32) -> usize {
        let mut dropped = 0;
        for bytes in pcm.chunks(ECHO_REFERENCE_SAMPLES * 2) {
            let mut record = EchoReference {
                samples: [0; ECHO_REFERENCE_SAMPLES],
                count: 0,
                timestamp_ms,
            };
            record.count = bytes_to_samples_into(bytes, &mut record.samples);
            if record.count == 0 {
                continue;
            }
            match self.tx.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    trace!(samples = record.count, "echo reference queue full, dropping");
                    dropped += 1;
                }
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::pcm::samples_to_bytes;
    use crossbeam_channel::bounded;

    #[test]
    fn splits_large_chunks_into_bounded_records() {
        let (tx, rx) = bounded(8);
        let sink = EchoSink::new(tx);
        let samples: Vec<i16> = (0..700).map(|i| i as i16).collect();
        assert_eq!(sink.forward(&samples_to_bytes(&samples), 42), 0);

        let records: Vec<EchoReference> = rx.try_iter().collect();
        assert_eq!(
            records.iter().map(|r| r.count).collect::<Vec<_>>(),
            vec![320, 320, 60]
        );
        assert_eq!(records[2].as_slice()[0], 640);
        assert!(records.iter().all(|r| r.timestamp_ms == 42));
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (tx, rx) = bounded(1);
        let sink = EchoSink::new(tx);
        let pcm = samples_to_bytes(&[1i16; 640]);
        assert_eq!(sink.forward(&pcm, 0), 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn disconnected_queue_counts_as_dropped() {
        let (tx, rx) = bounded(4);
        drop(rx);
        let sink = EchoSink::new(tx);
        assert_eq!(sink.forward(&samples_to_bytes(&[1i16; 10]), 0), 1);
    }
}
