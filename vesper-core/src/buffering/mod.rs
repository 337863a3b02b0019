//! Audio buffers.
//!
//! | Buffer | Producer | Consumer |
//! |--------|----------|----------|
//! | [`AudioProducer`]/[`AudioConsumer`] | cpal callback | control / speaker thread |
//! | [`RecordingAccumulator`] | control loop | control loop (pre-roll) |
//! | [`ReplyBuffer`] | control loop | control loop (legacy playback) |
//! | [`StreamingRingBuffer`] | control loop | playback drain thread |
//!
//! The device-facing rings use `ringbuf::HeapRb<f32>`, whose `push_slice` is
//! wait-free and safe to call from a real-time audio callback.

pub mod echo;
pub mod pcm;
pub mod recording;
pub mod reply;
pub mod stream;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

pub use echo::{EchoReference, EchoSink, ECHO_REFERENCE_SAMPLES};
pub use recording::RecordingAccumulator;
pub use reply::ReplyBuffer;
pub use stream::{DrainStep, StreamDiagnostics, StreamDiagnosticsSnapshot, StreamingRingBuffer};

use crate::error::{Result, VesperError};

/// Type alias for the producer half of a device ring.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half of a device ring.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Device ring capacity: 2^17 = 131 072 f32 samples ≈ 2.7 s at 48 kHz.
pub const DEVICE_RING_CAPACITY: usize = 1 << 17;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(DEVICE_RING_CAPACITY).split()
}

/// Reserve an empty `Vec` with exactly `len` slots, reporting failure instead
/// of aborting the process.
pub(crate) fn reserve_exact<T>(what: &'static str, len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| VesperError::Allocation {
            what,
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
        })?;
    Ok(buf)
}
