//! Fixed-capacity circular byte buffer between network arrival and playback.
//!
//! ## Ownership
//!
//! Single producer (the control loop) and single consumer (the playback drain
//! thread). The producer owns `write_pos`, the consumer owns `read_pos`; each
//! cursor is published with a `Release` store and read with an `Acquire` load,
//! so bytes copied before a cursor update are visible to the other side once
//! it observes the new cursor. Storage cells are `AtomicU8` so the handoff
//! needs no `unsafe`.
//!
//! One slot is permanently reserved: at most `capacity - 1` bytes are valid,
//! which keeps "full" and "empty" distinguishable from the cursors alone.
//!
//! ## Lifecycle
//!
//! ```text
//! begin_streaming()  active=true, finishing=false, cursors=0
//!     └─► write_chunk()* ... drain_step()*
//!         └─► mark_finishing()   (no more input)
//!             └─► drain_step()   flushes the short tail, active=false
//! ```
//!
//! `finishing` stays latched after the drain has finished; every write is
//! rejected once either `finishing` is set or `active` is cleared, so the
//! drain-side cursor reset never races a producer write.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use tracing::{debug, info};

use super::reserve_exact;
use crate::error::{Result, VesperError};

/// Outcome of a single [`StreamingRingBuffer::drain_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    /// No stream in progress.
    Inactive,
    /// Streaming, but less than one chunk buffered and more input expected.
    Idle,
    /// One full chunk of `n` bytes was copied out.
    Chunk(usize),
    /// The last `n` bytes (shorter than a chunk) were copied out; the stream is over.
    Tail(usize),
    /// Nothing was left when finishing was observed; the stream is over.
    Finished,
}

#[derive(Default)]
pub struct StreamDiagnostics {
    pub chunks_written: AtomicUsize,
    pub chunks_rejected: AtomicUsize,
    pub chunks_drained: AtomicUsize,
    pub bytes_drained: AtomicUsize,
    pub output_errors: AtomicUsize,
    pub echo_dropped: AtomicUsize,
}

impl StreamDiagnostics {
    pub fn reset(&self) {
        self.chunks_written.store(0, Ordering::Relaxed);
        self.chunks_rejected.store(0, Ordering::Relaxed);
        self.chunks_drained.store(0, Ordering::Relaxed);
        self.bytes_drained.store(0, Ordering::Relaxed);
        self.output_errors.store(0, Ordering::Relaxed);
        self.echo_dropped.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamDiagnosticsSnapshot {
        StreamDiagnosticsSnapshot {
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            chunks_drained: self.chunks_drained.load(Ordering::Relaxed),
            bytes_drained: self.bytes_drained.load(Ordering::Relaxed),
            output_errors: self.output_errors.load(Ordering::Relaxed),
            echo_dropped: self.echo_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamDiagnosticsSnapshot {
    pub chunks_written: usize,
    pub chunks_rejected: usize,
    pub chunks_drained: usize,
    pub bytes_drained: usize,
    pub output_errors: usize,
    pub echo_dropped: usize,
}

pub struct StreamingRingBuffer {
    storage: Box<[AtomicU8]>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    finishing: AtomicBool,
    active: AtomicBool,
    diagnostics: StreamDiagnostics,
}

impl StreamingRingBuffer {
    /// Allocate a ring holding up to `capacity - 1` bytes.
    ///
    /// # Errors
    /// `VesperError::Config` for a capacity below 2, `VesperError::Allocation`
    /// when the storage cannot be reserved.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(VesperError::Config(format!(
                "streaming buffer capacity must be at least 2 bytes, got {capacity}"
            )));
        }
        let mut storage = reserve_exact::<AtomicU8>("streaming buffer", capacity)?;
        storage.extend((0..capacity).map(|_| AtomicU8::new(0)));
        info!(bytes = capacity, "streaming buffer allocated");

        Ok(Self {
            storage: storage.into_boxed_slice(),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            finishing: AtomicBool::new(false),
            active: AtomicBool::new(false),
            diagnostics: StreamDiagnostics::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Start a new stream, discarding anything left from a previous turn.
    pub fn begin_streaming(&self) {
        // Publish the cleared state before `active` flips so the drain never
        // sees an active stream with stale cursors.
        self.active.store(false, Ordering::Release);
        self.write_pos.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Relaxed);
        for cell in self.storage.iter() {
            cell.store(0, Ordering::Relaxed);
        }
        self.finishing.store(false, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
        info!("streaming playback started");
    }

    /// Copy `data` in whole. Returns `false`, leaving the ring untouched, when
    /// the stream is not accepting input or `data` exceeds the free space.
    ///
    /// Input is also refused once `mark_finishing` has been called, until the
    /// next `begin_streaming`: the drain resets the cursors after its final
    /// step, and a late write would race that reset. Callers with more audio
    /// for a finishing stream hold it until `is_active` goes false.
    pub fn write_chunk(&self, data: &[u8]) -> bool {
        if self.finishing.load(Ordering::Acquire) || !self.active.load(Ordering::Acquire) {
            return false;
        }
        let space = self.available_space();
        if data.len() > space {
            self.diagnostics
                .chunks_rejected
                .fetch_add(1, Ordering::Relaxed);
            debug!(size = data.len(), space, "streaming buffer rejected chunk");
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let capacity = self.capacity();
        let write = self.write_pos.load(Ordering::Relaxed);
        let to_end = capacity - write;
        let (head, tail) = data.split_at(data.len().min(to_end));
        for (cell, byte) in self.storage[write..].iter().zip(head) {
            cell.store(*byte, Ordering::Relaxed);
        }
        for (cell, byte) in self.storage.iter().zip(tail) {
            cell.store(*byte, Ordering::Relaxed);
        }
        self.write_pos
            .store((write + data.len()) % capacity, Ordering::Release);
        self.diagnostics
            .chunks_written
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Signal that no more input will arrive; the drain flushes what is left
    /// and then clears `active`.
    pub fn mark_finishing(&self) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        info!(
            buffered = self.available_data(),
            "streaming input finished, draining remainder"
        );
        self.finishing.store(true, Ordering::Release);
    }

    /// `true` from `begin_streaming` until the drain has flushed the last byte.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Still draining after `mark_finishing`; writes are refused.
    pub fn is_finishing(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.finishing.load(Ordering::Acquire)
    }

    pub fn available_data(&self) -> usize {
        let capacity = self.capacity();
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        (write + capacity - read) % capacity
    }

    pub fn available_space(&self) -> usize {
        self.capacity() - 1 - self.available_data()
    }

    /// Consumer side: move at most one chunk (`out.len()` bytes) out of the ring.
    pub fn drain_step(&self, out: &mut [u8]) -> DrainStep {
        if !self.active.load(Ordering::Acquire) {
            return DrainStep::Inactive;
        }
        // Read `finishing` before sizing the backlog: every write that precedes
        // the flag is then included in `available`.
        let finishing = self.finishing.load(Ordering::Acquire);
        let available = self.available_data();
        let chunk = out.len();

        if chunk > 0 && available >= chunk {
            self.read_into(&mut out[..chunk]);
            self.diagnostics
                .chunks_drained
                .fetch_add(1, Ordering::Relaxed);
            self.diagnostics
                .bytes_drained
                .fetch_add(chunk, Ordering::Relaxed);
            DrainStep::Chunk(chunk)
        } else if finishing && available > 0 {
            self.read_into(&mut out[..available]);
            self.diagnostics
                .chunks_drained
                .fetch_add(1, Ordering::Relaxed);
            self.diagnostics
                .bytes_drained
                .fetch_add(available, Ordering::Relaxed);
            self.read_pos.store(0, Ordering::Relaxed);
            self.write_pos.store(0, Ordering::Relaxed);
            self.active.store(false, Ordering::Release);
            DrainStep::Tail(available)
        } else if finishing {
            self.active.store(false, Ordering::Release);
            DrainStep::Finished
        } else {
            DrainStep::Idle
        }
    }

    pub fn diagnostics(&self) -> &StreamDiagnostics {
        &self.diagnostics
    }

    fn read_into(&self, out: &mut [u8]) {
        let capacity = self.capacity();
        let read = self.read_pos.load(Ordering::Relaxed);
        let to_end = capacity - read;
        let (head, tail) = out.split_at_mut(out.len().min(to_end));
        for (byte, cell) in head.iter_mut().zip(self.storage[read..].iter()) {
            *byte = cell.load(Ordering::Relaxed);
        }
        for (byte, cell) in tail.iter_mut().zip(self.storage.iter()) {
            *byte = cell.load(Ordering::Relaxed);
        }
        self.read_pos
            .store((read + out.len()) % capacity, Ordering::Release);
    }
}

impl std::fmt::Debug for StreamingRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRingBuffer")
            .field("capacity", &self.capacity())
            .field("available_data", &self.available_data())
            .field("active", &self.is_active())
            .field("finishing", &self.finishing.load(Ordering::Relaxed))
            .finish()
    }
}
