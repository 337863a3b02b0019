//! Fixed-capacity buffer for a single, fully received reply.
//!
//! Only the legacy non-streamed reply path uses this; streamed replies go
//! through [`super::StreamingRingBuffer`].

use tracing::{info, warn};

use super::reserve_exact;
use crate::error::Result;

#[derive(Debug)]
pub struct ReplyBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    played: bool,
}

impl ReplyBuffer {
    /// Allocate room for `max_seconds` of 16-bit mono audio at `sample_rate`.
    pub fn new(sample_rate: u32, max_seconds: u32) -> Result<Self> {
        let capacity = sample_rate as usize * max_seconds as usize * std::mem::size_of::<i16>();
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let bytes = reserve_exact("reply buffer", capacity)?;
        info!(bytes = capacity, "reply buffer allocated");
        Ok(Self {
            bytes,
            capacity,
            played: false,
        })
    }

    /// Store a complete reply verbatim. Rejects payloads larger than the buffer.
    pub fn receive_complete(&mut self, data: &[u8]) -> bool {
        if data.len() > self.capacity {
            warn!(
                size = data.len(),
                capacity = self.capacity,
                "reply larger than reply buffer"
            );
            return false;
        }
        self.bytes.clear();
        self.bytes.extend_from_slice(data);
        info!(
            bytes = data.len(),
            samples = self.sample_count(),
            "complete reply received"
        );
        true
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / std::mem::size_of::<i16>()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn played(&self) -> bool {
        self.played
    }

    pub(crate) fn mark_played(&mut self) {
        self.played = true;
    }

    /// Clear the played latch before the next turn. Keeps the stored bytes.
    pub fn reset_played(&mut self) {
        self.played = false;
    }

    /// Drop the stored reply and the played latch.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.played = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_reply_is_rejected() {
        let mut reply = ReplyBuffer::with_capacity(4).unwrap();
        assert!(!reply.receive_complete(&[0; 5]));
        assert!(reply.is_empty());
    }

    #[test]
    fn reply_replaces_previous_contents() {
        let mut reply = ReplyBuffer::with_capacity(8).unwrap();
        assert!(reply.receive_complete(&[1, 2, 3, 4]));
        assert!(reply.receive_complete(&[9, 9, 9]));
        assert_eq!(reply.bytes(), &[9, 9, 9]);
        assert_eq!(reply.sample_count(), 1);
    }

    #[test]
    fn played_latch_resets_independently_of_data() {
        let mut reply = ReplyBuffer::with_capacity(8).unwrap();
        reply.receive_complete(&[1, 2]);
        reply.mark_played();
        assert!(reply.played());
        reply.reset_played();
        assert!(!reply.played());
        assert_eq!(reply.bytes(), &[1, 2]);
    }

    #[test]
    fn capacity_is_in_bytes() {
        let reply = ReplyBuffer::new(16_000, 2).unwrap();
        assert_eq!(reply.capacity(), 64_000);
    }
}
