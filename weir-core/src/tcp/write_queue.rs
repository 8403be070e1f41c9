//! The send-side byte queue.
//!
//! The queue splits the outgoing stream at SND.NXT: everything before it has
//! been segmentized and sent at least once but not acknowledged, everything
//! after it is waiting for window. Retransmission rebuilds segments from the
//! unacknowledged prefix, so no per-segment copies are kept.

use crate::message::Message;

/// Outgoing stream bytes, split into sent-but-unacknowledged and not yet
/// sent. The invariant the connection machine relies on: `unacked.len()`
/// equals the number of data bytes in `[SND.UNA, SND.NXT)`.
#[derive(Debug, Default)]
pub struct WriteQueue {
    unacked: Message,
    unsent: Message,
}

impl WriteQueue {
    /// Appends a user chunk to the queue.
    pub fn push(&mut self, chunk: Message) {
        self.unsent.concatenate(chunk);
    }

    /// The number of bytes not yet segmentized.
    pub fn remaining(&self) -> usize {
        self.unsent.len()
    }

    /// Whether any bytes remain to be sent for the first time.
    pub fn has_remaining(&self) -> bool {
        !self.unsent.is_empty()
    }

    /// The number of bytes sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    /// Takes up to `max` bytes off the front of the unsent stream and moves
    /// them into the unacknowledged region. The caller advances SND.NXT by
    /// the length of the returned message.
    pub fn advance(&mut self, max: usize) -> Message {
        let taken = self.unsent.cut(max.min(self.unsent.len()));
        self.unacked.concatenate(taken.clone());
        taken
    }

    /// Releases `n` acknowledged bytes from the front of the queue.
    pub fn acknowledge(&mut self, n: usize) {
        self.unacked.remove_front(n.min(self.unacked.len()));
    }

    /// A copy of up to `max` bytes starting at SND.UNA, for retransmission.
    /// The underlying chunks are shared, not duplicated.
    pub fn una_chunk(&self, max: usize) -> Message {
        let mut copy = self.unacked.clone();
        copy.cut(max.min(copy.len()))
    }

    /// Drops everything. Used on abort.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_bytes_into_flight() {
        let mut queue = WriteQueue::default();
        queue.push(Message::new(b"hello world"));
        let first = queue.advance(5);
        assert_eq!(first.to_vec(), b"hello");
        assert_eq!(queue.in_flight(), 5);
        assert_eq!(queue.remaining(), 6);
    }

    #[test]
    fn acknowledge_releases_the_prefix() {
        let mut queue = WriteQueue::default();
        queue.push(Message::new(b"abcdef"));
        queue.advance(6);
        queue.acknowledge(4);
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(queue.una_chunk(10).to_vec(), b"ef");
    }

    #[test]
    fn una_chunk_is_bounded() {
        let mut queue = WriteQueue::default();
        queue.push(Message::new(b"abcdef"));
        queue.advance(6);
        assert_eq!(queue.una_chunk(3).to_vec(), b"abc");
        // Taking a copy must not consume the queue.
        assert_eq!(queue.in_flight(), 6);
    }

    #[test]
    fn push_concatenates_chunks() {
        let mut queue = WriteQueue::default();
        queue.push(Message::new(b"ab"));
        queue.push(Message::new(b"cd"));
        assert_eq!(queue.advance(3).to_vec(), b"abc");
        assert_eq!(queue.advance(3).to_vec(), b"d");
    }
}
