//! Send-side FIFO of immutable chunks.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// Ordered queue of chunks waiting for the transport.
///
/// The owner keeps exactly one write in flight while the queue is non-empty:
/// `push` reports whether the queue was empty, which is the signal to start a
/// write, and the front chunk stays queued until its write completes.
#[derive(Debug)]
pub struct SendQueue<T = Bytes> {
    chunks: VecDeque<T>,
}

impl<T> SendQueue<T> {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
        }
    }

    /// Append a chunk. Returns true if the queue was empty before the append.
    pub fn push(&mut self, chunk: T) -> bool {
        let was_empty = self.chunks.is_empty();
        self.chunks.push_back(chunk);
        was_empty
    }

    pub fn front(&self) -> Option<&T> {
        self.chunks.front()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.chunks.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

impl SendQueue<Bytes> {
    /// Bytes of the front chunk not yet accepted by the transport.
    pub fn unwritten(&self) -> &[u8] {
        self.chunks.front().map(|chunk| chunk.as_ref()).unwrap_or(&[])
    }

    /// Record that the transport accepted `written` bytes of the front chunk.
    ///
    /// Returns true when this completed the front chunk and it was popped.
    pub fn advance(&mut self, written: usize) -> bool {
        let Some(front) = self.chunks.front_mut() else {
            return false;
        };
        let written = written.min(front.len());
        front.advance(written);
        if front.is_empty() {
            self.chunks.pop_front();
            true
        } else {
            false
        }
    }

    /// Total bytes still queued.
    pub fn queued_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

impl<T> Default for SendQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reports_empty_transition() {
        let mut queue = SendQueue::new();
        assert!(queue.push(Bytes::from_static(b"a")));
        assert!(!queue.push(Bytes::from_static(b"b")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn partial_writes_keep_front_queued() {
        let mut queue = SendQueue::new();
        queue.push(Bytes::from_static(b"hello"));
        queue.push(Bytes::from_static(b"world"));

        assert!(!queue.advance(2));
        assert_eq!(queue.unwritten(), b"llo");
        assert!(queue.advance(3));
        assert_eq!(queue.unwritten(), b"world");
        assert!(queue.advance(5));
        assert!(queue.is_empty());
        assert_eq!(queue.unwritten(), b"");
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut queue = SendQueue::new();
        for chunk in ["one", "two", "three"] {
            queue.push(Bytes::from(chunk));
        }
        assert_eq!(queue.queued_bytes(), 11);

        let mut out = Vec::new();
        while !queue.is_empty() {
            let n = queue.unwritten().len().min(2);
            out.extend_from_slice(&queue.unwritten()[..n]);
            queue.advance(n);
        }
        assert_eq!(out, b"onetwothree");
    }

    #[test]
    fn advance_on_empty_queue_is_harmless() {
        let mut queue: SendQueue = SendQueue::new();
        assert!(!queue.advance(10));
    }
}
