//! Per-connection queue of received datagrams.

use bytes::Bytes;
use std::collections::VecDeque;

/// Received datagrams, kept whole and in arrival order.
#[derive(Debug, Default)]
pub struct DatagramQueue {
    datagrams: VecDeque<Bytes>,
}

impl DatagramQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, datagram: Bytes) {
        self.datagrams.push_back(datagram);
    }

    pub fn has_data(&self) -> bool {
        !self.datagrams.is_empty()
    }

    /// Payload of the oldest datagram, empty when nothing is queued.
    pub fn front(&self) -> &[u8] {
        self.datagrams.front().map(|d| d.as_ref()).unwrap_or(&[])
    }

    pub fn front_len(&self) -> usize {
        self.datagrams.front().map(Bytes::len).unwrap_or(0)
    }

    /// Discard the oldest datagram; `len` must equal its length.
    pub fn drop_front(&mut self, len: usize) -> bool {
        match self.datagrams.front() {
            Some(front) if front.len() == len => {
                self.datagrams.pop_front();
                true
            }
            _ => false,
        }
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.datagrams.pop_front()
    }

    /// Number of queued datagrams.
    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }
}
