//! Receive-side byte accumulator.
//!
//! # Responsibilities
//! - Reserve space past the committed end for the next read (`prepare`)
//! - Record how much of that space the read filled (`commit`)
//! - Release bytes from the front once the service has parsed them (`consume`)
//! - Hold the watermark that gates `on_recv` dispatch

use bytes::{Buf, Bytes, BytesMut};

/// Default number of bytes requested by every read.
pub const DEFAULT_RECV_CHUNK: usize = 512;

/// Append-at-back, consume-from-front byte buffer.
///
/// `data()` always covers exactly the committed range. Space handed out by
/// `prepare` but never committed is discarded by the next `prepare` or `commit`.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: BytesMut,
    committed: usize,
    watermark: usize,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::with_watermark(1)
    }

    pub fn with_watermark(watermark: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(DEFAULT_RECV_CHUNK),
            committed: 0,
            watermark,
        }
    }

    /// Reserve `size` writable bytes directly after the committed range.
    pub fn prepare(&mut self, size: usize) -> &mut [u8] {
        self.buf.truncate(self.committed);
        self.buf.resize(self.committed + size, 0);
        &mut self.buf[self.committed..]
    }

    /// Mark `size` bytes of the prepared space as received.
    pub fn commit(&mut self, size: usize) {
        let available = self.buf.len() - self.committed;
        self.committed += size.min(available);
        self.buf.truncate(self.committed);
    }

    /// Drop `size` bytes from the front of the committed range.
    pub fn consume(&mut self, size: usize) {
        self.buf.truncate(self.committed);
        let size = size.min(self.committed);
        self.buf.advance(size);
        self.committed -= size;
    }

    /// The committed, not yet consumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.committed]
    }

    pub fn len(&self) -> usize {
        self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn set_watermark(&mut self, watermark: usize) {
        self.watermark = watermark;
    }

    /// True when enough bytes are buffered to dispatch `on_recv`.
    pub fn reached_watermark(&self) -> bool {
        self.committed >= self.watermark
    }

    /// Copy the first `out.len()` bytes without consuming them.
    pub fn copy_to(&self, out: &mut [u8]) -> bool {
        if out.len() > self.committed {
            return false;
        }
        out.copy_from_slice(&self.buf[..out.len()]);
        true
    }

    /// Copy the first `out.len()` bytes and consume them.
    pub fn move_to(&mut self, out: &mut [u8]) -> bool {
        if !self.copy_to(out) {
            return false;
        }
        self.consume(out.len());
        true
    }

    /// Consume `size` bytes without copying them anywhere.
    pub fn drop_front(&mut self, size: usize) -> bool {
        if size > self.committed {
            return false;
        }
        self.consume(size);
        true
    }

    /// Split off the first `size` bytes as an owned, immutable chunk.
    pub fn take(&mut self, size: usize) -> Option<Bytes> {
        if size > self.committed {
            return None;
        }
        self.buf.truncate(self.committed);
        self.committed -= size;
        Some(self.buf.split_to(size).freeze())
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}
