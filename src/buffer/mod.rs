//! Buffering primitives owned by every connection.
//!
//! # Data Flow
//! ```text
//! socket read  → recv.rs (prepare → commit)
//!              → service on_recv inspects data(), consumes what it parsed
//!
//! send_buffer_fill → send.rs (push; start a write if it was empty)
//!                  → write completes → advance/pop → next chunk or on_send
//!
//! datagram in  → datagram.rs (one entry per datagram, never merged)
//! ```
//!
//! # Design Decisions
//! - Buffers are plain single-owner values; only the owning loop touches them
//! - Chunks are `Bytes` so forwarding never copies twice

pub mod datagram;
pub mod recv;
pub mod send;

pub use datagram::DatagramQueue;
pub use recv::{RecvBuffer, DEFAULT_RECV_CHUNK};
pub use send::SendQueue;
