//! Event-loop runtime.
//!
//! # Data Flow
//! ```text
//! EventLoopPool::init(n)
//!     → n × event_loop.rs (thread + current-thread runtime)
//!
//! Manager asks for a loop
//!     → pool.rs get() (round robin)
//!     → loop.spawn / loop.post (work runs on that loop's thread)
//!
//! EventLoopPool::exit()
//!     → every loop's stop signal fires, queued work is dropped
//! ```
//!
//! # Design Decisions
//! - A connection is assigned to one loop when created and never migrates
//! - Cross-thread requests are posted to the owning loop, never locked

pub mod event_loop;
pub mod pool;

pub use event_loop::EventLoop;
pub use pool::{EventLoopPool, LoopSelector};
