//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Loops, listeners, acceptors and connection drivers produce:
//!     → tracing events (connection_id, peer_addr, port, error fields)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers (installed by the binary):
//!     → logging.rs (fmt subscriber with env filter)
//!     → Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - Metrics are cheap (atomic increments) and no-ops without a recorder
//! - Per-read and per-write events log at trace level only

pub mod logging;
pub mod metrics;
