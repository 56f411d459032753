//! UDP transport.
//!
//! # Data Flow
//! ```text
//! UdpManager::init
//!     → acceptor.rs per port (one socket, one loop, many peers)
//!
//! datagram from a new endpoint → passive UdpConnection → on_accept
//! every datagram               → peer's DatagramQueue  → on_recv
//!
//! UdpManager::create_connection
//!     → connected socket per connection (connection.rs UdpDriver)
//! ```
//!
//! # Design Decisions
//! - Passive peers never touch the shared socket; the acceptor does all I/O
//! - Datagram boundaries are preserved end to end

pub(crate) mod acceptor;
pub mod connection;
pub mod manager;
pub mod service;

pub use connection::{UdpConnection, UdpContext};
pub use manager::UdpManager;
pub use service::UdpService;
