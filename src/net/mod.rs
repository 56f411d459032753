//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound connect
//!     → resolve.rs (host + service → candidate addresses, tried in order)
//!     → socket.rs (optional bind-before-connect)
//!     → tls.rs (optional client handshake)
//!     → transport.rs (plain or TLS stream behind one interface)
//!
//! Inbound
//!     → socket.rs (reuse-address listener / datagram socket)
//!     → tls.rs (optional server handshake)
//!     → transport.rs
//!
//! Every connection carries connection.rs identity and state:
//!     Idle → Resolving → Connecting → Handshaking → Running → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - The connection driver is written once against `Transport`
//! - TLS is optional per role and handled transparently

pub mod connection;
pub mod resolve;
pub mod socket;
pub mod tls;
pub mod transport;

pub use connection::{
    ConnectRequest, ConnectionGuard, ConnectionId, ConnectionState, ConnectionTracker, Direction,
    Identity, StateCell,
};
pub use resolve::{Resolver, SystemResolver};
pub use tls::Certificate;
pub use transport::Transport;
