//! Event-loop based TCP/TLS and UDP connection managers.
//!
//! A manager owns a pool of single-threaded event loops, binds listeners,
//! originates outbound connections and reports everything that happens to a
//! connection through a service trait ([`TcpService`] / [`UdpService`]).

pub mod buffer;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod runtime;
pub mod tcp;
pub mod udp;

pub use config::{NetloomConfig, PortPolicy, TcpManagerConfig, UdpManagerConfig};
pub use error::{NetError, Result};
pub use lifecycle::Shutdown;
pub use net::{Certificate, ConnectRequest, ConnectionId, ConnectionState, Identity};
pub use runtime::{EventLoop, EventLoopPool};
pub use tcp::{TcpConnection, TcpContext, TcpManager, TcpService};
pub use udp::{UdpConnection, UdpContext, UdpManager, UdpService};
