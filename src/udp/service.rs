//! Callbacks a UDP application implements.

use crate::net::Identity;
use crate::udp::connection::{UdpConnection, UdpContext};

/// Application side of a [`UdpManager`](crate::udp::UdpManager).
///
/// Passive peers of one acceptor share that acceptor's loop, so their
/// callbacks are serialized with each other. Returning `false` from a `bool`
/// callback closes the connection.
pub trait UdpService: Send + Sync + 'static {
    /// Result of `create_connection`. `None` means every candidate failed.
    fn on_connect(&self, connection: Option<&UdpConnection>, identity: Identity) -> bool {
        let _ = (connection, identity);
        true
    }

    /// First datagram from a new remote endpoint on `listen_port`.
    fn on_accept(&self, connection: &UdpConnection, listen_port: u16) -> bool {
        let _ = (connection, listen_port);
        true
    }

    /// A datagram was queued for this connection.
    fn on_recv(&self, context: &mut UdpContext<'_>) -> bool;

    /// Every datagram queued for this connection has been sent.
    fn on_send(&self, connection: &UdpConnection) -> bool {
        let _ = connection;
        true
    }

    /// Fired exactly once per connection.
    fn on_close(&self, connection: &UdpConnection) {
        let _ = connection;
    }

    /// Bind, receive and resolve failures not tied to an established connection.
    fn on_error(
        &self,
        connection: Option<&UdpConnection>,
        operation: &str,
        action: &str,
        code: i32,
        message: &str,
    ) {
        tracing::warn!(
            connection_id = ?connection.map(UdpConnection::id),
            operation,
            action,
            code,
            message,
            "Network error"
        );
    }
}
