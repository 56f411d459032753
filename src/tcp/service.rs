//! Callbacks a TCP application implements.

use crate::net::Identity;
use crate::tcp::connection::{TcpConnection, TcpContext};

/// Application side of a [`TcpManager`](crate::tcp::TcpManager).
///
/// Every callback for one connection runs on that connection's loop thread,
/// never concurrently with another callback for the same connection.
/// Returning `false` from a `bool` callback closes the connection.
pub trait TcpService: Send + Sync + 'static {
    /// Result of `create_connection`. `None` means every candidate failed.
    fn on_connect(&self, connection: Option<&TcpConnection>, identity: Identity) -> bool {
        let _ = (connection, identity);
        true
    }

    /// A connection was accepted on `listen_port`.
    fn on_accept(&self, connection: &TcpConnection, listen_port: u16) -> bool {
        let _ = (connection, listen_port);
        true
    }

    /// At least watermark bytes are buffered.
    fn on_recv(&self, context: &mut TcpContext<'_>) -> bool;

    /// The send queue drained to empty.
    fn on_send(&self, connection: &TcpConnection) -> bool {
        let _ = connection;
        true
    }

    /// Fired exactly once per connection.
    fn on_close(&self, connection: &TcpConnection) {
        let _ = connection;
    }

    /// Listener, resolve and certificate failures not tied to an established connection.
    fn on_error(
        &self,
        connection: Option<&TcpConnection>,
        operation: &str,
        action: &str,
        code: i32,
        message: &str,
    ) {
        tracing::warn!(
            connection_id = ?connection.map(TcpConnection::id),
            operation,
            action,
            code,
            message,
            "Network error"
        );
    }
}
