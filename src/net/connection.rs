//! Connection identity, state and lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Carry the caller's identity token through outbound connects
//! - Describe where a connection is in its lifecycle
//! - Count live connections per manager

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Caller-owned token handed back verbatim in `on_connect`.
///
/// The core never interprets the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Identity(pub u64);

impl From<u64> for Identity {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a connection was accepted or originated locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Produced by an accept or by a new datagram peer.
    Passive,
    /// Produced by `create_connection`.
    Active,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Passive => "passive",
            Direction::Active => "active",
        }
    }
}

/// Connection lifecycle.
///
/// Passive connections start at `Handshaking` or `Running`. Plain TCP and UDP
/// never enter `Handshaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Resolving = 1,
    Connecting = 2,
    Handshaking = 3,
    Running = 4,
    Closing = 5,
    Closed = 6,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Resolving,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Handshaking,
            4 => ConnectionState::Running,
            5 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// State shared between a connection handle and its driver.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Parameters of an outbound connect.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    /// Numeric port or well-known service name.
    pub service: String,
    /// Resolve and connect on the calling thread.
    pub sync: bool,
    pub identity: Identity,
    pub bind_ip: String,
    pub bind_port: u16,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_service(host, port.to_string())
    }

    pub fn with_service(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
            sync: false,
            identity: Identity::default(),
            bind_ip: String::new(),
            bind_port: 0,
        }
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn identity(mut self, identity: impl Into<Identity>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Bind the local end before connecting.
    pub fn bind(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.bind_ip = ip.into();
        self.bind_port = port;
        self
    }
}

/// Counts live connections owned by one manager.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new live connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current live connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the live count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.clone().track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn state_cell_round_trips_every_state() {
        let cell = StateCell::new(ConnectionState::Idle);
        for state in [
            ConnectionState::Resolving,
            ConnectionState::Connecting,
            ConnectionState::Handshaking,
            ConnectionState::Running,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn connect_request_builder() {
        let request = ConnectRequest::with_service("example.com", "https")
            .sync(true)
            .identity(7)
            .bind("127.0.0.1", 4000);
        assert_eq!(request.service, "https");
        assert!(request.sync);
        assert_eq!(request.identity, Identity(7));
        assert_eq!(request.bind_port, 4000);

        let request = ConnectRequest::new("localhost", 80);
        assert_eq!(request.service, "80");
        assert!(!request.sync);
        assert!(request.bind_ip.is_empty());
    }
}
