//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Every field has a default so a minimal file only names what it changes.

use serde::{Deserialize, Serialize};

use crate::net::tls::Certificate;

/// Root configuration file.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NetloomConfig {
    /// TCP manager settings.
    pub tcp: TcpManagerConfig,

    /// UDP manager settings.
    pub udp: UdpManagerConfig,

    /// Forwarding target for `netloom-proxy`.
    pub proxy: ProxyConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// What to do when several ports are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortPolicy {
    /// Every port must bind; one failure aborts `init`.
    #[default]
    All,
    /// Try ports in order and keep the first that binds.
    Any,
}

/// TCP connection manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpManagerConfig {
    /// Number of event-loop threads.
    pub thread_count: usize,

    /// Address listeners bind to.
    pub bind_host: String,

    /// Listening ports. `0` asks the OS for an ephemeral port.
    pub ports: Vec<u16>,

    pub port_policy: PortPolicy,

    /// Bytes requested by every read.
    pub recv_chunk_size: usize,

    /// Per-candidate connect and per-handshake timeout. `0` disables.
    pub connect_timeout_secs: u64,

    /// Maximum concurrent accepted connections. Accepting waits at the limit.
    pub max_connections: usize,

    /// How long `close()` keeps flushing queued data. `0` closes at once and
    /// drops whatever is still queued.
    pub close_linger_secs: u64,

    /// Enables TLS on accepted connections. A `ca` also requires and
    /// verifies client certificates.
    pub server_certificate: Option<Certificate>,

    /// Enables TLS on outbound connections.
    pub client_certificate: Option<Certificate>,

    /// Fail `init` when a configured certificate cannot be loaded instead of
    /// running that role over plain TCP.
    pub require_tls: bool,
}

impl Default for TcpManagerConfig {
    fn default() -> Self {
        Self {
            thread_count: 5,
            bind_host: "0.0.0.0".to_string(),
            ports: Vec::new(),
            port_policy: PortPolicy::All,
            recv_chunk_size: 512,
            connect_timeout_secs: 10,
            max_connections: 10_000,
            close_linger_secs: 0,
            server_certificate: None,
            client_certificate: None,
            require_tls: false,
        }
    }
}

impl TcpManagerConfig {
    pub fn with_ports(ports: impl Into<Vec<u16>>) -> Self {
        Self {
            ports: ports.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Option<std::time::Duration> {
        (self.connect_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn close_linger(&self) -> Option<std::time::Duration> {
        (self.close_linger_secs > 0).then(|| std::time::Duration::from_secs(self.close_linger_secs))
    }
}

/// UDP connection manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpManagerConfig {
    /// Number of event-loop threads.
    pub thread_count: usize,

    /// Address acceptors bind to.
    pub bind_host: String,

    /// Listening ports. `0` asks the OS for an ephemeral port.
    pub ports: Vec<u16>,

    pub port_policy: PortPolicy,

    /// Receive buffer size; longer datagrams are truncated.
    pub max_datagram_size: usize,
}

impl Default for UdpManagerConfig {
    fn default() -> Self {
        Self {
            thread_count: 5,
            bind_host: "0.0.0.0".to_string(),
            ports: Vec::new(),
            port_policy: PortPolicy::All,
            max_datagram_size: 1500,
        }
    }
}

impl UdpManagerConfig {
    pub fn with_ports(ports: impl Into<Vec<u16>>) -> Self {
        Self {
            ports: ports.into(),
            ..Self::default()
        }
    }
}

/// Forwarding target of the proxy binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub target_host: String,
    pub target_port: u16,

    /// Client bytes held while the target connection is not up yet. The
    /// client is closed once this is exceeded.
    pub max_pending_bytes: usize,

    /// Close linger for forwarded connections, so data relayed just before
    /// one side closes still reaches the other. Replaces `tcp.close_linger_secs`.
    pub close_linger_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            target_host: "127.0.0.1".to_string(),
            target_port: 8080,
            max_pending_bytes: 1024 * 1024,
            close_linger_secs: 5,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level filter (overridden by `RUST_LOG`).
    pub log_level: String,

    /// Prometheus scrape address; metrics are disabled when unset.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: NetloomConfig = toml::from_str("").unwrap();
        assert_eq!(config.tcp.thread_count, 5);
        assert_eq!(config.tcp.recv_chunk_size, 512);
        assert_eq!(config.tcp.port_policy, PortPolicy::All);
        assert!(config.tcp.close_linger().is_none());
        assert!(!config.tcp.require_tls);
        assert_eq!(config.proxy.close_linger_secs, 5);
        assert_eq!(config.udp.max_datagram_size, 1500);
        assert!(config.observability.metrics_address.is_none());
    }

    #[test]
    fn parses_full_document() {
        let config: NetloomConfig = toml::from_str(
            r#"
            [tcp]
            thread_count = 2
            bind_host = "127.0.0.1"
            ports = [12345, 12346]
            port_policy = "any"
            connect_timeout_secs = 0
            close_linger_secs = 3
            max_connections = 2
            require_tls = true

            [tcp.server_certificate]
            cert = "server.pem"
            key = "server.key"

            [tcp.client_certificate]
            pass_file_not_buffer = false
            ca = "-----BEGIN CERTIFICATE-----"

            [udp]
            ports = [5000]
            max_datagram_size = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.tcp.ports, vec![12345, 12346]);
        assert_eq!(config.tcp.port_policy, PortPolicy::Any);
        assert!(config.tcp.connect_timeout().is_none());
        assert_eq!(config.tcp.close_linger(), Some(std::time::Duration::from_secs(3)));
        assert_eq!(config.tcp.max_connections, 2);
        assert!(config.tcp.require_tls);

        let server = config.tcp.server_certificate.unwrap();
        assert!(server.pass_file_not_buffer);
        assert_eq!(server.cert.as_deref(), Some("server.pem"));

        let client = config.tcp.client_certificate.unwrap();
        assert!(!client.pass_file_not_buffer);
        assert!(client.cert.is_none());

        assert_eq!(config.udp.thread_count, 5);
        assert_eq!(config.udp.max_datagram_size, 9000);
    }
}
