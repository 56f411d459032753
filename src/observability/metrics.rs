//! Metrics collection and exposition.
//!
//! # Metrics
//! - `netloom_connections_opened_total` (counter): by transport, direction
//! - `netloom_connections_closed_total` (counter): by transport
//! - `netloom_active_connections` (gauge): by transport
//! - `netloom_bytes_received_total` / `netloom_bytes_sent_total` (counter): by transport
//! - `netloom_connect_failures_total` (counter): by transport, stage
//! - `netloom_udp_peers` (gauge): peers tracked by UDP acceptors
//!
//! Nothing is recorded until a recorder is installed; the library never
//! installs one itself.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::net::Direction;

pub const TCP: &str = "tcp";
pub const TLS: &str = "tls";
pub const UDP: &str = "udp";

/// Install the Prometheus exporter with an HTTP scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_connection_opened(transport: &'static str, direction: Direction) {
    counter!(
        "netloom_connections_opened_total",
        "transport" => transport,
        "direction" => direction.as_str()
    )
    .increment(1);
    gauge!("netloom_active_connections", "transport" => transport).increment(1.0);
}

pub fn record_connection_closed(transport: &'static str) {
    counter!("netloom_connections_closed_total", "transport" => transport).increment(1);
    gauge!("netloom_active_connections", "transport" => transport).decrement(1.0);
}

pub fn record_bytes_received(transport: &'static str, bytes: usize) {
    counter!("netloom_bytes_received_total", "transport" => transport).increment(bytes as u64);
}

pub fn record_bytes_sent(transport: &'static str, bytes: usize) {
    counter!("netloom_bytes_sent_total", "transport" => transport).increment(bytes as u64);
}

/// `stage` is one of `resolve`, `connect` or `handshake`.
pub fn record_connect_failure(transport: &'static str, stage: &'static str) {
    counter!(
        "netloom_connect_failures_total",
        "transport" => transport,
        "stage" => stage
    )
    .increment(1);
}

pub fn record_udp_peers(delta: f64) {
    gauge!("netloom_udp_peers").increment(delta);
}
