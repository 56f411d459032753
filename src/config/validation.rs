//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thread counts, chunk and datagram sizes)
//! - Check certificate sections name the fields their role needs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function over the config value
//! - Runs before a manager starts any thread

use std::fmt;
use std::net::IpAddr;

use crate::config::schema::{NetloomConfig, TcpManagerConfig, UdpManagerConfig};
use crate::net::tls::Certificate;

/// Largest UDP payload over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Join errors into one human-readable line.
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn validate_config(config: &NetloomConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_tcp(&config.tcp, "tcp", &mut errors);
    check_udp(&config.udp, "udp", &mut errors);
    if config.proxy.target_host.is_empty() {
        errors.push(ValidationError::new("proxy.target_host", "must not be empty"));
    }
    if config.proxy.max_pending_bytes == 0 {
        errors.push(ValidationError::new("proxy.max_pending_bytes", "must be greater than zero"));
    }
    finish(errors)
}

pub fn validate_tcp(config: &TcpManagerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_tcp(config, "tcp", &mut errors);
    finish(errors)
}

pub fn validate_udp(config: &UdpManagerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_udp(config, "udp", &mut errors);
    finish(errors)
}

fn finish(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_common(
    thread_count: usize,
    bind_host: &str,
    prefix: &str,
    errors: &mut Vec<ValidationError>,
) {
    if thread_count == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.thread_count"),
            "must be greater than zero",
        ));
    }
    if bind_host.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            format!("{prefix}.bind_host"),
            format!("'{bind_host}' is not an IP address"),
        ));
    }
}

fn check_tcp(config: &TcpManagerConfig, prefix: &str, errors: &mut Vec<ValidationError>) {
    check_common(config.thread_count, &config.bind_host, prefix, errors);
    if config.recv_chunk_size == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.recv_chunk_size"),
            "must be greater than zero",
        ));
    }
    if config.max_connections == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.max_connections"),
            "must be greater than zero",
        ));
    }
    if let Some(server) = &config.server_certificate {
        let field = format!("{prefix}.server_certificate");
        if server.cert.is_none() {
            errors.push(ValidationError::new(&field, "cert is required"));
        }
        if server.key.is_none() {
            errors.push(ValidationError::new(&field, "key is required"));
        }
    }
    if let Some(client) = &config.client_certificate {
        check_client_certificate(client, &format!("{prefix}.client_certificate"), errors);
    }
}

fn check_client_certificate(client: &Certificate, field: &str, errors: &mut Vec<ValidationError>) {
    match (&client.cert, &client.key) {
        (Some(_), None) => errors.push(ValidationError::new(field, "cert given without key")),
        (None, Some(_)) => errors.push(ValidationError::new(field, "key given without cert")),
        (None, None) if client.ca.is_none() => {
            errors.push(ValidationError::new(field, "needs ca or cert and key"))
        }
        _ => {}
    }
}

fn check_udp(config: &UdpManagerConfig, prefix: &str, errors: &mut Vec<ValidationError>) {
    check_common(config.thread_count, &config.bind_host, prefix, errors);
    if config.max_datagram_size == 0 || config.max_datagram_size > MAX_UDP_PAYLOAD {
        errors.push(ValidationError::new(
            format!("{prefix}.max_datagram_size"),
            format!("must be between 1 and {MAX_UDP_PAYLOAD}"),
        ));
    }
}
