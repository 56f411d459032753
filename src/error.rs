//! Error types shared by the event-loop pool and the connection managers.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for manager and pool operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Which side of a TLS session a certificate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateRole {
    Server,
    Client,
}

impl fmt::Display for CertificateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateRole::Server => write!(f, "server"),
            CertificateRole::Client => write!(f, "client"),
        }
    }
}

/// Failures surfaced by the public operations of the crate.
#[derive(Error, Debug)]
pub enum NetError {
    /// Invalid arguments or configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// `init` was called on something already running.
    #[error("already initialized")]
    AlreadyInitialized,

    /// The operation needs `init` to have succeeded first.
    #[error("not initialized")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A listening socket could not be opened, bound or registered.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve {host}:{service}: {source}")]
    Resolve {
        host: String,
        service: String,
        #[source]
        source: io::Error,
    },

    /// Every resolved candidate refused or timed out.
    #[error("connect to {host}:{service} failed after {attempts} attempt(s): {source}")]
    Connect {
        host: String,
        service: String,
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {message}")]
    Tls { message: String },

    #[error("{role} certificate error: {message}")]
    Certificate {
        role: CertificateRole,
        message: String,
    },

    /// No configured port could be bound.
    #[error("no listener could be started")]
    NoListener,
}

impl NetError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        NetError::Config {
            message: message.into(),
        }
    }

    /// Create a TLS error
    pub fn tls(message: impl Into<String>) -> Self {
        NetError::Tls {
            message: message.into(),
        }
    }

    /// Create a certificate error
    pub fn certificate(role: CertificateRole, message: impl Into<String>) -> Self {
        NetError::Certificate {
            role,
            message: message.into(),
        }
    }

    /// Numeric code reported through `on_error`.
    ///
    /// OS errors keep their raw code; everything else reports 1.
    pub fn code(&self) -> i32 {
        match self {
            NetError::Io(e)
            | NetError::Bind { source: e, .. }
            | NetError::Resolve { source: e, .. }
            | NetError::Connect { source: e, .. } => error_code(e),
            _ => 1,
        }
    }
}

/// Raw OS code of an I/O error, or 1 when the error did not come from the OS.
pub fn error_code(error: &io::Error) -> i32 {
    error.raw_os_error().unwrap_or(1)
}
