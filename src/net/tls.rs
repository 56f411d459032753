//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Describe certificate material for the server and client roles
//! - Load PEM chains and keys from files or in-memory buffers
//! - Build rustls server/client configs and the tokio acceptor/connector

use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{CertificateRole, NetError, Result};

/// TLS material for one role.
///
/// With `pass_file_not_buffer` the string fields are file paths; otherwise
/// they hold the PEM text itself.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Certificate {
    pub pass_file_not_buffer: bool,
    /// Certificate chain, leaf first.
    pub cert: Option<String>,
    /// Unencrypted private key (PKCS#8, PKCS#1 or SEC1).
    pub key: Option<String>,
    /// Diffie-Hellman parameters. Accepted, not used: rustls picks its own groups.
    pub dh: Option<String>,
    /// Key password. Accepted, not used: encrypted keys are rejected.
    pub password: Option<String>,
    /// Trust anchors for verifying the peer. On the server role this also
    /// makes a client certificate mandatory.
    pub ca: Option<String>,
}

impl Default for Certificate {
    fn default() -> Self {
        Self {
            pass_file_not_buffer: true,
            cert: None,
            key: None,
            dh: None,
            password: None,
            ca: None,
        }
    }
}

impl Certificate {
    /// Certificate from PEM files.
    pub fn from_files(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: Some(cert.into()),
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Client role that only verifies the server against `ca`.
    pub fn trust_only(ca: impl Into<String>, pass_file_not_buffer: bool) -> Self {
        Self {
            pass_file_not_buffer,
            ca: Some(ca.into()),
            ..Self::default()
        }
    }

    fn read_pem(&self, value: &str, role: CertificateRole, what: &str) -> Result<Vec<u8>> {
        if self.pass_file_not_buffer {
            fs::read(value).map_err(|e| {
                NetError::certificate(role, format!("failed to read {what} file '{value}': {e}"))
            })
        } else {
            Ok(value.as_bytes().to_vec())
        }
    }
}

fn parse_certs(pem: &[u8], role: CertificateRole, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| NetError::certificate(role, format!("invalid {what} PEM: {e}")))?;
    if certs.is_empty() {
        return Err(NetError::certificate(role, format!("no certificates found in {what}")));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8], role: CertificateRole) -> Result<PrivateKeyDer<'static>> {
    if pem
        .windows(b"ENCRYPTED PRIVATE KEY".len())
        .any(|w| w == b"ENCRYPTED PRIVATE KEY")
    {
        return Err(NetError::certificate(role, "encrypted private keys are not supported"));
    }
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| NetError::certificate(role, format!("invalid key PEM: {e}")))?
        .ok_or_else(|| NetError::certificate(role, "no private key found"))
}

fn load_chain(certificate: &Certificate, role: CertificateRole) -> Result<Vec<CertificateDer<'static>>> {
    let path = certificate
        .cert
        .as_deref()
        .ok_or_else(|| NetError::certificate(role, "certificate chain is required"))?;
    parse_certs(&certificate.read_pem(path, role, "certificate")?, role, "certificate")
}

fn load_key(certificate: &Certificate, role: CertificateRole) -> Result<PrivateKeyDer<'static>> {
    let path = certificate
        .key
        .as_deref()
        .ok_or_else(|| NetError::certificate(role, "private key is required"))?;
    parse_key(&certificate.read_pem(path, role, "key")?, role)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server-side config: presents `cert`/`key`. Client certificates are only
/// requested, and then required, when `ca` is set.
pub fn server_config(certificate: &Certificate) -> Result<Arc<ServerConfig>> {
    let role = CertificateRole::Server;
    let chain = load_chain(certificate, role)?;
    let key = load_key(certificate, role)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::tls(e.to_string()))?;
    let builder = match certificate.ca.as_deref() {
        None => builder.with_no_client_auth(),
        Some(ca) => {
            let anchors = parse_certs(&certificate.read_pem(ca, role, "ca")?, role, "ca")?;
            let verifier = WebPkiClientVerifier::builder_with_provider(
                Arc::new(trust_anchors(anchors, role)?),
                provider(),
            )
            .build()
            .map_err(|e| NetError::certificate(role, e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };
    let config = builder
        .with_single_cert(chain, key)
        .map_err(|e| NetError::certificate(role, e.to_string()))?;
    Ok(Arc::new(config))
}

fn trust_anchors(anchors: Vec<CertificateDer<'static>>, role: CertificateRole) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(anchors);
    if added == 0 {
        return Err(NetError::certificate(role, "no usable trust anchors"));
    }
    if ignored > 0 {
        tracing::warn!(ignored, %role, "Ignored unparsable trust anchors");
    }
    Ok(roots)
}

/// Client-side config: verifies the server against `ca`, or against the
/// client's own chain when no `ca` is given. Presents `cert`/`key` if both exist.
pub fn client_config(certificate: &Certificate) -> Result<Arc<ClientConfig>> {
    let role = CertificateRole::Client;
    let anchors = match certificate.ca.as_deref() {
        Some(ca) => parse_certs(&certificate.read_pem(ca, role, "ca")?, role, "ca")?,
        None => load_chain(certificate, role)?,
    };
    let roots = trust_anchors(anchors, role)?;

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::tls(e.to_string()))?
        .with_root_certificates(roots);

    let config = if certificate.cert.is_some() && certificate.key.is_some() {
        let chain = load_chain(certificate, role)?;
        let key = load_key(certificate, role)?;
        builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| NetError::certificate(role, e.to_string()))?
    } else {
        builder.with_no_client_auth()
    };
    Ok(Arc::new(config))
}

pub fn acceptor(certificate: &Certificate) -> Result<TlsAcceptor> {
    server_config(certificate).map(TlsAcceptor::from)
}

pub fn connector(certificate: &Certificate) -> Result<TlsConnector> {
    client_config(certificate).map(TlsConnector::from)
}

/// Name the client verifies the server certificate against.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| NetError::tls(format!("invalid server name '{host}': {e}")))
}
