//! Name resolution and candidate-by-candidate connect.
//!
//! # Responsibilities
//! - Turn (host, service) into an ordered list of candidate addresses
//! - Try candidates in order until one connects
//! - Interpret the optional local bind endpoint of a connect request

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::error::{NetError, Result};

/// Resolves a host and service into candidate addresses, in preference order.
///
/// Resolution may block; async callers run it on the blocking pool.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, host: &str, service: &str) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, service: &str) -> io::Result<Vec<SocketAddr>> {
        let port = service_port(service).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown service '{service}'"),
            )
        })?;
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for '{host}'"),
            ));
        }
        Ok(addrs)
    }
}

/// Port for a numeric service string or a well-known service name.
pub fn service_port(service: &str) -> Option<u16> {
    if let Ok(port) = service.parse::<u16>() {
        return Some(port);
    }
    let port = match service.to_ascii_lowercase().as_str() {
        "ftp" => 21,
        "ssh" => 22,
        "telnet" => 23,
        "smtp" => 25,
        "domain" => 53,
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    Some(port)
}

/// Resolve on the blocking pool of the current runtime.
pub async fn resolve_async(
    resolver: Arc<dyn Resolver>,
    host: String,
    service: String,
) -> io::Result<Vec<SocketAddr>> {
    tokio::task::spawn_blocking(move || resolver.resolve(&host, &service))
        .await
        .map_err(io::Error::other)?
}

/// Local endpoint to bind before connecting.
///
/// An empty or unspecified IP together with port 0 means "no explicit bind".
pub fn bind_endpoint(ip: &str, port: u16) -> Result<Option<SocketAddr>> {
    let ip: IpAddr = if ip.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        ip.parse()
            .map_err(|_| NetError::config(format!("invalid bind address '{ip}'")))?
    };
    if ip.is_unspecified() && port == 0 {
        return Ok(None);
    }
    Ok(Some(SocketAddr::new(ip, port)))
}

/// Every candidate failed.
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: usize,
    pub last_error: io::Error,
}

impl Exhausted {
    fn empty() -> Self {
        Self {
            attempts: 0,
            last_error: io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses"),
        }
    }
}

/// Try `attempt` against each candidate in order; the first success wins.
pub async fn connect_candidates<T, F, Fut>(
    candidates: &[SocketAddr],
    mut attempt: F,
) -> std::result::Result<(T, SocketAddr), Exhausted>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut exhausted = Exhausted::empty();
    for &addr in candidates {
        exhausted.attempts += 1;
        match attempt(addr).await {
            Ok(value) => return Ok((value, addr)),
            Err(e) => {
                tracing::debug!(
                    peer_addr = %addr,
                    attempt = exhausted.attempts,
                    remaining = candidates.len() - exhausted.attempts,
                    error = %e,
                    "Connect attempt failed"
                );
                exhausted.last_error = e;
            }
        }
    }
    Err(exhausted)
}

/// Blocking counterpart of [`connect_candidates`] for the synchronous connect path.
pub fn connect_candidates_blocking<T, F>(
    candidates: &[SocketAddr],
    mut attempt: F,
) -> std::result::Result<(T, SocketAddr), Exhausted>
where
    F: FnMut(SocketAddr) -> io::Result<T>,
{
    let mut exhausted = Exhausted::empty();
    for &addr in candidates {
        exhausted.attempts += 1;
        match attempt(addr) {
            Ok(value) => return Ok((value, addr)),
            Err(e) => {
                tracing::debug!(peer_addr = %addr, attempt = exhausted.attempts, error = %e, "Connect attempt failed");
                exhausted.last_error = e;
            }
        }
    }
    Err(exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn candidates(ports: &[u16]) -> Vec<SocketAddr> {
        ports
            .iter()
            .map(|&p| SocketAddr::from(([127, 0, 0, 1], p)))
            .collect()
    }

    #[test]
    fn numeric_and_named_services() {
        assert_eq!(service_port("8080"), Some(8080));
        assert_eq!(service_port("https"), Some(443));
        assert_eq!(service_port("HTTP"), Some(80));
        assert_eq!(service_port("gopher"), None);
        assert_eq!(service_port("70000"), None);
    }

    #[test]
    fn system_resolver_handles_literals() {
        let addrs = SystemResolver.resolve("127.0.0.1", "http").unwrap();
        assert_eq!(addrs, vec![SocketAddr::from(([127, 0, 0, 1], 80))]);
        assert!(SystemResolver.resolve("127.0.0.1", "nope").is_err());
    }

    #[test]
    fn bind_endpoint_rules() {
        assert_eq!(bind_endpoint("", 0).unwrap(), None);
        assert_eq!(bind_endpoint("0.0.0.0", 0).unwrap(), None);
        assert_eq!(
            bind_endpoint("0.0.0.0", 5000).unwrap(),
            Some(SocketAddr::from(([0, 0, 0, 0], 5000)))
        );
        assert_eq!(
            bind_endpoint("127.0.0.1", 0).unwrap(),
            Some(SocketAddr::from(([127, 0, 0, 1], 0)))
        );
        assert!(bind_endpoint("not-an-ip", 0).is_err());
    }

    #[test]
    fn blocking_retry_stops_at_first_success() {
        let tried = RefCell::new(Vec::new());
        let list = candidates(&[1, 2, 3]);
        let (value, addr) = connect_candidates_blocking(&list, |addr| {
            tried.borrow_mut().push(addr.port());
            if addr.port() == 2 {
                Ok("connected")
            } else {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        })
        .unwrap();
        assert_eq!(value, "connected");
        assert_eq!(addr.port(), 2);
        assert_eq!(*tried.borrow(), vec![1, 2]);
    }

    #[test]
    fn blocking_retry_reports_every_attempt() {
        let list = candidates(&[1, 2, 3]);
        let err = connect_candidates_blocking::<(), _>(&list, |_| {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        })
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error.kind(), io::ErrorKind::ConnectionRefused);

        let err = connect_candidates_blocking::<(), _>(&[], |_| Ok(())).unwrap_err();
        assert_eq!(err.attempts, 0);
    }

    #[tokio::test]
    async fn async_retry_walks_candidates_in_order() {
        let list = candidates(&[10, 20, 30]);
        let mut seen = Vec::new();
        let err = connect_candidates::<(), _, _>(&list, |addr| {
            seen.push(addr.port());
            async { Err(io::Error::from(io::ErrorKind::TimedOut)) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(seen, vec![10, 20, 30]);
    }
}
