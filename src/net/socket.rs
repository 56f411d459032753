//! Socket construction with explicit options.
//!
//! Listeners and datagram sockets are opened through socket2 so
//! reuse-address is set before bind, then handed to tokio as std sockets.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

const LISTEN_BACKLOG: i32 = 1024;

/// Non-blocking TCP listener with reuse-address set.
pub fn tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Non-blocking UDP socket with reuse-address set.
pub fn udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Blocking connect on the calling thread, optionally binding the local end first.
///
/// The returned stream is switched to non-blocking mode, ready for a loop.
pub fn connect_blocking(
    target: SocketAddr,
    bind: Option<SocketAddr>,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(local) = bind {
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
    }
    let target = SockAddr::from(target);
    match timeout {
        Some(timeout) => socket.connect_timeout(&target, timeout)?,
        None => socket.connect(&target)?,
    }
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Unconnected tokio TCP socket for the async connect path.
pub fn tcp_socket(target: SocketAddr, bind: Option<SocketAddr>) -> io::Result<tokio::net::TcpSocket> {
    let socket = if target.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    if let Some(local) = bind {
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;
    }
    Ok(socket)
}

/// Run `operation` under an optional deadline; expiry reports `TimedOut`.
pub async fn with_timeout<T, F>(limit: Option<Duration>, operation: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?,
        None => operation.await,
    }
}

/// Wildcard address of the same family as `target`.
pub fn unspecified_for(target: SocketAddr) -> SocketAddr {
    if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_reports_ephemeral_port() {
        let listener = tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn occupied_port_fails_to_bind() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();
        assert!(tcp_listener(addr).is_err());

        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(udp_socket(holder.local_addr().unwrap()).is_err());
    }

    #[test]
    fn blocking_connect_reaches_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        let stream = connect_blocking(target, None, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), target);
    }

    #[tokio::test]
    async fn timeout_reports_timed_out() {
        let pending = std::future::pending::<io::Result<()>>();
        let err = with_timeout(Some(Duration::from_millis(10)), pending)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(with_timeout(None, async { Ok(3) }).await.unwrap(), 3);
    }

    #[test]
    fn unspecified_keeps_family() {
        assert!(unspecified_for("127.0.0.1:1".parse().unwrap()).is_ipv4());
        assert!(unspecified_for("[::1]:1".parse().unwrap()).is_ipv6());
    }
}
