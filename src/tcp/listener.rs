//! TCP listener with backpressure.
//!
//! # Responsibilities
//! - Bind a configured port with reuse-address
//! - Accept incoming TCP connections on the listener's loop
//! - Enforce max_connections via semaphore
//! - Hand each accepted socket to the next loop in rotation
//! - Report accept errors through `on_error` and keep accepting

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsStream;

use crate::error::{error_code, NetError, Result};
use crate::net::{socket, ConnectionState, Identity, Transport};
use crate::runtime::EventLoop;
use crate::tcp::connection::Opened;
use crate::tcp::manager::Engine;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bounded TCP listener registered with one event loop.
pub(crate) struct Listener {
    inner: TcpListener,
    port: u16,
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Bind `addr` and register the socket with `event_loop`.
    pub(crate) fn bind(
        addr: SocketAddr,
        event_loop: &EventLoop,
        connection_limit: Arc<Semaphore>,
    ) -> Result<Self> {
        let std_listener =
            socket::tcp_listener(addr).map_err(|source| NetError::Bind { addr, source })?;
        let inner = {
            let _entered = event_loop.enter();
            TcpListener::from_std(std_listener).map_err(|source| NetError::Bind { addr, source })?
        };
        let local_addr = inner
            .local_addr()
            .map_err(|source| NetError::Bind { addr, source })?;

        tracing::info!(
            address = %local_addr,
            loop_index = event_loop.index(),
            max_connections = connection_limit.available_permits(),
            "Listener bound"
        );

        Ok(Self {
            inner,
            port: local_addr.port(),
            connection_limit,
        })
    }

    /// Port actually bound, resolved when the configured port was 0.
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Waits while the limit is reached. The permit must be held for the
    /// connection's lifetime.
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(io::Error::other)?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            port = self.port,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, permit))
    }

    /// Accept until the owning loop stops.
    pub(crate) async fn serve(self, engine: Arc<Engine>) {
        loop {
            match self.accept().await {
                Ok((stream, peer, permit)) => {
                    let Some(target) = engine.loops.next() else {
                        break;
                    };
                    dispatch(&engine, &target, stream, peer, self.port, permit);
                }
                Err(e) => {
                    tracing::warn!(port = self.port, error = %e, "Accept failed");
                    engine.service.on_error(
                        None,
                        "acceptor",
                        "accept",
                        error_code(&e),
                        &e.to_string(),
                    );
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Move an accepted socket onto `target` and start its connection there.
fn dispatch(
    engine: &Arc<Engine>,
    target: &EventLoop,
    stream: TcpStream,
    peer: SocketAddr,
    listen_port: u16,
    permit: OwnedSemaphorePermit,
) {
    let engine = Arc::clone(engine);
    if target.is_current() {
        target.spawn(open_passive(engine, stream, peer, listen_port, permit));
        return;
    }

    let std_stream = match stream.into_std() {
        Ok(std_stream) => std_stream,
        Err(e) => {
            tracing::warn!(peer_addr = %peer, error = %e, "Failed to detach accepted socket");
            return;
        }
    };
    target.spawn(async move {
        match TcpStream::from_std(std_stream) {
            Ok(stream) => open_passive(engine, stream, peer, listen_port, permit).await,
            Err(e) => tracing::warn!(peer_addr = %peer, error = %e, "Failed to register accepted socket"),
        }
    });
}

/// Server handshake if TLS is enabled, then run the connection.
async fn open_passive(
    engine: Arc<Engine>,
    stream: TcpStream,
    peer: SocketAddr,
    listen_port: u16,
    permit: OwnedSemaphorePermit,
) {
    let _ = stream.set_nodelay(true);
    let transport = match &engine.acceptor {
        None => Transport::Plain(stream),
        Some(acceptor) => {
            tracing::trace!(peer_addr = %peer, state = ?ConnectionState::Handshaking, "TLS accept");
            match socket::with_timeout(engine.connect_timeout, acceptor.accept(stream)).await {
                Ok(tls) => Transport::from(TlsStream::Server(tls)),
                Err(e) => {
                    engine.handshake_failed(&peer, error_code(&e), &e.to_string());
                    return;
                }
            }
        }
    };
    engine
        .run_connection(
            transport,
            Identity::default(),
            Opened::Accepted { listen_port },
            Some(permit),
        )
        .await;
}
