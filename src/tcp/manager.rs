//! TCP connection manager.
//!
//! # Responsibilities
//! - Validate configuration and start the event-loop pool
//! - Load TLS material for the server and client roles independently
//! - Bind listeners under the configured port policy
//! - Originate outbound connections, synchronously or asynchronously
//! - Stop everything on `exit`, any number of times

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::config::validation::{describe, validate_tcp};
use crate::config::{PortPolicy, TcpManagerConfig};
use crate::error::{error_code, NetError, Result};
use crate::net::resolve::{self, bind_endpoint, Exhausted};
use crate::net::{
    socket, tls, ConnectRequest, ConnectionState, ConnectionTracker, Direction, Identity, Resolver,
    SystemResolver, Transport,
};
use crate::observability::metrics;
use crate::runtime::{EventLoopPool, LoopSelector};
use crate::tcp::connection::{Opened, TcpConnection, TcpDriver};
use crate::tcp::listener::Listener;
use crate::tcp::service::TcpService;

/// Everything a running manager shares with its listeners and connections.
pub(crate) struct Engine {
    pub(crate) service: Arc<dyn TcpService>,
    pub(crate) loops: LoopSelector,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) acceptor: Option<TlsAcceptor>,
    pub(crate) connector: Option<TlsConnector>,
    pub(crate) recv_chunk_size: usize,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) close_linger: Option<Duration>,
    pub(crate) tracker: ConnectionTracker,
}

impl Engine {
    /// Create the handle and drive the connection until it closes.
    pub(crate) async fn run_connection(
        self: Arc<Self>,
        transport: Transport,
        identity: Identity,
        opened: Opened,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let direction = match opened {
            Opened::Accepted { .. } => Direction::Passive,
            Opened::Connected => Direction::Active,
        };
        let (connection, commands) = match TcpConnection::new(direction, identity, &transport) {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(error = %e, "Connection lost before it was established");
                if let Opened::Connected = opened {
                    self.service.on_connect(None, identity);
                }
                return;
            }
        };
        let guard = self.tracker.track(connection.id());
        let driver = TcpDriver::new(
            connection,
            Arc::clone(&self.service),
            self.recv_chunk_size,
            self.close_linger,
            guard,
            permit,
        );
        driver.run(transport, commands, opened).await;
    }

    async fn connect(self: Arc<Self>, request: ConnectRequest, bind: Option<SocketAddr>) {
        tracing::trace!(host = %request.host, service = %request.service, state = ?ConnectionState::Resolving, "Resolving");
        let candidates = match resolve::resolve_async(
            Arc::clone(&self.resolver),
            request.host.clone(),
            request.service.clone(),
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                self.resolve_failed(&request, error_code(&e), &e.to_string());
                return;
            }
        };

        let timeout = self.connect_timeout;
        let connected = resolve::connect_candidates(&candidates, |addr| async move {
            tracing::trace!(peer_addr = %addr, state = ?ConnectionState::Connecting, "Connecting");
            let socket = socket::tcp_socket(addr, bind)?;
            socket::with_timeout(timeout, socket.connect(addr)).await
        })
        .await;

        match connected {
            Ok((stream, _)) => self.establish(stream, request).await,
            Err(exhausted) => self.connect_failed(&request, &exhausted),
        }
    }

    /// Client handshake if TLS is enabled, then run the connection.
    async fn establish(self: Arc<Self>, stream: TcpStream, request: ConnectRequest) {
        let _ = stream.set_nodelay(true);
        let transport = match &self.connector {
            None => Transport::Plain(stream),
            Some(connector) => {
                let name = match tls::server_name(&request.host) {
                    Ok(name) => name,
                    Err(e) => {
                        self.handshake_failed(&request.host, e.code(), &e.to_string());
                        return;
                    }
                };
                tracing::trace!(host = %request.host, state = ?ConnectionState::Handshaking, "TLS connect");
                match socket::with_timeout(self.connect_timeout, connector.connect(name, stream)).await {
                    Ok(tls) => Transport::from(TlsStream::Client(tls)),
                    Err(e) => {
                        self.handshake_failed(&request.host, error_code(&e), &e.to_string());
                        return;
                    }
                }
            }
        };
        self.run_connection(transport, request.identity, Opened::Connected, None)
            .await;
    }

    /// The connection is dropped; only `on_error` hears about it.
    pub(crate) fn handshake_failed(&self, peer: &dyn fmt::Display, code: i32, message: &str) {
        tracing::warn!(peer = %peer, error = message, "TLS handshake failed");
        metrics::record_connect_failure(metrics::TLS, "handshake");
        self.service
            .on_error(None, "connection", "handshake", code, message);
    }

    fn resolve_failed(&self, request: &ConnectRequest, code: i32, message: &str) {
        tracing::warn!(host = %request.host, service = %request.service, error = message, "Resolve failed");
        metrics::record_connect_failure(metrics::TCP, "resolve");
        self.service
            .on_error(None, "connection", "resolve", code, message);
        self.service.on_connect(None, request.identity);
    }

    fn connect_failed(&self, request: &ConnectRequest, exhausted: &Exhausted) {
        tracing::warn!(
            host = %request.host,
            service = %request.service,
            attempts = exhausted.attempts,
            error = %exhausted.last_error,
            "Connect failed"
        );
        metrics::record_connect_failure(metrics::TCP, "connect");
        self.service.on_connect(None, request.identity);
    }
}

/// Owns the loop pool, listeners and TLS material of a TCP service.
pub struct TcpManager {
    pool: EventLoopPool,
    engine: ArcSwapOption<Engine>,
    ports: Mutex<Vec<u16>>,
    resolver: Arc<dyn Resolver>,
    tracker: ConnectionTracker,
}

impl TcpManager {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    /// Manager whose outbound connects resolve through `resolver`.
    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            pool: EventLoopPool::new(),
            engine: ArcSwapOption::empty(),
            ports: Mutex::new(Vec::new()),
            resolver,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Start loops, load certificates and bind the configured ports.
    ///
    /// On failure everything already started is stopped again.
    pub fn init(&self, service: Arc<dyn TcpService>, config: &TcpManagerConfig) -> Result<()> {
        if self.engine.load().is_some() {
            return Err(NetError::AlreadyInitialized);
        }
        validate_tcp(config).map_err(|errors| NetError::config(describe(&errors)))?;
        let bind_host: IpAddr = config
            .bind_host
            .parse()
            .map_err(|_| NetError::config(format!("invalid bind host '{}'", config.bind_host)))?;

        self.pool.init(config.thread_count)?;
        match self.start(service, config, bind_host) {
            Ok(()) => {
                tracing::info!(
                    thread_count = config.thread_count,
                    ports = ?self.get_ports(),
                    tls_server = config.server_certificate.is_some(),
                    tls_client = config.client_certificate.is_some(),
                    "TCP manager started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "TCP manager failed to start");
                self.exit();
                Err(e)
            }
        }
    }

    fn start(
        &self,
        service: Arc<dyn TcpService>,
        config: &TcpManagerConfig,
        bind_host: IpAddr,
    ) -> Result<()> {
        let loops = self.pool.selector().ok_or(NetError::NotInitialized)?;

        let acceptor = match config.server_certificate.as_ref().map(tls::acceptor) {
            None => None,
            Some(Ok(acceptor)) => Some(acceptor),
            Some(Err(e)) => {
                service.on_error(None, "manager", "load server certificate", e.code(), &e.to_string());
                if config.require_tls {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Server certificate unusable, accepting plain TCP");
                None
            }
        };
        let connector = match config.client_certificate.as_ref().map(tls::connector) {
            None => None,
            Some(Ok(connector)) => Some(connector),
            Some(Err(e)) => {
                service.on_error(None, "manager", "load client certificate", e.code(), &e.to_string());
                if config.require_tls {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Client certificate unusable, connecting plain TCP");
                None
            }
        };

        let engine = Arc::new(Engine {
            service: Arc::clone(&service),
            loops: loops.clone(),
            resolver: Arc::clone(&self.resolver),
            acceptor,
            connector,
            recv_chunk_size: config.recv_chunk_size,
            connect_timeout: config.connect_timeout(),
            close_linger: config.close_linger(),
            tracker: self.tracker.clone(),
        });
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        for &port in &config.ports {
            let Some(event_loop) = loops.next() else {
                return Err(NetError::NotInitialized);
            };
            let addr = SocketAddr::new(bind_host, port);
            match Listener::bind(addr, &event_loop, Arc::clone(&connection_limit)) {
                Ok(listener) => {
                    self.lock_ports().push(listener.port());
                    event_loop.spawn(listener.serve(Arc::clone(&engine)));
                    if config.port_policy == PortPolicy::Any {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(address = %addr, error = %e, "Listener bind failed");
                    service.on_error(None, "acceptor", "bind", e.code(), &e.to_string());
                    if config.port_policy == PortPolicy::All {
                        return Err(e);
                    }
                }
            }
        }
        if !config.ports.is_empty() && self.lock_ports().is_empty() {
            return Err(NetError::NoListener);
        }

        self.engine.store(Some(engine));
        Ok(())
    }

    /// Stop every loop, listener and connection. Safe to call repeatedly.
    pub fn exit(&self) {
        let engine = self.engine.swap(None);
        self.pool.exit();
        self.lock_ports().clear();
        if engine.is_some() {
            tracing::info!("TCP manager stopped");
        }
    }

    /// Join the loop threads when `blocking` is true.
    pub fn run(&self, blocking: bool) {
        self.pool.run(blocking);
    }

    /// Open an outbound connection; the result arrives through `on_connect`.
    ///
    /// The synchronous variant resolves and connects on the calling thread and
    /// also reports a failed connect through its return value.
    pub fn create_connection(&self, request: ConnectRequest) -> Result<()> {
        let engine = self.engine.load_full().ok_or(NetError::NotInitialized)?;
        let bind = bind_endpoint(&request.bind_ip, request.bind_port)?;
        let event_loop = engine.loops.next().ok_or(NetError::NotInitialized)?;

        if !request.sync {
            event_loop.spawn(engine.connect(request, bind));
            return Ok(());
        }

        tracing::trace!(host = %request.host, service = %request.service, state = ?ConnectionState::Resolving, "Resolving");
        let candidates = match engine.resolver.resolve(&request.host, &request.service) {
            Ok(candidates) => candidates,
            Err(source) => {
                let (code, message) = (error_code(&source), source.to_string());
                let failed = request.clone();
                let reporter = Arc::clone(&engine);
                event_loop.post(move || reporter.resolve_failed(&failed, code, &message));
                return Err(NetError::Resolve {
                    host: request.host,
                    service: request.service,
                    source,
                });
            }
        };

        let timeout = engine.connect_timeout;
        let connected = resolve::connect_candidates_blocking(&candidates, |addr| {
            tracing::trace!(peer_addr = %addr, state = ?ConnectionState::Connecting, "Connecting");
            socket::connect_blocking(addr, bind, timeout)
        });

        match connected {
            Ok((std_stream, _)) => {
                event_loop.spawn(async move {
                    match TcpStream::from_std(std_stream) {
                        Ok(stream) => engine.establish(stream, request).await,
                        Err(e) => {
                            let exhausted = Exhausted { attempts: 1, last_error: e };
                            engine.connect_failed(&request, &exhausted);
                        }
                    }
                });
                Ok(())
            }
            Err(exhausted) => {
                let error = NetError::Connect {
                    host: request.host.clone(),
                    service: request.service.clone(),
                    attempts: exhausted.attempts,
                    source: io::Error::new(exhausted.last_error.kind(), exhausted.last_error.to_string()),
                };
                let reporter = Arc::clone(&engine);
                event_loop.post(move || reporter.connect_failed(&request, &exhausted));
                Err(error)
            }
        }
    }

    /// Ports actually bound, in bind order.
    pub fn get_ports(&self) -> Vec<u16> {
        self.lock_ports().clone()
    }

    pub fn is_running(&self) -> bool {
        self.engine.load().is_some()
    }

    /// Live connections, accepted and outbound.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Number of event-loop threads.
    pub fn thread_count(&self) -> usize {
        self.pool.size()
    }

    fn lock_ports(&self) -> std::sync::MutexGuard<'_, Vec<u16>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TcpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpManager {
    fn drop(&mut self) {
        self.exit();
    }
}
