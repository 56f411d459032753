//! UDP connection manager.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use tokio::net::UdpSocket;

use crate::config::validation::{describe, validate_udp};
use crate::config::{PortPolicy, UdpManagerConfig};
use crate::error::{error_code, NetError, Result};
use crate::net::resolve::{self, bind_endpoint, Exhausted};
use crate::net::{socket, ConnectRequest, ConnectionState, ConnectionTracker, Identity, Resolver, SystemResolver};
use crate::observability::metrics;
use crate::runtime::{EventLoopPool, LoopSelector};
use crate::udp::acceptor::{AcceptorHandle, UdpAcceptor};
use crate::udp::connection::{UdpConnection, UdpDriver};
use crate::udp::service::UdpService;

struct Engine {
    service: Arc<dyn UdpService>,
    loops: LoopSelector,
    resolver: Arc<dyn Resolver>,
    max_datagram_size: usize,
    tracker: ConnectionTracker,
}

impl Engine {
    async fn run_connection(self: Arc<Self>, socket: UdpSocket, identity: Identity) {
        let (host_addr, peer_addr) = match (socket.local_addr(), socket.peer_addr()) {
            (Ok(host), Ok(peer)) => (host, peer),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "UDP socket lost before it was established");
                self.service.on_connect(None, identity);
                return;
            }
        };
        let (connection, commands) = UdpConnection::active(host_addr, peer_addr, identity);
        let guard = self.tracker.track(connection.id());
        UdpDriver::new(connection, Arc::clone(&self.service), self.max_datagram_size, guard)
            .run(socket, commands)
            .await;
    }

    async fn connect(self: Arc<Self>, request: ConnectRequest, bind: Option<SocketAddr>) {
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

        let connected = resolve::connect_candidates(&candidates, |addr| async move {
            tracing::trace!(peer_addr = %addr, state = ?ConnectionState::Connecting, "Connecting");
            let local = bind.unwrap_or_else(|| socket::unspecified_for(addr));
            let socket = UdpSocket::from_std(socket::udp_socket(local)?)?;
            socket.connect(addr).await?;
            Ok(socket)
        })
        .await;

        match connected {
            Ok((socket, _)) => self.run_connection(socket, request.identity).await,
            Err(exhausted) => self.connect_failed(&request, &exhausted),
        }
    }

    fn resolve_failed(&self, request: &ConnectRequest, code: i32, message: &str) {
        tracing::warn!(host = %request.host, service = %request.service, error = message, "Resolve failed");
        metrics::record_connect_failure(metrics::UDP, "resolve");
        self.service
            .on_error(None, "connection", "resolve", code, message);
        self.service.on_connect(None, request.identity);
    }

    fn connect_failed(&self, request: &ConnectRequest, exhausted: &Exhausted) {
        tracing::warn!(
            host = %request.host,
            attempts = exhausted.attempts,
            error = %exhausted.last_error,
            "UDP connect failed"
        );
        metrics::record_connect_failure(metrics::UDP, "connect");
        self.service.on_connect(None, request.identity);
    }
}

/// Owns the loop pool and the acceptors of a UDP service.
pub struct UdpManager {
    pool: EventLoopPool,
    engine: ArcSwapOption<Engine>,
    acceptors: Mutex<Vec<AcceptorHandle>>,
    resolver: Arc<dyn Resolver>,
    tracker: ConnectionTracker,
}

impl UdpManager {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            pool: EventLoopPool::new(),
            engine: ArcSwapOption::empty(),
            acceptors: Mutex::new(Vec::new()),
            resolver,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Start loops and bind an acceptor per configured port.
    ///
    /// On failure everything already started is stopped again.
    pub fn init(&self, service: Arc<dyn UdpService>, config: &UdpManagerConfig) -> Result<()> {
        if self.engine.load().is_some() {
            return Err(NetError::AlreadyInitialized);
        }
        validate_udp(config).map_err(|errors| NetError::config(describe(&errors)))?;
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
                    "UDP manager started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "UDP manager failed to start");
                self.exit();
                Err(e)
            }
        }
    }

    fn start(
        &self,
        service: Arc<dyn UdpService>,
        config: &UdpManagerConfig,
        bind_host: IpAddr,
    ) -> Result<()> {
        let loops = self.pool.selector().ok_or(NetError::NotInitialized)?;
        let engine = Arc::new(Engine {
            service: Arc::clone(&service),
            loops: loops.clone(),
            resolver: Arc::clone(&self.resolver),
            max_datagram_size: config.max_datagram_size,
            tracker: self.tracker.clone(),
        });

        for &port in &config.ports {
            let Some(event_loop) = loops.next() else {
                return Err(NetError::NotInitialized);
            };
            let addr = SocketAddr::new(bind_host, port);
            match UdpAcceptor::bind(
                addr,
                &event_loop,
                Arc::clone(&service),
                self.tracker.clone(),
                config.max_datagram_size,
            ) {
                Ok((acceptor, handle)) => {
                    self.lock_acceptors().push(handle);
                    event_loop.spawn(acceptor.run());
                    if config.port_policy == PortPolicy::Any {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(address = %addr, error = %e, "UDP bind failed");
                    service.on_error(None, "acceptor", "bind", e.code(), &e.to_string());
                    if config.port_policy == PortPolicy::All {
                        return Err(e);
                    }
                }
            }
        }
        if !config.ports.is_empty() && self.lock_acceptors().is_empty() {
            return Err(NetError::NoListener);
        }

        self.engine.store(Some(engine));
        Ok(())
    }

    /// Stop every acceptor, peer and active connection. Safe to call repeatedly.
    pub fn exit(&self) {
        let engine = self.engine.swap(None);
        for acceptor in self.lock_acceptors().drain(..) {
            acceptor.stop();
        }
        self.pool.exit();
        if engine.is_some() {
            tracing::info!("UDP manager stopped");
        }
    }

    /// Join the loop threads when `blocking` is true.
    pub fn run(&self, blocking: bool) {
        self.pool.run(blocking);
    }

    /// Open a connected UDP socket; the result arrives through `on_connect`.
    pub fn create_connection(&self, request: ConnectRequest) -> Result<()> {
        let engine = self.engine.load_full().ok_or(NetError::NotInitialized)?;
        let bind = bind_endpoint(&request.bind_ip, request.bind_port)?;
        let event_loop = engine.loops.next().ok_or(NetError::NotInitialized)?;

        if !request.sync {
            event_loop.spawn(engine.connect(request, bind));
            return Ok(());
        }

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

        let connected = resolve::connect_candidates_blocking(&candidates, |addr| {
            let local = bind.unwrap_or_else(|| socket::unspecified_for(addr));
            let std_socket = socket::udp_socket(local)?;
            std_socket.connect(addr)?;
            Ok(std_socket)
        });

        match connected {
            Ok((std_socket, _)) => {
                let identity = request.identity;
                event_loop.spawn(async move {
                    match UdpSocket::from_std(std_socket) {
                        Ok(socket) => engine.run_connection(socket, identity).await,
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
                    source: std::io::Error::new(
                        exhausted.last_error.kind(),
                        exhausted.last_error.to_string(),
                    ),
                };
                let reporter = Arc::clone(&engine);
                event_loop.post(move || reporter.connect_failed(&request, &exhausted));
                Err(error)
            }
        }
    }

    /// Ports actually bound, in bind order.
    pub fn get_ports(&self) -> Vec<u16> {
        self.lock_acceptors().iter().map(AcceptorHandle::port).collect()
    }

    pub fn is_running(&self) -> bool {
        self.engine.load().is_some()
    }

    /// Live connections: passive peers plus active sockets.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    pub fn thread_count(&self) -> usize {
        self.pool.size()
    }

    fn lock_acceptors(&self) -> std::sync::MutexGuard<'_, Vec<AcceptorHandle>> {
        self.acceptors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for UdpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpManager {
    fn drop(&mut self) {
        self.exit();
    }
}
