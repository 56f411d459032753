//! netloom-proxy: TCP (optionally TLS) forwarding proxy.
//!
//! ```text
//!  client ──▶ listener (passive) ──┐            ┌──▶ target (active)
//!                                  │ pair table │
//!  client ◀── passive connection ◀─┘            └─── active connection ◀── target
//! ```
//!
//! Every accepted connection gets an outbound connection to the target. The
//! pair id travels as the identity token of the outbound connect. Bytes read
//! before the outbound side is up are held, up to a byte limit, and flushed
//! on connect. A client whose target is not up within the connect timeout is
//! closed. Closing either side closes the other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;

use netloom::config::{load_config, NetloomConfig};
use netloom::lifecycle::{spawn_signal_handler, Shutdown};
use netloom::observability::{logging::init_logging, metrics::init_metrics};
use netloom::{ConnectRequest, ConnectionId, Identity, TcpConnection, TcpContext, TcpManager, TcpService};

#[derive(Parser, Debug)]
#[command(name = "netloom-proxy")]
#[command(about = "Forward TCP connections to a target host", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to accept client connections on
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    #[arg(long)]
    target_host: Option<String>,

    #[arg(long)]
    target_port: Option<u16>,

    /// Event-loop threads
    #[arg(short, long)]
    threads: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,

    /// Prometheus scrape address, e.g. 127.0.0.1:9000
    #[arg(long)]
    metrics_address: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut NetloomConfig) {
        if let Some(port) = self.listen_port {
            config.tcp.ports = vec![port];
        }
        if let Some(host) = &self.target_host {
            config.proxy.target_host = host.clone();
        }
        if let Some(port) = self.target_port {
            config.proxy.target_port = port;
        }
        if let Some(threads) = self.threads {
            config.tcp.thread_count = threads;
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if let Some(addr) = &self.metrics_address {
            config.observability.metrics_address = Some(addr.clone());
        }
    }
}

#[derive(Default)]
struct Pair {
    src: Option<TcpConnection>,
    dst: Option<TcpConnection>,
    /// Client bytes read before the target connection came up.
    pending: Vec<Bytes>,
    pending_bytes: usize,
}

impl Pair {
    /// Hold `chunk` until the target is up. False once `limit` is exceeded.
    fn hold(&mut self, chunk: Bytes, limit: usize) -> bool {
        self.pending_bytes += chunk.len();
        if self.pending_bytes > limit {
            self.pending.clear();
            return false;
        }
        self.pending.push(chunk);
        true
    }

    fn take_pending(&mut self) -> Vec<Bytes> {
        self.pending_bytes = 0;
        std::mem::take(&mut self.pending)
    }
}

#[derive(Default)]
struct PairTable {
    pairs: HashMap<u64, Pair>,
    by_connection: HashMap<ConnectionId, u64>,
}

impl PairTable {
    /// Client of a pair whose target never came up.
    fn stalled_source(&self, pair_id: u64) -> Option<TcpConnection> {
        self.pairs
            .get(&pair_id)
            .filter(|pair| pair.dst.is_none())
            .and_then(|pair| pair.src.clone())
    }
}

type SharedTable = Arc<Mutex<PairTable>>;

fn lock(table: &Mutex<PairTable>) -> MutexGuard<'_, PairTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Proxy {
    manager: OnceLock<Weak<TcpManager>>,
    target_host: String,
    target_port: u16,
    max_pending_bytes: usize,
    /// How long a client waits for its target connection.
    connect_deadline: Option<Duration>,
    next_pair: AtomicU64,
    table: SharedTable,
}

impl Proxy {
    fn new(config: &NetloomConfig) -> Self {
        Self {
            manager: OnceLock::new(),
            target_host: config.proxy.target_host.clone(),
            target_port: config.proxy.target_port,
            max_pending_bytes: config.proxy.max_pending_bytes,
            // Resolve, every connect attempt and the handshake share one budget.
            connect_deadline: config.tcp.connect_timeout().map(|timeout| timeout * 3),
            next_pair: AtomicU64::new(1),
            table: SharedTable::default(),
        }
    }

    fn table(&self) -> MutexGuard<'_, PairTable> {
        lock(&self.table)
    }

    /// Close the client if its target is still not up after the deadline.
    fn watch_connect(&self, pair_id: u64) {
        let Some(deadline) = self.connect_deadline else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let table = Arc::downgrade(&self.table);
        runtime.spawn(async move {
            tokio::time::sleep(deadline).await;
            let Some(table) = table.upgrade() else {
                return;
            };
            let stalled = lock(&table).stalled_source(pair_id);
            if let Some(src) = stalled {
                tracing::warn!(pair_id, "Target not connected in time, closing client");
                src.close();
            }
        });
    }

    fn manager(&self) -> Option<Arc<TcpManager>> {
        self.manager.get().and_then(Weak::upgrade)
    }
}

impl TcpService for Proxy {
    fn on_accept(&self, connection: &TcpConnection, _listen_port: u16) -> bool {
        let Some(manager) = self.manager() else {
            return false;
        };
        let pair_id = self.next_pair.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.table();
            table.pairs.insert(
                pair_id,
                Pair {
                    src: Some(connection.clone()),
                    ..Pair::default()
                },
            );
            table.by_connection.insert(connection.id(), pair_id);
        }

        let request = ConnectRequest::new(self.target_host.clone(), self.target_port).identity(pair_id);
        if let Err(e) = manager.create_connection(request) {
            tracing::warn!(pair_id, error = %e, "Could not start target connection");
            return false;
        }
        self.watch_connect(pair_id);
        tracing::debug!(
            pair_id,
            client = %connection.peer_address(),
            proxy = %connection.host_address(),
            "Pair accepted"
        );
        true
    }

    fn on_connect(&self, connection: Option<&TcpConnection>, identity: Identity) -> bool {
        let pair_id = identity.0;
        let Some(connection) = connection else {
            let src = self.table().pairs.get(&pair_id).and_then(|pair| pair.src.clone());
            if let Some(src) = src {
                tracing::warn!(pair_id, "Target unreachable, closing client");
                src.close();
            }
            return false;
        };

        let pending = {
            let mut guard = self.table();
            let table = &mut *guard;
            let Some(pair) = table.pairs.get_mut(&pair_id) else {
                // Client went away while the target connect was in flight.
                return false;
            };
            pair.dst = Some(connection.clone());
            table.by_connection.insert(connection.id(), pair_id);
            pair.take_pending()
        };

        tracing::debug!(pair_id, target = %connection.peer_address(), "Pair connected");
        pending.into_iter().all(|chunk| connection.send_bytes(chunk))
    }

    fn on_recv(&self, context: &mut TcpContext<'_>) -> bool {
        let size = context.recv_buffer_size();
        let Some(chunk) = context.recv_buffer_take(size) else {
            return false;
        };

        let peer = {
            let mut guard = self.table();
            let table = &mut *guard;
            let Some(pair) = table
                .by_connection
                .get(&context.id())
                .and_then(|pair_id| table.pairs.get_mut(pair_id))
            else {
                return false;
            };
            let is_src = pair.src.as_ref().is_some_and(|src| src.id() == context.id());
            let peer = if is_src { pair.dst.clone() } else { pair.src.clone() };
            if peer.is_none() && is_src {
                if pair.hold(chunk, self.max_pending_bytes) {
                    return true;
                }
                tracing::warn!(limit = self.max_pending_bytes, "Client sent too much before the target was up");
                return false;
            }
            peer
        };

        match peer {
            Some(peer) => peer.send_bytes(chunk),
            None => false,
        }
    }

    fn on_close(&self, connection: &TcpConnection) {
        let other = {
            let mut table = self.table();
            let Some(pair_id) = table.by_connection.remove(&connection.id()) else {
                return;
            };
            let Some(pair) = table.pairs.get_mut(&pair_id) else {
                return;
            };
            if pair.src.as_ref().is_some_and(|src| src == connection) {
                pair.src = None;
            } else if pair.dst.as_ref().is_some_and(|dst| dst == connection) {
                pair.dst = None;
            }
            let other = pair.src.clone().or_else(|| pair.dst.clone());
            if other.is_none() {
                table.pairs.remove(&pair_id);
                tracing::debug!(pair_id, "Pair released");
            } else {
                tracing::debug!(pair_id, "Pair disconnected");
            }
            other
        };
        if let Some(other) = other {
            other.close();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => NetloomConfig::default(),
    };
    args.apply(&mut config);
    config.tcp.close_linger_secs = config.proxy.close_linger_secs;

    init_logging(&config.observability.log_level)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "netloom-proxy starting");

    if let Some(addr) = &config.observability.metrics_address {
        let addr: SocketAddr = addr.parse()?;
        init_metrics(addr)?;
    }

    if config.tcp.ports.is_empty() {
        return Err("no listen port configured (use --listen-port or tcp.ports)".into());
    }

    let proxy = Arc::new(Proxy::new(&config));
    let manager = Arc::new(TcpManager::new());
    let _ = proxy.manager.set(Arc::downgrade(&manager));
    manager.init(proxy, &config.tcp)?;

    tracing::info!(
        ports = ?manager.get_ports(),
        target_host = %config.proxy.target_host,
        target_port = config.proxy.target_port,
        "Proxy listening"
    );

    let shutdown = Shutdown::new();
    let mut stop = shutdown.subscribe();
    spawn_signal_handler(shutdown.clone());
    let _ = stop.recv().await;

    manager.exit();
    let joiner = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || joiner.run(true)).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_bytes_are_bounded() {
        let mut pair = Pair::default();
        assert!(pair.hold(Bytes::from_static(b"abcd"), 8));
        assert!(pair.hold(Bytes::from_static(b"efgh"), 8));
        assert!(!pair.hold(Bytes::from_static(b"i"), 8));
        assert!(pair.pending.is_empty());
    }

    #[test]
    fn taking_pending_resets_the_count() {
        let mut pair = Pair::default();
        assert!(pair.hold(Bytes::from_static(b"abcd"), 4));
        assert_eq!(pair.take_pending(), vec![Bytes::from_static(b"abcd")]);
        assert!(pair.hold(Bytes::from_static(b"efgh"), 4));
    }

    #[test]
    fn proxy_linger_replaces_the_manager_default() {
        let config = NetloomConfig::default();
        assert_eq!(config.tcp.close_linger_secs, 0);
        assert!(config.proxy.close_linger_secs > 0);
        let proxy = Proxy::new(&config);
        assert_eq!(proxy.connect_deadline, Some(Duration::from_secs(30)));
    }
}
