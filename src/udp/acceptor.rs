//! Datagram demultiplexing over one bound socket.
//!
//! # Responsibilities
//! - Own the bound socket; it is the only task that reads or writes it
//! - Map each remote endpoint to one passive connection
//! - Serialize outbound datagrams of every peer through one send queue
//! - Keep receiving no matter what one peer's callbacks return
//!
//! # Data Flow
//! ```text
//! recv_from(peer) → peer map lookup
//!     → new peer: on_accept(connection, port)
//!     → queue datagram → on_recv(context)
//!
//! connection.send_buffer_fill → AcceptorCommand::Send
//!     → SendQueue (peer, id, datagram) → send_to → on_send once the peer's
//!       queued datagrams are all out
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::buffer::{DatagramQueue, SendQueue};
use crate::error::{error_code, NetError, Result};
use crate::net::{socket, ConnectionGuard, ConnectionId, ConnectionState, ConnectionTracker, Direction};
use crate::observability::metrics;
use crate::runtime::EventLoop;
use crate::udp::connection::{UdpConnection, UdpContext};
use crate::udp::service::UdpService;

/// Requests posted to an acceptor by its peers and its manager.
#[derive(Debug)]
pub(crate) enum AcceptorCommand {
    Send {
        peer: SocketAddr,
        id: ConnectionId,
        data: Bytes,
    },
    Close {
        peer: SocketAddr,
        id: ConnectionId,
    },
    Stop,
}

/// Manager-side handle of a running acceptor.
#[derive(Debug, Clone)]
pub(crate) struct AcceptorHandle {
    port: u16,
    commands: mpsc::UnboundedSender<AcceptorCommand>,
}

impl AcceptorHandle {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn stop(&self) {
        let _ = self.commands.send(AcceptorCommand::Stop);
    }
}

struct Peer {
    connection: UdpConnection,
    recv: DatagramQueue,
    /// Datagrams queued for this peer and not yet sent.
    pending: usize,
    _guard: ConnectionGuard,
}

struct Outgoing {
    peer: SocketAddr,
    id: ConnectionId,
    data: Bytes,
}

enum Event {
    Command(Option<AcceptorCommand>),
    Received(io::Result<(usize, SocketAddr)>),
    Sent(io::Result<usize>),
}

pub(crate) struct UdpAcceptor {
    /// Taken on stop, before any peer is closed.
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    port: u16,
    service: Arc<dyn UdpService>,
    tracker: ConnectionTracker,
    commands_tx: mpsc::UnboundedSender<AcceptorCommand>,
    commands: mpsc::UnboundedReceiver<AcceptorCommand>,
    peers: HashMap<SocketAddr, Peer>,
    send: SendQueue<Outgoing>,
    buf: Vec<u8>,
    stopped: bool,
}

impl UdpAcceptor {
    /// Bind `addr` with reuse-address and register it with `event_loop`.
    pub(crate) fn bind(
        addr: SocketAddr,
        event_loop: &EventLoop,
        service: Arc<dyn UdpService>,
        tracker: ConnectionTracker,
        max_datagram_size: usize,
    ) -> Result<(Self, AcceptorHandle)> {
        let std_socket = socket::udp_socket(addr).map_err(|source| NetError::Bind { addr, source })?;
        let socket = {
            let _entered = event_loop.enter();
            UdpSocket::from_std(std_socket).map_err(|source| NetError::Bind { addr, source })?
        };
        let local_addr = socket
            .local_addr()
            .map_err(|source| NetError::Bind { addr, source })?;

        tracing::info!(address = %local_addr, loop_index = event_loop.index(), "UDP acceptor bound");

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let handle = AcceptorHandle {
            port: local_addr.port(),
            commands: commands_tx.clone(),
        };
        let acceptor = Self {
            socket: Some(socket),
            local_addr,
            port: local_addr.port(),
            service,
            tracker,
            commands_tx,
            commands,
            peers: HashMap::new(),
            send: SendQueue::new(),
            buf: vec![0; max_datagram_size],
            stopped: false,
        };
        Ok((acceptor, handle))
    }

    /// Receive and send until stopped or until the socket fails.
    pub(crate) async fn run(mut self) {
        loop {
            let Some(socket) = self.socket.as_ref() else {
                break;
            };
            let event = tokio::select! {
                biased;
                command = self.commands.recv() => Event::Command(command),
                result = socket.recv_from(&mut self.buf) => Event::Received(result),
                result = send_front(socket, self.send.front()), if !self.send.is_empty() => Event::Sent(result),
            };

            match event {
                Event::Command(Some(AcceptorCommand::Send { peer, id, data })) => {
                    self.queue(peer, id, data);
                }
                Event::Command(Some(AcceptorCommand::Close { peer, id })) => {
                    if self.peer_id(&peer) == Some(id) {
                        self.remove_peer(peer);
                    }
                }
                Event::Command(Some(AcceptorCommand::Stop)) | Event::Command(None) => break,
                Event::Received(Ok((n, from))) => {
                    let datagram = Bytes::copy_from_slice(&self.buf[..n]);
                    self.deliver(from, datagram);
                }
                Event::Received(Err(e)) => {
                    self.service.on_error(None, "acceptor", "recv", error_code(&e), &e.to_string());
                    match e.kind() {
                        // ICMP feedback for an earlier send; the socket is still usable.
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => {
                            tracing::debug!(port = self.port, error = %e, "UDP receive reported peer error");
                        }
                        _ => {
                            tracing::error!(port = self.port, error = %e, "UDP receive failed");
                            break;
                        }
                    }
                }
                Event::Sent(result) => self.sent(result),
            }
        }
        self.stop();
    }

    fn peer_id(&self, peer: &SocketAddr) -> Option<ConnectionId> {
        self.peers.get(peer).map(|p| p.connection.id())
    }

    fn queue(&mut self, peer: SocketAddr, id: ConnectionId, data: Bytes) {
        match self.peers.get_mut(&peer) {
            Some(entry) if entry.connection.id() == id => {
                entry.pending += 1;
                self.send.push(Outgoing { peer, id, data });
            }
            _ => tracing::trace!(peer_addr = %peer, "Dropped datagram for closed peer"),
        }
    }

    fn deliver(&mut self, from: SocketAddr, datagram: Bytes) {
        if !self.peers.contains_key(&from) {
            let connection = UdpConnection::passive(self.local_addr, from, self.commands_tx.clone());
            let guard = self.tracker.track(connection.id());
            metrics::record_connection_opened(metrics::UDP, Direction::Passive);
            metrics::record_udp_peers(1.0);
            tracing::debug!(
                connection_id = %connection.id(),
                peer_addr = %from,
                port = self.port,
                "UDP peer accepted"
            );
            self.peers.insert(
                from,
                Peer {
                    connection: connection.clone(),
                    recv: DatagramQueue::new(),
                    pending: 0,
                    _guard: guard,
                },
            );
            if !self.service.on_accept(&connection, self.port) {
                self.remove_peer(from);
                return;
            }
        }

        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };
        metrics::record_bytes_received(metrics::UDP, datagram.len());
        peer.recv.push(datagram);
        let mut context = UdpContext::new(&peer.connection, &mut peer.recv);
        if !self.service.on_recv(&mut context) {
            self.remove_peer(from);
        }
    }

    fn sent(&mut self, result: io::Result<usize>) {
        let Some(outgoing) = self.send.pop_front() else {
            return;
        };
        match result {
            Ok(n) => {
                metrics::record_bytes_sent(metrics::UDP, n);
                let drained = match self.peers.get_mut(&outgoing.peer) {
                    Some(peer) if peer.connection.id() == outgoing.id => {
                        peer.pending = peer.pending.saturating_sub(1);
                        peer.pending == 0
                    }
                    _ => false,
                };
                if drained {
                    let keep = self
                        .peers
                        .get(&outgoing.peer)
                        .map_or(true, |peer| self.service.on_send(&peer.connection));
                    if !keep {
                        self.remove_peer(outgoing.peer);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(peer_addr = %outgoing.peer, error = %e, "UDP send failed");
                if self.peer_id(&outgoing.peer) == Some(outgoing.id) {
                    self.remove_peer(outgoing.peer);
                }
            }
        }
    }

    fn remove_peer(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.remove(&addr) else {
            return;
        };
        peer.connection.set_state(ConnectionState::Closed);
        metrics::record_connection_closed(metrics::UDP);
        metrics::record_udp_peers(-1.0);
        tracing::debug!(connection_id = %peer.connection.id(), peer_addr = %addr, "UDP peer closed");
        self.service.on_close(&peer.connection);
    }

    /// Close the socket, then every peer.
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.socket = None;
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.remove_peer(addr);
        }
        self.send.clear();
        tracing::info!(port = self.port, "UDP acceptor stopped");
    }
}

impl Drop for UdpAcceptor {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.stop();
        }
    }
}

async fn send_front(socket: &UdpSocket, front: Option<&Outgoing>) -> io::Result<usize> {
    match front {
        Some(outgoing) => socket.send_to(&outgoing.data, outgoing.peer).await,
        None => std::future::pending().await,
    }
}
