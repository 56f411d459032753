//! UDP connection handle (passive peer or active socket) and the active driver.
//!
//! A passive connection owns no socket: its sends and its close are routed
//! to the acceptor that demultiplexed it. An active connection owns a
//! connected socket driven by [`UdpDriver`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::buffer::{DatagramQueue, SendQueue};
use crate::net::{ConnectionGuard, ConnectionId, ConnectionState, Direction, Identity, StateCell};
use crate::observability::metrics;
use crate::udp::acceptor::AcceptorCommand;
use crate::udp::service::UdpService;

/// Requests posted to an active connection's driver.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Bytes),
    Close,
}

enum Route {
    Passive(mpsc::UnboundedSender<AcceptorCommand>),
    Active(mpsc::UnboundedSender<Command>),
}

struct Shared {
    id: ConnectionId,
    direction: Direction,
    identity: Identity,
    host_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: StateCell,
    route: Route,
}

/// Handle to one UDP connection. Usable from any thread.
#[derive(Clone)]
pub struct UdpConnection {
    shared: Arc<Shared>,
}

impl UdpConnection {
    pub(crate) fn passive(
        host_addr: SocketAddr,
        peer_addr: SocketAddr,
        acceptor: mpsc::UnboundedSender<AcceptorCommand>,
    ) -> Self {
        Self::build(
            Direction::Passive,
            Identity::default(),
            host_addr,
            peer_addr,
            Route::Passive(acceptor),
        )
    }

    pub(crate) fn active(
        host_addr: SocketAddr,
        peer_addr: SocketAddr,
        identity: Identity,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let connection = Self::build(
            Direction::Active,
            identity,
            host_addr,
            peer_addr,
            Route::Active(commands),
        );
        (connection, rx)
    }

    fn build(
        direction: Direction,
        identity: Identity,
        host_addr: SocketAddr,
        peer_addr: SocketAddr,
        route: Route,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: ConnectionId::new(),
                direction,
                identity,
                host_addr,
                peer_addr,
                state: StateCell::new(ConnectionState::Running),
                route,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn is_passive(&self) -> bool {
        self.shared.direction == Direction::Passive
    }

    /// Local address of the socket carrying this connection.
    pub fn host_address(&self) -> SocketAddr {
        self.shared.host_addr
    }

    /// Remote endpoint.
    pub fn peer_address(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.shared.state.set(state);
    }

    /// Queue `data` as one datagram.
    pub fn send_buffer_fill(&self, data: &[u8]) -> bool {
        self.send_buffer_fill_len(Some(data), data.len())
    }

    /// Queue the first `len` bytes of `data` as one datagram.
    pub fn send_buffer_fill_len(&self, data: Option<&[u8]>, len: usize) -> bool {
        match data {
            _ if len == 0 => true,
            None => false,
            Some(data) if len > data.len() => false,
            Some(data) => self.send_bytes(Bytes::copy_from_slice(&data[..len])),
        }
    }

    /// Queue an owned chunk as one datagram.
    pub fn send_bytes(&self, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }
        if !self.is_running() {
            return false;
        }
        match &self.shared.route {
            Route::Passive(acceptor) => acceptor
                .send(AcceptorCommand::Send {
                    peer: self.shared.peer_addr,
                    id: self.shared.id,
                    data,
                })
                .is_ok(),
            Route::Active(commands) => commands.send(Command::Send(data)).is_ok(),
        }
    }

    /// Close the connection. Safe to call repeatedly and from any thread.
    ///
    /// Closing a passive peer leaves the shared socket open.
    pub fn close(&self) {
        match &self.shared.route {
            Route::Passive(acceptor) => {
                let _ = acceptor.send(AcceptorCommand::Close {
                    peer: self.shared.peer_addr,
                    id: self.shared.id,
                });
            }
            Route::Active(commands) => {
                let _ = commands.send(Command::Close);
            }
        }
    }
}

impl PartialEq for UdpConnection {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for UdpConnection {}

impl fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpConnection")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// On-loop view of a UDP connection passed to `on_recv`.
pub struct UdpContext<'a> {
    connection: &'a UdpConnection,
    recv: &'a mut DatagramQueue,
}

impl<'a> UdpContext<'a> {
    pub(crate) fn new(connection: &'a UdpConnection, recv: &'a mut DatagramQueue) -> Self {
        Self { connection, recv }
    }

    pub fn connection(&self) -> &UdpConnection {
        self.connection
    }

    pub fn recv_buffer_has_data(&self) -> bool {
        self.recv.has_data()
    }

    /// Payload of the oldest queued datagram.
    pub fn recv_buffer_data(&self) -> &[u8] {
        self.recv.front()
    }

    /// Length of the oldest queued datagram.
    pub fn recv_buffer_size(&self) -> usize {
        self.recv.front_len()
    }

    /// Number of queued datagrams.
    pub fn recv_buffer_count(&self) -> usize {
        self.recv.len()
    }

    /// Discard the oldest datagram; `len` must equal its length.
    pub fn recv_buffer_drop(&mut self, len: usize) -> bool {
        self.recv.drop_front(len)
    }

    pub fn recv_buffer_pop(&mut self) -> Option<Bytes> {
        self.recv.pop()
    }
}

impl Deref for UdpContext<'_> {
    type Target = UdpConnection;

    fn deref(&self) -> &UdpConnection {
        self.connection
    }
}

enum Event {
    Command(Option<Command>),
    Received(io::Result<usize>),
    Sent(io::Result<usize>),
}

/// Drives an active UDP connection over its own connected socket.
pub(crate) struct UdpDriver {
    connection: UdpConnection,
    service: Arc<dyn UdpService>,
    recv: DatagramQueue,
    send: SendQueue,
    buf: Vec<u8>,
    finished: bool,
    _guard: ConnectionGuard,
}

impl UdpDriver {
    pub(crate) fn new(
        connection: UdpConnection,
        service: Arc<dyn UdpService>,
        max_datagram_size: usize,
        guard: ConnectionGuard,
    ) -> Self {
        Self {
            connection,
            service,
            recv: DatagramQueue::new(),
            send: SendQueue::new(),
            buf: vec![0; max_datagram_size],
            finished: false,
            _guard: guard,
        }
    }

    pub(crate) async fn run(mut self, socket: UdpSocket, mut commands: mpsc::UnboundedReceiver<Command>) {
        let connection = self.connection.clone();
        metrics::record_connection_opened(metrics::UDP, Direction::Active);
        tracing::debug!(
            connection_id = %connection.id(),
            peer_addr = %connection.peer_address(),
            "UDP connection established"
        );

        if self.service.on_connect(Some(&connection), connection.identity()) {
            if let Err(e) = self.pump(&socket, &mut commands).await {
                tracing::warn!(connection_id = %connection.id(), error = %e, "UDP connection I/O error");
            }
        }
        commands.close();
        self.finish();
    }

    async fn pump(
        &mut self,
        socket: &UdpSocket,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> io::Result<()> {
        loop {
            let event = tokio::select! {
                biased;
                command = commands.recv() => Event::Command(command),
                result = socket.recv(&mut self.buf) => Event::Received(result),
                result = socket.send(self.send.unwritten()), if !self.send.is_empty() => Event::Sent(result),
            };

            match event {
                Event::Command(Some(Command::Send(data))) => {
                    self.send.push(data);
                }
                Event::Command(Some(Command::Close)) | Event::Command(None) => return Ok(()),
                Event::Received(Ok(n)) => {
                    self.recv.push(Bytes::copy_from_slice(&self.buf[..n]));
                    metrics::record_bytes_received(metrics::UDP, n);
                    let mut context = UdpContext::new(&self.connection, &mut self.recv);
                    if !self.service.on_recv(&mut context) {
                        return Ok(());
                    }
                }
                Event::Received(Err(e)) => return Err(e),
                Event::Sent(Ok(n)) => {
                    metrics::record_bytes_sent(metrics::UDP, n);
                    self.send.pop_front();
                    if self.send.is_empty() && !self.service.on_send(&self.connection) {
                        return Ok(());
                    }
                }
                Event::Sent(Err(e)) => return Err(e),
            }
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.connection.set_state(ConnectionState::Closed);
        metrics::record_connection_closed(metrics::UDP);
        tracing::debug!(connection_id = %self.connection.id(), "UDP connection closed");
        self.service.on_close(&self.connection);
    }
}

impl Drop for UdpDriver {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.finish();
        }
    }
}
