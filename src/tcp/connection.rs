//! TCP connection handle and the driver task that owns its socket.
//!
//! # Responsibilities
//! - Hand out a cheap, cloneable handle usable from any thread
//! - Marshal sends, watermark changes and close requests onto the owning loop
//! - Keep at most one read and one write outstanding
//! - Fire `on_close` exactly once, however the connection ends
//!
//! # Design Decisions
//! - The driver is the single owner of the socket and both buffers
//! - Requests from other threads travel over a channel, never through locks

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, OwnedSemaphorePermit};

use crate::buffer::{RecvBuffer, SendQueue};
use crate::net::{ConnectionGuard, ConnectionId, ConnectionState, Direction, Identity, StateCell, Transport};
use crate::observability::metrics;
use crate::tcp::service::TcpService;

/// Requests posted to a connection's driver.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Bytes),
    WaterMark(usize),
    Close,
}

struct Shared {
    id: ConnectionId,
    direction: Direction,
    identity: Identity,
    tls: bool,
    host_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: StateCell,
    commands: mpsc::UnboundedSender<Command>,
}

/// Handle to one TCP connection.
///
/// Clones refer to the same connection. Every mutating call is posted to the
/// owning loop, so the handle may be used from any thread.
#[derive(Clone)]
pub struct TcpConnection {
    shared: Arc<Shared>,
}

impl TcpConnection {
    pub(crate) fn new(
        direction: Direction,
        identity: Identity,
        transport: &Transport,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<Command>)> {
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            id: ConnectionId::new(),
            direction,
            identity,
            tls: transport.is_tls(),
            host_addr: transport.local_addr()?,
            peer_addr: transport.peer_addr()?,
            state: StateCell::new(ConnectionState::Running),
            commands,
        };
        Ok((
            Self {
                shared: Arc::new(shared),
            },
            rx,
        ))
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Token passed to `create_connection`; default for accepted connections.
    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn is_passive(&self) -> bool {
        self.shared.direction == Direction::Passive
    }

    pub fn is_tls(&self) -> bool {
        self.shared.tls
    }

    /// Local address of the socket.
    pub fn host_address(&self) -> SocketAddr {
        self.shared.host_addr
    }

    /// Remote address of the socket.
    pub fn peer_address(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    /// Queue `data` for sending.
    pub fn send_buffer_fill(&self, data: &[u8]) -> bool {
        self.send_buffer_fill_len(Some(data), data.len())
    }

    /// Queue the first `len` bytes of `data`.
    ///
    /// `len == 0` succeeds without queuing anything; missing data with a
    /// non-zero length, or `len` past the end of `data`, fails.
    pub fn send_buffer_fill_len(&self, data: Option<&[u8]>, len: usize) -> bool {
        match data {
            _ if len == 0 => true,
            None => false,
            Some(data) if len > data.len() => false,
            Some(data) => self.send_bytes(Bytes::copy_from_slice(&data[..len])),
        }
    }

    /// Queue an owned chunk without copying it.
    ///
    /// Returns false once the connection has closed.
    pub fn send_bytes(&self, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }
        self.shared.commands.send(Command::Send(data)).is_ok()
    }

    /// Set the buffered byte count required before the next `on_recv`.
    pub fn recv_buffer_water_mark(&self, len: usize) {
        let _ = self.shared.commands.send(Command::WaterMark(len));
    }

    /// Close the connection. Safe to call repeatedly and from any thread.
    pub fn close(&self) {
        let _ = self.shared.commands.send(Command::Close);
    }
}

impl PartialEq for TcpConnection {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for TcpConnection {}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("tls", &self.shared.tls)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// On-loop view of a connection passed to `on_recv`.
///
/// Dereferences to the [`TcpConnection`] handle; the receive buffer methods
/// operate directly on the driver's buffer.
pub struct TcpContext<'a> {
    connection: &'a TcpConnection,
    recv: &'a mut RecvBuffer,
}

impl<'a> TcpContext<'a> {
    pub fn connection(&self) -> &TcpConnection {
        self.connection
    }

    /// Committed, not yet consumed bytes.
    pub fn recv_buffer_data(&self) -> &[u8] {
        self.recv.data()
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.recv.len()
    }

    /// Copy `out.len()` bytes without consuming them.
    pub fn recv_buffer_copy(&self, out: &mut [u8]) -> bool {
        self.recv.copy_to(out)
    }

    /// Copy and consume `out.len()` bytes.
    pub fn recv_buffer_move(&mut self, out: &mut [u8]) -> bool {
        self.recv.move_to(out)
    }

    /// Consume `len` bytes without copying.
    pub fn recv_buffer_drop(&mut self, len: usize) -> bool {
        self.recv.drop_front(len)
    }

    /// Move `len` bytes out as an owned chunk.
    pub fn recv_buffer_take(&mut self, len: usize) -> Option<Bytes> {
        self.recv.take(len)
    }

    /// Takes effect for the next read completion.
    pub fn recv_buffer_water_mark(&mut self, len: usize) {
        self.recv.set_watermark(len);
    }
}

impl Deref for TcpContext<'_> {
    type Target = TcpConnection;

    fn deref(&self) -> &TcpConnection {
        self.connection
    }
}

/// How the connection came to exist; selects the opening callback.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Opened {
    Accepted { listen_port: u16 },
    Connected,
}

enum CloseReason {
    Requested,
    PeerClosed,
    /// The named callback returned false.
    Rejected(&'static str),
    Failed(io::Error),
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Requested => "requested",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::Rejected(callback) => callback,
            CloseReason::Failed(_) => "failed",
        }
    }
}

enum Event {
    Command(Option<Command>),
    Read(io::Result<usize>),
    Write(io::Result<usize>),
}

/// Owns the transport side of one connection for its whole life.
pub(crate) struct TcpDriver {
    connection: TcpConnection,
    service: Arc<dyn TcpService>,
    recv: RecvBuffer,
    send: SendQueue,
    chunk_size: usize,
    /// Bound on flushing queued data after a close; `None` drops it.
    linger: Option<Duration>,
    transport: &'static str,
    finished: bool,
    _guard: ConnectionGuard,
    _permit: Option<OwnedSemaphorePermit>,
}

impl TcpDriver {
    pub(crate) fn new(
        connection: TcpConnection,
        service: Arc<dyn TcpService>,
        chunk_size: usize,
        linger: Option<Duration>,
        guard: ConnectionGuard,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let transport = if connection.is_tls() {
            metrics::TLS
        } else {
            metrics::TCP
        };
        Self {
            connection,
            service,
            recv: RecvBuffer::new(),
            send: SendQueue::new(),
            chunk_size,
            linger,
            transport,
            finished: false,
            _guard: guard,
            _permit: permit,
        }
    }

    pub(crate) async fn run(
        mut self,
        transport: Transport,
        mut commands: mpsc::UnboundedReceiver<Command>,
        opened: Opened,
    ) {
        let connection = self.connection.clone();
        metrics::record_connection_opened(self.transport, connection.direction());
        tracing::debug!(
            connection_id = %connection.id(),
            peer_addr = %connection.peer_address(),
            direction = connection.direction().as_str(),
            tls = connection.is_tls(),
            "Connection established"
        );

        let keep = match opened {
            Opened::Accepted { listen_port } => self.service.on_accept(&connection, listen_port),
            Opened::Connected => self.service.on_connect(Some(&connection), connection.identity()),
        };
        if !keep {
            tracing::debug!(connection_id = %connection.id(), "Connection rejected by service");
            commands.close();
            self.finish();
            return;
        }

        let (mut reader, mut writer) = tokio::io::split(transport);
        let reason = self.pump(&mut reader, &mut writer, &mut commands).await;
        commands.close();
        connection.shared.state.set(ConnectionState::Closing);

        match (&reason, self.linger) {
            (CloseReason::Failed(e), _) => {
                tracing::warn!(connection_id = %connection.id(), error = %e, "Connection I/O error");
            }
            (reason, Some(linger)) => {
                tracing::debug!(connection_id = %connection.id(), reason = reason.as_str(), "Connection closing");
                // Requests queued before the close still reach the peer.
                while let Ok(command) = commands.try_recv() {
                    if let Command::Send(data) = command {
                        self.send.push(data);
                    }
                }
                if let Err(e) = self.flush_queued(&mut writer, linger).await {
                    tracing::debug!(connection_id = %connection.id(), error = %e, "Dropped unsent data");
                }
            }
            (reason, None) => {
                tracing::debug!(
                    connection_id = %connection.id(),
                    reason = reason.as_str(),
                    unsent_bytes = self.send.queued_bytes(),
                    "Connection closing"
                );
            }
        }
        // Without a linger this is a single attempt; a peer that stopped
        // reading cannot hold the close up.
        let grace = self.linger.unwrap_or(Duration::ZERO);
        let _ = tokio::time::timeout(grace, writer.shutdown()).await;
        drop(writer);
        drop(reader);
        self.finish();
    }

    async fn pump(
        &mut self,
        reader: &mut ReadHalf<Transport>,
        writer: &mut WriteHalf<Transport>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> CloseReason {
        loop {
            let event = tokio::select! {
                biased;
                command = commands.recv() => Event::Command(command),
                result = reader.read(self.recv.prepare(self.chunk_size)) => Event::Read(result),
                result = writer.write(self.send.unwritten()), if !self.send.is_empty() => Event::Write(result),
            };

            match event {
                Event::Command(Some(Command::Send(data))) => {
                    self.send.push(data);
                }
                Event::Command(Some(Command::WaterMark(len))) => self.recv.set_watermark(len),
                Event::Command(Some(Command::Close)) | Event::Command(None) => {
                    return CloseReason::Requested;
                }
                Event::Read(Ok(0)) => return CloseReason::PeerClosed,
                Event::Read(Ok(n)) => {
                    self.recv.commit(n);
                    metrics::record_bytes_received(self.transport, n);
                    tracing::trace!(connection_id = %self.connection.id(), bytes = n, buffered = self.recv.len(), "Read");
                    if self.recv.reached_watermark() {
                        let mut context = TcpContext {
                            connection: &self.connection,
                            recv: &mut self.recv,
                        };
                        if !self.service.on_recv(&mut context) {
                            return CloseReason::Rejected("on_recv");
                        }
                    }
                }
                Event::Read(Err(e)) => return CloseReason::Failed(e),
                Event::Write(Ok(0)) => {
                    return CloseReason::Failed(io::Error::from(io::ErrorKind::WriteZero));
                }
                Event::Write(Ok(n)) => {
                    metrics::record_bytes_sent(self.transport, n);
                    tracing::trace!(connection_id = %self.connection.id(), bytes = n, "Wrote");
                    if self.send.advance(n) && self.send.is_empty() {
                        if let Err(e) = writer.flush().await {
                            return CloseReason::Failed(e);
                        }
                        if !self.service.on_send(&self.connection) {
                            return CloseReason::Rejected("on_send");
                        }
                    }
                }
                Event::Write(Err(e)) => return CloseReason::Failed(e),
            }
        }
    }

    /// Write out whatever is still queued, bounded by `linger`.
    async fn flush_queued(&mut self, writer: &mut WriteHalf<Transport>, linger: Duration) -> io::Result<()> {
        if self.send.is_empty() {
            return Ok(());
        }
        let drain = async {
            while let Some(chunk) = self.send.pop_front() {
                writer.write_all(&chunk).await?;
                metrics::record_bytes_sent(self.transport, chunk.len());
            }
            writer.flush().await
        };
        tokio::time::timeout(linger, drain)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "close linger expired"))?
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.connection.shared.state.set(ConnectionState::Closed);
        metrics::record_connection_closed(self.transport);
        tracing::debug!(connection_id = %self.connection.id(), "Connection closed");
        self.service.on_close(&self.connection);
    }
}

impl Drop for TcpDriver {
    fn drop(&mut self) {
        // Reached without `finish` when the owning loop stops mid-run.
        if !thread::panicking() {
            self.finish();
        }
    }
}
