//! Shared utilities for the manager integration tests.
#![allow(dead_code)]

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netloom::net::Resolver;
use netloom::{
    ConnectionId, Identity, TcpConnection, TcpContext, TcpManagerConfig, TcpService,
    UdpConnection, UdpContext, UdpManagerConfig, UdpService,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);
/// How long to watch for an event that must not happen.
pub const QUIET: Duration = Duration::from_millis(300);

pub fn init_tracing() {
    let _ = netloom::observability::logging::init_logging("warn");
}

pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

/// A loopback port nothing listens on once this returns.
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn local_tcp(ports: impl Into<Vec<u16>>) -> TcpManagerConfig {
    TcpManagerConfig {
        thread_count: 2,
        bind_host: "127.0.0.1".to_string(),
        connect_timeout_secs: 2,
        ..TcpManagerConfig::with_ports(ports)
    }
}

pub fn local_udp(ports: impl Into<Vec<u16>>) -> UdpManagerConfig {
    UdpManagerConfig {
        thread_count: 2,
        bind_host: "127.0.0.1".to_string(),
        ..UdpManagerConfig::with_ports(ports)
    }
}

pub fn connect_client(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

/// Read until `len` bytes arrived or the peer closed.
pub fn read_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    stream.read_exact(&mut out).unwrap();
    out
}

/// True once the peer closed the stream.
pub fn wait_for_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
    false
}

/// First event matching `pred`, skipping the others.
pub fn recv_matching<T>(rx: &Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match rx.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Every event that arrives within `window`.
pub fn drain_for<T>(rx: &Receiver<T>, window: Duration) -> Vec<T> {
    let deadline = Instant::now() + window;
    let mut events = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
    }
    events
}

pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Resolver handing out a fixed candidate list, or a fixed failure.
pub struct FixedResolver {
    pub candidates: Vec<SocketAddr>,
}

impl Resolver for FixedResolver {
    fn resolve(&self, host: &str, _service: &str) -> io::Result<Vec<SocketAddr>> {
        if self.candidates.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such host '{host}'"),
            ));
        }
        Ok(self.candidates.clone())
    }
}

#[derive(Debug, Clone)]
pub enum TcpEvent {
    Connected {
        identity: Identity,
        connection: Option<TcpConnection>,
    },
    Accepted {
        port: u16,
        connection: TcpConnection,
    },
    Received {
        id: ConnectionId,
        data: Vec<u8>,
    },
    Sent {
        id: ConnectionId,
    },
    Closed {
        id: ConnectionId,
    },
    Error {
        operation: String,
        action: String,
        code: i32,
    },
}

/// Records every callback; optionally echoes what it receives.
pub struct TcpRecorder {
    events: Mutex<Sender<TcpEvent>>,
    pub accept: bool,
    pub echo: bool,
}

impl TcpRecorder {
    pub fn new() -> (Arc<Self>, Receiver<TcpEvent>) {
        Self::with(true, true)
    }

    pub fn with(accept: bool, echo: bool) -> (Arc<Self>, Receiver<TcpEvent>) {
        let (tx, rx) = mpsc::channel();
        let recorder = Self {
            events: Mutex::new(tx),
            accept,
            echo,
        };
        (Arc::new(recorder), rx)
    }

    fn record(&self, event: TcpEvent) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl TcpService for TcpRecorder {
    fn on_connect(&self, connection: Option<&TcpConnection>, identity: Identity) -> bool {
        self.record(TcpEvent::Connected {
            identity,
            connection: connection.cloned(),
        });
        true
    }

    fn on_accept(&self, connection: &TcpConnection, listen_port: u16) -> bool {
        self.record(TcpEvent::Accepted {
            port: listen_port,
            connection: connection.clone(),
        });
        self.accept
    }

    fn on_recv(&self, context: &mut TcpContext<'_>) -> bool {
        let size = context.recv_buffer_size();
        let Some(data) = context.recv_buffer_take(size) else {
            return false;
        };
        self.record(TcpEvent::Received {
            id: context.id(),
            data: data.to_vec(),
        });
        if self.echo && context.is_passive() {
            return context.send_bytes(data);
        }
        true
    }

    fn on_send(&self, connection: &TcpConnection) -> bool {
        self.record(TcpEvent::Sent { id: connection.id() });
        true
    }

    fn on_close(&self, connection: &TcpConnection) {
        self.record(TcpEvent::Closed { id: connection.id() });
    }

    fn on_error(
        &self,
        _connection: Option<&TcpConnection>,
        operation: &str,
        action: &str,
        code: i32,
        _message: &str,
    ) {
        self.record(TcpEvent::Error {
            operation: operation.to_string(),
            action: action.to_string(),
            code,
        });
    }
}

#[derive(Debug, Clone)]
pub enum UdpEvent {
    Connected {
        identity: Identity,
        connection: Option<UdpConnection>,
    },
    Accepted {
        port: u16,
        connection: UdpConnection,
    },
    Received {
        id: ConnectionId,
        peer: SocketAddr,
        data: Vec<u8>,
    },
    Sent {
        id: ConnectionId,
    },
    Closed {
        id: ConnectionId,
    },
    Error {
        operation: String,
        action: String,
    },
}

/// Records every callback. Passive peers echo each datagram; a datagram
/// reading `bye` closes its peer instead.
pub struct UdpRecorder {
    events: Mutex<Sender<UdpEvent>>,
}

impl UdpRecorder {
    pub fn new() -> (Arc<Self>, Receiver<UdpEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { events: Mutex::new(tx) }), rx)
    }

    fn record(&self, event: UdpEvent) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl UdpService for UdpRecorder {
    fn on_connect(&self, connection: Option<&UdpConnection>, identity: Identity) -> bool {
        self.record(UdpEvent::Connected {
            identity,
            connection: connection.cloned(),
        });
        true
    }

    fn on_accept(&self, connection: &UdpConnection, listen_port: u16) -> bool {
        self.record(UdpEvent::Accepted {
            port: listen_port,
            connection: connection.clone(),
        });
        true
    }

    fn on_recv(&self, context: &mut UdpContext<'_>) -> bool {
        while let Some(datagram) = context.recv_buffer_pop() {
            self.record(UdpEvent::Received {
                id: context.id(),
                peer: context.peer_address(),
                data: datagram.to_vec(),
            });
            if context.is_passive() {
                if &datagram[..] == b"bye" {
                    return false;
                }
                context.send_bytes(datagram);
            }
        }
        true
    }

    fn on_send(&self, connection: &UdpConnection) -> bool {
        self.record(UdpEvent::Sent { id: connection.id() });
        true
    }

    fn on_close(&self, connection: &UdpConnection) {
        self.record(UdpEvent::Closed { id: connection.id() });
    }

    fn on_error(
        &self,
        _connection: Option<&UdpConnection>,
        operation: &str,
        action: &str,
        _code: i32,
        _message: &str,
    ) {
        self.record(UdpEvent::Error {
            operation: operation.to_string(),
            action: action.to_string(),
        });
    }
}
