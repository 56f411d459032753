//! TLS on both roles of one manager.

use netloom::{Certificate, ConnectRequest, NetError, TcpManager};

mod common;
use common::{TcpEvent, TcpRecorder};

fn is_handshake_error(event: &TcpEvent) -> bool {
    matches!(event, TcpEvent::Error { operation, action, .. } if operation == "connection" && action == "handshake")
}

fn tls_config(ca: &str) -> netloom::TcpManagerConfig {
    let mut config = common::local_tcp([0]);
    config.server_certificate = Some(Certificate::from_files(
        common::fixture("server.pem"),
        common::fixture("server.key"),
    ));
    config.client_certificate = Some(Certificate::trust_only(common::fixture(ca), true));
    config
}

#[test]
fn tls_round_trip_verifies_the_server_name() {
    common::init_tracing();
    let (service, events) = TcpRecorder::new();
    let manager = TcpManager::new();
    manager.init(service, &tls_config("ca.pem")).unwrap();
    let port = manager.get_ports()[0];

    manager
        .create_connection(ConnectRequest::new("localhost", port).identity(1))
        .unwrap();
    let connected = common::recv_matching(&events, |e| matches!(e, TcpEvent::Connected { .. }));
    let Some(TcpEvent::Connected { connection: Some(connection), .. }) = connected else {
        panic!("TLS connect failed");
    };
    assert!(connection.is_tls());

    assert!(connection.send_buffer_fill(b"over tls"));
    let id = connection.id();
    let echoed = common::recv_matching(&events, |e| matches!(e, TcpEvent::Received { id: got, .. } if *got == id));
    assert!(matches!(echoed, Some(TcpEvent::Received { data, .. }) if data == b"over tls"));
}

#[test]
fn untrusted_server_never_reaches_the_service() {
    let (service, events) = TcpRecorder::new();
    let manager = TcpManager::new();
    manager.init(service, &tls_config("other_ca.pem")).unwrap();
    let port = manager.get_ports()[0];

    manager
        .create_connection(ConnectRequest::new("localhost", port).identity(2))
        .unwrap();
    let seen = common::drain_for(&events, std::time::Duration::from_secs(1));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, TcpEvent::Connected { .. } | TcpEvent::Accepted { .. })),
        "{seen:?}"
    );
    assert!(seen.iter().any(is_handshake_error), "{seen:?}");
}

/// Server that demands a client certificate issued by `ca.pem`.
fn mutual_config(client: Certificate) -> netloom::TcpManagerConfig {
    let mut config = common::local_tcp([0]);
    config.server_certificate = Some(Certificate {
        ca: Some(common::fixture("ca.pem")),
        ..Certificate::from_files(common::fixture("server.pem"), common::fixture("server.key"))
    });
    config.client_certificate = Some(client);
    config
}

#[test]
fn client_certificate_passes_server_verification() {
    let (service, events) = TcpRecorder::new();
    let manager = TcpManager::new();
    let client = Certificate {
        ca: Some(common::fixture("ca.pem")),
        ..Certificate::from_files(common::fixture("server.pem"), common::fixture("server.key"))
    };
    manager.init(service, &mutual_config(client)).unwrap();
    let port = manager.get_ports()[0];

    manager
        .create_connection(ConnectRequest::new("localhost", port).identity(3))
        .unwrap();
    let accepted = common::recv_matching(&events, |e| matches!(e, TcpEvent::Accepted { .. }));
    assert!(matches!(accepted, Some(TcpEvent::Accepted { connection, .. }) if connection.is_tls()));
}

#[test]
fn client_without_certificate_is_never_accepted() {
    let (service, events) = TcpRecorder::new();
    let manager = TcpManager::new();
    let client = Certificate::trust_only(common::fixture("ca.pem"), true);
    manager.init(service, &mutual_config(client)).unwrap();
    let port = manager.get_ports()[0];

    manager
        .create_connection(ConnectRequest::new("localhost", port).identity(4))
        .unwrap();
    let seen = common::drain_for(&events, std::time::Duration::from_secs(1));
    assert!(!seen.iter().any(|e| matches!(e, TcpEvent::Accepted { .. })), "{seen:?}");
    assert!(seen.iter().any(is_handshake_error), "{seen:?}");
}

#[test]
fn required_tls_refuses_to_start_without_its_certificate() {
    let (service, events) = TcpRecorder::new();
    let manager = TcpManager::new();
    let mut config = common::local_tcp([0]);
    config.require_tls = true;
    config.server_certificate = Some(Certificate::from_files(
        common::fixture("missing.pem"),
        common::fixture("missing.key"),
    ));

    let err = manager.init(service, &config).unwrap_err();
    assert!(matches!(err, NetError::Certificate { .. }));
    assert!(!manager.is_running());
    assert!(manager.get_ports().is_empty());
    assert!(common::recv_matching(&events, |e| matches!(
        e,
        TcpEvent::Error { action, .. } if action == "load server certificate"
    ))
    .is_some());
}

#[test]
fn unusable_server_certificate_falls_back_to_plain_tcp() {
    let (service, events) = TcpRecorder::new();
    let manager = TcpManager::new();
    let mut config = common::local_tcp([0]);
    config.server_certificate = Some(Certificate::from_files(
        common::fixture("missing.pem"),
        common::fixture("missing.key"),
    ));
    manager.init(service, &config).unwrap();

    assert!(common::recv_matching(&events, |e| matches!(
        e,
        TcpEvent::Error { operation, .. } if operation == "manager"
    ))
    .is_some());

    let mut client = common::connect_client(manager.get_ports()[0]);
    std::io::Write::write_all(&mut client, b"plain").unwrap();
    assert_eq!(common::read_len(&mut client, 5), b"plain");
}
