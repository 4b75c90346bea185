//! Registration handshake: happy path, auth failure, version mismatch,
//! duplicate-id eviction, and syntax-error tolerance — all against a real
//! in-process control listener over TLS.

use bw_core::tlsgen::TlsIdentity;
use bw_protocol::{verbs, Frame, PROTOCOL_VERSION};
use bw_test_utils::{MockController, MockFleetClient};
use client::link::{ConnectError, ControlLink};
use client::machine::MachineReport;
use server::dispatch::Dispatcher;
use server::state::{AppState, ServerOptions};
use server::{control, events};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

struct Harness {
    state: AppState,
    addr: SocketAddr,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn start_server(passkey: Option<&str>) -> Harness {
    let upload = tempfile::tempdir().unwrap();
    let handlers = tempfile::tempdir().unwrap();
    let (state, events_rx) = AppState::new(ServerOptions {
        passkey: passkey.map(str::to_owned),
        upload_dir: upload.path().to_path_buf(),
        handlers_dir: handlers.path().to_path_buf(),
        wait_start: false,
        transfer_port: 9921,
    });
    tokio::spawn(events::run_fleet_events(
        Dispatcher::new(state.clone()),
        events_rx,
    ));

    let identity = TlsIdentity::generate().unwrap();
    let acceptor = TlsAcceptor::from(identity.server_config().unwrap());
    let (addr, _task) = control::start_control(state.clone(), acceptor, "127.0.0.1:0")
        .await
        .unwrap();
    Harness {
        state,
        addr,
        _dirs: (upload, handlers),
    }
}

#[tokio::test]
async fn happy_path_registers_and_assigns_client_id() {
    let harness = start_server(Some("secret")).await;
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();

    let reply = client
        .handshake("pi1", Some("secret"), PROTOCOL_VERSION)
        .await
        .unwrap();
    assert_eq!(reply.verb, verbs::REGISTER_OK);
    assert_eq!(reply.kwarg("client_id"), Some("pi1_127.0.0.1"));
    assert_eq!(reply.kwarg("server_version"), Some(PROTOCOL_VERSION));

    // Registry converges to exactly one session for the id.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ids = harness.state.registry.client_ids().await;
    assert_eq!(ids, vec!["pi1_127.0.0.1"]);
}

#[tokio::test]
async fn wrong_passkey_is_rejected_and_disconnected() {
    let harness = start_server(Some("secret")).await;
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();

    let reply = client
        .handshake("pi1", Some("wrong"), PROTOCOL_VERSION)
        .await
        .unwrap();
    assert_eq!(reply.verb, verbs::AUTH_FAILED);
    assert!(client.wait_closed().await);
    assert!(harness.state.registry.is_empty().await);
}

#[tokio::test]
async fn missing_passkey_counts_as_auth_failure() {
    let harness = start_server(Some("secret")).await;
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();

    let reply = client.handshake("pi1", None, PROTOCOL_VERSION).await.unwrap();
    assert_eq!(reply.verb, verbs::AUTH_FAILED);
    assert!(client.wait_closed().await);
}

#[tokio::test]
async fn incompatible_version_gets_both_versions_back() {
    let harness = start_server(None).await;
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();

    let reply = client.handshake("pi1", None, "1.9.0").await.unwrap();
    assert_eq!(reply.verb, verbs::VERSION_MISMATCH);
    assert_eq!(reply.kwarg("server_version"), Some(PROTOCOL_VERSION));
    assert_eq!(reply.kwarg("client_version"), Some("1.9.0"));
    assert!(client.wait_closed().await);
    assert!(harness.state.registry.is_empty().await);
}

#[tokio::test]
async fn patch_version_difference_is_compatible() {
    let harness = start_server(None).await;
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();

    let reply = client.handshake("pi1", None, "2.0.9").await.unwrap();
    assert_eq!(reply.verb, verbs::REGISTER_OK);
}

#[tokio::test]
async fn reconnect_with_same_id_evicts_prior_session() {
    let harness = start_server(None).await;

    let mut first = MockFleetClient::connect(harness.addr).await.unwrap();
    first.register_ok("pi1", None).await.unwrap();

    let mut second = MockFleetClient::connect(harness.addr).await.unwrap();
    second.register_ok("pi1", None).await.unwrap();

    // The first connection is closed; the registry still holds exactly one
    // session under the id.
    assert!(first.wait_closed().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.state.registry.len().await, 1);
    assert_eq!(
        harness.state.registry.client_ids().await,
        vec!["pi1_127.0.0.1"]
    );
}

#[tokio::test]
async fn syntax_error_after_registration_keeps_session() {
    let harness = start_server(None).await;
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();
    client.register_ok("pi1", None).await.unwrap();

    client.send_raw("START ps='unterminated").await.unwrap();
    let reply = client.recv_frame().await.unwrap();
    assert_eq!(reply.verb, verbs::ERROR);

    // Channel still alive: a client-side ping is answered.
    client.send_frame(&Frame::new(verbs::PING)).await.unwrap();
    let pong = client.recv_frame().await.unwrap();
    assert_eq!(pong.verb, verbs::PONG);
    assert_eq!(harness.state.registry.len().await, 1);
}

// ---------------------------------------------------------------------------
// Client-side link against a scripted controller
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_link_sends_register_auth_ver_in_order() {
    let controller = MockController::start().await.unwrap();
    let addr = controller.local_addr();

    let script = tokio::spawn(async move {
        let mut link = controller.accept().await.unwrap();
        let register = link.recv_frame().await.unwrap();
        assert_eq!(register.verb, verbs::REGISTER);
        assert!(!register.kwarg("hostname").unwrap_or_default().is_empty());
        assert!(!register.kwarg("machine").unwrap_or_default().is_empty());

        let auth = link.recv_frame().await.unwrap();
        assert_eq!(auth.verb, verbs::AUTH);
        assert_eq!(auth.positional(0), Some("secret"));

        let ver = link.recv_frame().await.unwrap();
        assert_eq!(ver.verb, verbs::VER);
        assert_eq!(ver.positional(0), Some(PROTOCOL_VERSION));

        link.send_frame(
            &Frame::new(verbs::REGISTER_OK)
                .kw("client_id", "pi1_127.0.0.1")
                .kw("server_version", PROTOCOL_VERSION),
        )
        .await
        .unwrap();
    });

    let machine = MachineReport::collect();
    let (_link, registration) =
        ControlLink::connect("127.0.0.1", addr.port(), Some("secret"), &machine)
            .await
            .unwrap();
    assert_eq!(registration.client_id, "pi1_127.0.0.1");
    assert_eq!(registration.server_version, PROTOCOL_VERSION);
    script.await.unwrap();
}

#[tokio::test]
async fn client_link_surfaces_version_mismatch() {
    let controller = MockController::start().await.unwrap();
    let addr = controller.local_addr();

    let script = tokio::spawn(async move {
        let mut link = controller.accept().await.unwrap();
        let _register = link.recv_frame().await.unwrap();
        let _ver = link.recv_frame().await.unwrap();
        link.send_frame(
            &Frame::new(verbs::VERSION_MISMATCH)
                .kw("server_version", "3.1.0")
                .kw("client_version", PROTOCOL_VERSION),
        )
        .await
        .unwrap();
    });

    let machine = MachineReport::collect();
    let err = ControlLink::connect("127.0.0.1", addr.port(), None, &machine)
        .await
        .unwrap_err();
    match err {
        ConnectError::VersionMismatch { server, client } => {
            assert_eq!(server, "3.1.0");
            assert_eq!(client, PROTOCOL_VERSION);
        }
        other => panic!("expected VersionMismatch, got {other}"),
    }
    script.await.unwrap();
}

#[tokio::test]
async fn client_link_surfaces_auth_failure() {
    let controller = MockController::start().await.unwrap();
    let addr = controller.local_addr();

    let script = tokio::spawn(async move {
        let mut link = controller.accept().await.unwrap();
        let _register = link.recv_frame().await.unwrap();
        let _auth = link.recv_frame().await.unwrap();
        link.send_frame(
            &Frame::new(verbs::AUTH_FAILED).kw("message", "Invalid passkey"),
        )
        .await
        .unwrap();
    });

    let machine = MachineReport::collect();
    let err = ControlLink::connect("127.0.0.1", addr.port(), Some("wrong"), &machine)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::AuthFailed));
    script.await.unwrap();
}

#[tokio::test]
async fn first_frame_must_be_register() {
    let harness = start_server(None).await;
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();

    client.send_frame(&Frame::new(verbs::PING)).await.unwrap();
    let reply = client.recv_frame().await.unwrap();
    assert_eq!(reply.verb, verbs::ERROR);
    assert!(harness.state.registry.is_empty().await);
}
