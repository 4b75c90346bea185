//! Broadcast scheduler end-to-end: a multi-client start shares one future
//! epoch, a single-client start is immediate, and per-target failures never
//! leak across the fan-out.

use bw_core::tlsgen::TlsIdentity;
use bw_protocol::{verbs, BroadcastParams, Frame};
use bw_test_utils::MockFleetClient;
use server::dispatch::Dispatcher;
use server::state::{AppState, ServerOptions};
use server::{control, events, scheduler};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

struct Harness {
    state: AppState,
    addr: SocketAddr,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn start_server(wait_start: bool) -> Harness {
    let upload = tempfile::tempdir().unwrap();
    let handlers = tempfile::tempdir().unwrap();
    let (state, events_rx) = AppState::new(ServerOptions {
        passkey: None,
        upload_dir: upload.path().to_path_buf(),
        handlers_dir: handlers.path().to_path_buf(),
        wait_start,
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

async fn register(harness: &Harness, hostname: &str) -> MockFleetClient {
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();
    client.register_ok(hostname, None).await.unwrap();
    client
}

/// Wait until the registry converges to `n` clients.
async fn await_fleet(harness: &Harness, n: usize) {
    for _ in 0..100 {
        if harness.state.registry.len().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fleet never reached {n} clients");
}

#[tokio::test]
async fn three_clients_share_one_future_epoch() {
    let harness = start_server(true).await;
    // Distinct hostnames keep the ids unique on 127.0.0.1.
    let clients = vec![
        register(&harness, "pi1").await,
        register(&harness, "pi2").await,
        register(&harness, "pi3").await,
    ];
    await_fleet(&harness, 3).await;

    let before = scheduler::now_epoch();
    let state = harness.state.clone();
    let dispatch = tokio::spawn(async move {
        scheduler::start_broadcast(&state, "all", BroadcastParams::for_file("song.wav")).await
    });

    let mut observed = Vec::new();
    for mut client in clients {
        let frame = client.recv_command().await.unwrap();
        assert_eq!(frame.verb, verbs::START);
        assert_eq!(frame.kwarg("filename"), Some("song.wav"));
        let start_at: f64 = frame.kwarg("start_at").unwrap().parse().unwrap();
        observed.push(start_at);
        client.send_frame(&Frame::ok()).await.unwrap();
    }

    assert_eq!(dispatch.await.unwrap(), 3);
    assert!(observed.iter().all(|at| *at == observed[0]));
    // Two extra clients buy two 20 s slots.
    let expected = before + 2.0 * scheduler::BROADCAST_SLOT_SECONDS;
    assert!(
        (observed[0] - expected).abs() < 5.0,
        "start_at {} should sit near {expected}",
        observed[0]
    );
}

#[tokio::test]
async fn single_client_is_immediate_even_with_wait_start() {
    let harness = start_server(true).await;
    let mut client = register(&harness, "pi1").await;
    await_fleet(&harness, 1).await;

    let state = harness.state.clone();
    let dispatch = tokio::spawn(async move {
        scheduler::start_broadcast(&state, "all", BroadcastParams::for_file("song.wav")).await
    });

    let frame = client.recv_command().await.unwrap();
    assert_eq!(frame.kwarg("start_at"), Some("0"));
    client.send_frame(&Frame::ok()).await.unwrap();
    assert_eq!(dispatch.await.unwrap(), 1);
}

#[tokio::test]
async fn one_failing_target_does_not_block_the_rest() {
    let harness = start_server(false).await;
    let mut ok1 = register(&harness, "pi1").await;
    let mut bad = register(&harness, "pi2").await;
    let mut ok2 = register(&harness, "pi3").await;
    await_fleet(&harness, 3).await;

    let state = harness.state.clone();
    let dispatch = tokio::spawn(async move {
        scheduler::start_broadcast(&state, "all", BroadcastParams::for_file("song.wav")).await
    });

    let frame = ok1.recv_command().await.unwrap();
    assert_eq!(frame.verb, verbs::START);
    ok1.send_frame(&Frame::ok()).await.unwrap();

    let frame = bad.recv_command().await.unwrap();
    assert_eq!(frame.verb, verbs::START);
    bad.send_frame(&Frame::error("File song.wav not found"))
        .await
        .unwrap();

    let frame = ok2.recv_command().await.unwrap();
    assert_eq!(frame.verb, verbs::START);
    ok2.send_frame(&Frame::ok()).await.unwrap();

    assert_eq!(dispatch.await.unwrap(), 2);
}

#[tokio::test]
async fn all_with_zero_clients_is_a_noop() {
    let harness = start_server(true).await;
    let started =
        scheduler::start_broadcast(&harness.state, "all", BroadcastParams::for_file("x.wav")).await;
    assert_eq!(started, 0);
}

#[tokio::test]
async fn stop_fans_out_to_named_targets_only() {
    let harness = start_server(false).await;
    let mut pi1 = register(&harness, "pi1").await;
    let _pi2 = register(&harness, "pi2").await;
    await_fleet(&harness, 2).await;

    let state = harness.state.clone();
    let dispatch =
        tokio::spawn(async move { scheduler::stop_broadcast(&state, "pi1").await });

    let frame = pi1.recv_command().await.unwrap();
    assert_eq!(frame.verb, verbs::STOP);
    pi1.send_frame(&Frame::ok()).await.unwrap();
    assert_eq!(dispatch.await.unwrap(), 1);
}
