//! Queue engine over a live fleet: availability checks across client file
//! sets, per-client cursors, auto-advance on broadcast-ended, end-of-list
//! behavior, and manual-start suppression.

use bw_core::tlsgen::TlsIdentity;
use bw_protocol::{encode_file_list, verbs, FileEntry, Frame};
use bw_test_utils::MockFleetClient;
use server::dispatch::Dispatcher;
use server::state::{AppState, ServerOptions};
use server::{control, events};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

struct Harness {
    state: AppState,
    dispatcher: Dispatcher,
    addr: SocketAddr,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn start_server() -> Harness {
    let upload = tempfile::tempdir().unwrap();
    let handlers = tempfile::tempdir().unwrap();
    let (state, events_rx) = AppState::new(ServerOptions {
        passkey: None,
        upload_dir: upload.path().to_path_buf(),
        handlers_dir: handlers.path().to_path_buf(),
        wait_start: false,
        transfer_port: 9921,
    });
    let dispatcher = Dispatcher::new(state.clone());
    tokio::spawn(events::run_fleet_events(dispatcher.clone(), events_rx));
    let identity = TlsIdentity::generate().unwrap();
    let acceptor = TlsAcceptor::from(identity.server_config().unwrap());
    let (addr, _task) = control::start_control(state.clone(), acceptor, "127.0.0.1:0")
        .await
        .unwrap();
    Harness {
        state,
        dispatcher,
        addr,
        _dirs: (upload, handlers),
    }
}

fn entries(names: &[&str]) -> Vec<FileEntry> {
    names
        .iter()
        .map(|name| FileEntry {
            name: (*name).to_owned(),
            size: 1024,
            modified: "2026-01-01 00:00:00".to_owned(),
        })
        .collect()
}

/// A scripted fleet member: answers LIST_FILES with a fixed set, records
/// START filenames, acknowledges everything else, and lets the test inject
/// client-originated frames.
struct ServedClient {
    starts: Arc<Mutex<Vec<String>>>,
    inject: mpsc::UnboundedSender<Frame>,
}

impl ServedClient {
    fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    fn report_broadcast_ended(&self) {
        self.inject
            .send(Frame::new(verbs::BROADCAST_ENDED))
            .unwrap();
    }
}

async fn join_fleet(harness: &Harness, hostname: &str, files: &[&str]) -> ServedClient {
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();
    client.register_ok(hostname, None).await.unwrap();

    let listing = entries(files);
    let starts = Arc::new(Mutex::new(Vec::new()));
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<Frame>();
    let recorded = Arc::clone(&starts);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = inject_rx.recv() => match frame {
                    Some(frame) => {
                        if client.send_frame(&frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                frame = client.serve_next() => match frame {
                    Some(frame) => {
                        let reply = match frame.verb.as_str() {
                            verbs::LIST_FILES => {
                                Frame::ok().kw("files", encode_file_list(&listing))
                            }
                            verbs::START => {
                                recorded.lock().unwrap().push(
                                    frame.kwarg("filename").unwrap_or_default().to_owned(),
                                );
                                Frame::ok()
                            }
                            _ => Frame::ok(),
                        };
                        if client.send_frame(&reply).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    // Wait for the registry to pick the session up.
    let id = format!("{hostname}_127.0.0.1");
    for _ in 0..100 {
        if harness.state.registry.get(&id).await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ServedClient {
        starts,
        inject: inject_tx,
    }
}

async fn queue_items(harness: &Harness) -> Vec<String> {
    harness.state.queue.lock().await.items().to_vec()
}

async fn eventually(mut check: impl AsyncFnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held: {what}");
}

#[tokio::test]
async fn add_accepts_files_present_on_every_client() {
    let harness = start_server().await;
    let _pi1 = join_fleet(&harness, "pi1", &["a.wav", "b.wav"]).await;
    let _pi2 = join_fleet(&harness, "pi2", &["a.wav", "b.wav", "extra.wav"]).await;

    harness.dispatcher.execute("queue +a.wav,b.wav").await;
    assert_eq!(queue_items(&harness).await, vec!["a.wav", "b.wav"]);
}

#[tokio::test]
async fn add_rejects_files_missing_on_some_client() {
    let harness = start_server().await;
    let _pi1 = join_fleet(&harness, "pi1", &["a.wav", "b.wav"]).await;
    let _pi2 = join_fleet(&harness, "pi2", &["a.wav"]).await;
    let mut log = harness.state.logfan.subscribe();

    harness.dispatcher.execute("queue +b.wav").await;
    assert!(queue_items(&harness).await.is_empty());

    let mut saw_gap_report = false;
    while let Ok(line) = log.try_recv() {
        if line.contains("not present on all clients") {
            saw_gap_report = true;
        }
    }
    assert!(saw_gap_report);
}

#[tokio::test]
async fn forced_add_skips_the_availability_check() {
    let harness = start_server().await;
    let _pi1 = join_fleet(&harness, "pi1", &["a.wav", "b.wav"]).await;
    let _pi2 = join_fleet(&harness, "pi2", &["a.wav"]).await;

    harness.dispatcher.execute("queue +b.wav!").await;
    assert_eq!(queue_items(&harness).await, vec!["b.wav"]);
}

#[tokio::test]
async fn pattern_adds_expand_against_the_intersection() {
    let harness = start_server().await;
    let _pi1 = join_fleet(&harness, "pi1", &["jazz_1.wav", "jazz_2.wav", "rock.wav"]).await;
    let _pi2 = join_fleet(&harness, "pi2", &["jazz_1.wav", "jazz_2.wav"]).await;

    harness.dispatcher.execute("queue +jazz_*").await;
    assert_eq!(queue_items(&harness).await, vec!["jazz_1.wav", "jazz_2.wav"]);
}

#[tokio::test]
async fn toggle_starts_each_client_at_its_cursor() {
    let harness = start_server().await;
    let pi1 = join_fleet(&harness, "pi1", &["a.wav", "b.wav"]).await;
    let pi2 = join_fleet(&harness, "pi2", &["a.wav", "b.wav"]).await;

    harness.dispatcher.execute("queue +a.wav,b.wav").await;
    harness.dispatcher.execute("queue !").await;

    eventually(
        async || !pi1.starts().is_empty() && !pi2.starts().is_empty(),
        "both clients start the first item",
    )
    .await;
    assert_eq!(pi1.starts(), vec!["a.wav"]);
    assert_eq!(pi2.starts(), vec!["a.wav"]);
    assert!(harness.state.queue.lock().await.is_playing());
}

#[tokio::test]
async fn broadcast_ended_advances_exactly_one_cursor() {
    let harness = start_server().await;
    let pi1 = join_fleet(&harness, "pi1", &["a.wav", "b.wav", "c.wav"]).await;
    let pi2 = join_fleet(&harness, "pi2", &["a.wav", "b.wav", "c.wav"]).await;

    harness.dispatcher.execute("queue +a.wav,b.wav,c.wav").await;
    harness.dispatcher.execute("queue !").await;
    eventually(
        async || pi1.starts().len() == 1 && pi2.starts().len() == 1,
        "initial starts dispatched",
    )
    .await;

    pi1.report_broadcast_ended();
    eventually(async || pi1.starts().len() == 2, "pi1 advances").await;

    assert_eq!(pi1.starts(), vec!["a.wav", "b.wav"]);
    // The other client's cursor is untouched.
    assert_eq!(pi2.starts(), vec!["a.wav"]);
    let queue = harness.state.queue.lock().await;
    assert_eq!(queue.cursor("pi1_127.0.0.1"), 1);
    assert_eq!(queue.cursor("pi2_127.0.0.1"), 0);
}

#[tokio::test]
async fn end_of_queue_without_loop_pauses_and_rewinds() {
    let harness = start_server().await;
    let pi1 = join_fleet(&harness, "pi1", &["a.wav"]).await;

    harness.dispatcher.execute("queue +a.wav").await;
    harness.dispatcher.execute("queue !").await;
    eventually(async || pi1.starts().len() == 1, "first start").await;

    pi1.report_broadcast_ended();
    eventually(
        async || !harness.state.queue.lock().await.is_playing(),
        "queue pauses at end of list",
    )
    .await;
    assert_eq!(harness.state.queue.lock().await.cursor("pi1_127.0.0.1"), 0);
    // No further START went out.
    assert_eq!(pi1.starts(), vec!["a.wav"]);
}

#[tokio::test]
async fn end_of_queue_with_loop_wraps_to_first_item() {
    let harness = start_server().await;
    let pi1 = join_fleet(&harness, "pi1", &["a.wav", "b.wav"]).await;

    harness.dispatcher.execute("queue +a.wav,b.wav").await;
    // Toggle with loop enabled.
    harness.dispatcher.execute("queue !all,,true").await;
    eventually(async || pi1.starts().len() == 1, "first start").await;

    pi1.report_broadcast_ended();
    eventually(async || pi1.starts().len() == 2, "second start").await;
    pi1.report_broadcast_ended();
    eventually(async || pi1.starts().len() == 3, "wrap start").await;

    assert_eq!(pi1.starts(), vec!["a.wav", "b.wav", "a.wav"]);
    assert!(harness.state.queue.lock().await.is_playing());
}

#[tokio::test]
async fn empty_queue_toggle_reports_and_stays_paused() {
    let harness = start_server().await;
    let _pi1 = join_fleet(&harness, "pi1", &["a.wav"]).await;
    let mut log = harness.state.logfan.subscribe();

    harness.dispatcher.execute("queue !").await;
    assert!(!harness.state.queue.lock().await.is_playing());

    let mut saw_empty = false;
    while let Ok(line) = log.try_recv() {
        if line.contains("Queue is empty") {
            saw_empty = true;
        }
    }
    assert!(saw_empty);
}

#[tokio::test]
async fn manual_start_pauses_a_playing_queue() {
    let harness = start_server().await;
    let pi1 = join_fleet(&harness, "pi1", &["a.wav", "b.wav"]).await;

    harness.dispatcher.execute("queue +a.wav,b.wav").await;
    harness.dispatcher.execute("queue !").await;
    eventually(async || pi1.starts().len() == 1, "queue start").await;

    harness.dispatcher.execute("start all b.wav").await;
    assert!(!harness.state.queue.lock().await.is_playing());
    // The manual start itself still reached the client.
    eventually(async || pi1.starts().len() == 2, "manual start").await;
}
