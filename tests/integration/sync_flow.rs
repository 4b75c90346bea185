//! Sync engine end-to-end with a scripted client that really moves bytes
//! through the file-transfer endpoint: client → folder pulls land intact,
//! folder → clients pushes clear-then-repopulate.

use bw_core::tlsgen::TlsIdentity;
use bw_protocol::{encode_file_list, verbs, FileEntry, Frame};
use bw_test_utils::MockFleetClient;
use server::dispatch::Dispatcher;
use server::state::{AppState, ServerOptions};
use server::{control, events, sync, transfer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

struct Harness {
    state: AppState,
    addr: SocketAddr,
    transfer_addr: SocketAddr,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

/// Full control-plane harness with the transfer endpoint actually served
/// (plain HTTP on an ephemeral port, advertised to clients).
async fn start_server() -> Harness {
    let upload = tempfile::tempdir().unwrap();
    let handlers = tempfile::tempdir().unwrap();

    let transfer_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let transfer_addr = transfer_listener.local_addr().unwrap();

    let (state, events_rx) = AppState::new(ServerOptions {
        passkey: None,
        upload_dir: upload.path().to_path_buf(),
        handlers_dir: handlers.path().to_path_buf(),
        wait_start: false,
        transfer_port: transfer_addr.port(),
    });
    tokio::spawn(events::run_fleet_events(
        Dispatcher::new(state.clone()),
        events_rx,
    ));

    let router = transfer::router(state.transfer.clone());
    tokio::spawn(async move {
        axum::serve(transfer_listener, router).await.unwrap();
    });

    let identity = TlsIdentity::generate().unwrap();
    let acceptor = TlsAcceptor::from(identity.server_config().unwrap());
    let (addr, _task) = control::start_control(state.clone(), acceptor, "127.0.0.1:0")
        .await
        .unwrap();
    Harness {
        state,
        addr,
        transfer_addr,
        _dirs: (upload, handlers),
    }
}

type FileMap = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// A fleet member whose WAV set lives in memory and whose token transfers
/// go through real HTTP requests against the harness endpoint.
struct SyncingClient {
    files: FileMap,
    removed_all: Arc<Mutex<usize>>,
}

async fn join_fleet(
    harness: &Harness,
    hostname: &str,
    initial: &[(&str, &[u8])],
) -> SyncingClient {
    let mut client = MockFleetClient::connect(harness.addr).await.unwrap();
    client.register_ok(hostname, None).await.unwrap();

    let files: FileMap = Arc::new(Mutex::new(
        initial
            .iter()
            .map(|(name, bytes)| ((*name).to_owned(), bytes.to_vec()))
            .collect(),
    ));
    let removed_all = Arc::new(Mutex::new(0));

    let served_files = Arc::clone(&files);
    let served_removed = Arc::clone(&removed_all);
    let transfer_addr = harness.transfer_addr;
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        while let Some(frame) = client.serve_next().await {
            let reply = match frame.verb.as_str() {
                verbs::LIST_FILES => {
                    let listing: Vec<FileEntry> = served_files
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|(name, bytes)| FileEntry {
                            name: name.clone(),
                            size: bytes.len() as u64,
                            modified: "2026-01-01 00:00:00".to_owned(),
                        })
                        .collect();
                    Frame::ok().kw("files", encode_file_list(&listing))
                }
                verbs::UPLOAD_TOKEN => {
                    let name = frame.kwarg("filename").unwrap_or_default().to_owned();
                    let token = frame.kwarg("token").unwrap_or_default().to_owned();
                    let bytes = served_files.lock().unwrap().get(&name).cloned();
                    match bytes {
                        Some(bytes) => {
                            let url = format!("http://{transfer_addr}/upload/{token}");
                            match http.post(&url).body(bytes).send().await {
                                Ok(resp) if resp.status().is_success() => Frame::ok(),
                                Ok(resp) => Frame::error(&format!("upload got {}", resp.status())),
                                Err(e) => Frame::error(&e.to_string()),
                            }
                        }
                        None => Frame::error(&format!("File {name} not found")),
                    }
                }
                verbs::DOWNLOAD_TOKEN => {
                    let name = frame.kwarg("filename").unwrap_or_default().to_owned();
                    let token = frame.kwarg("token").unwrap_or_default().to_owned();
                    let url = format!("http://{transfer_addr}/download/{token}");
                    match http.get(&url).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            let bytes = resp.bytes().await.unwrap_or_default().to_vec();
                            served_files.lock().unwrap().insert(name, bytes);
                            Frame::ok()
                        }
                        Ok(resp) => Frame::error(&format!("download got {}", resp.status())),
                        Err(e) => Frame::error(&e.to_string()),
                    }
                }
                verbs::REMOVE_FILE => {
                    if frame.kwarg("filename") == Some("all") {
                        let mut files = served_files.lock().unwrap();
                        *served_removed.lock().unwrap() += files.len().max(1);
                        files.clear();
                    }
                    Frame::ok()
                }
                _ => Frame::ok(),
            };
            if client.send_frame(&reply).await.is_err() {
                break;
            }
        }
    });

    // Let the registry converge.
    let id = format!("{hostname}_127.0.0.1");
    for _ in 0..100 {
        if harness.state.registry.get(&id).await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    SyncingClient { files, removed_all }
}

#[tokio::test]
async fn pull_from_client_lands_exact_bytes_under_final_names() {
    let harness = start_server().await;
    let x_bytes = b"RIFFxxxxWAVE-x".repeat(700);
    let y_bytes = b"RIFFyyyyWAVE-y".repeat(300);
    let _pi1 = join_fleet(&harness, "pi1", &[("x.wav", &x_bytes), ("y.wav", &y_bytes)]).await;

    let dest = tempfile::tempdir().unwrap();
    let copied = sync::sync_from_client(&harness.state, dest.path(), "pi1")
        .await
        .unwrap();
    assert_eq!(copied, 2);

    assert_eq!(std::fs::read(dest.path().join("x.wav")).unwrap(), x_bytes);
    assert_eq!(std::fs::read(dest.path().join("y.wav")).unwrap(), y_bytes);

    // No temp leftovers, nothing else.
    let names: Vec<String> = std::fs::read_dir(dest.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| !n.starts_with(".sync_temp_")));

    // The upload root points back at the server staging dir afterwards.
    assert_eq!(
        harness.state.transfer.upload_root().await,
        harness.state.upload_dir
    );
}

#[tokio::test]
async fn push_to_clients_clears_then_repopulates() {
    let harness = start_server().await;
    let pi1 = join_fleet(&harness, "pi1", &[("stale.wav", b"old" as &[u8])]).await;
    let pi2 = join_fleet(&harness, "pi2", &[]).await;

    let src = tempfile::tempdir().unwrap();
    let a_bytes = b"RIFFaaaa".repeat(100);
    let b_bytes = b"RIFFbbbb".repeat(200);
    std::fs::write(src.path().join("a.wav"), &a_bytes).unwrap();
    std::fs::write(src.path().join("b.wav"), &b_bytes).unwrap();

    let pushed = sync::sync_to_clients(&harness.state, "all", src.path())
        .await
        .unwrap();
    assert_eq!(pushed, 2);

    // Clear happened, and the stale file is gone from pi1.
    assert!(*pi1.removed_all.lock().unwrap() > 0);
    for client in [&pi1, &pi2] {
        let files = client.files.lock().unwrap();
        assert_eq!(
            files.keys().cloned().collect::<Vec<_>>(),
            vec!["a.wav", "b.wav"]
        );
        assert_eq!(files["a.wav"], a_bytes);
        assert_eq!(files["b.wav"], b_bytes);
    }
}

#[tokio::test]
async fn pull_with_unknown_source_fails_cleanly() {
    let harness = start_server().await;
    let dest = tempfile::tempdir().unwrap();
    let err = sync::sync_from_client(&harness.state, dest.path(), "ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, sync::SyncError::SourceNotFound(_)));
}

#[tokio::test]
async fn push_with_no_targets_fails_cleanly() {
    let harness = start_server().await;
    let src = tempfile::tempdir().unwrap();
    let err = sync::sync_to_clients(&harness.state, "all", src.path())
        .await
        .unwrap_err();
    assert!(matches!(err, sync::SyncError::NoTargets(_)));
}
