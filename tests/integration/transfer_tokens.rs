//! File-transfer endpoint contract: single-use tokens, size validation,
//! download headers, and the PCM stream surface.  Served plain HTTP here;
//! the routing and token logic are identical under the TLS binding.

use bw_backend::capture::SilenceSource;
use server::transfer::{self, TransferService};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn serve(upload_dir: std::path::PathBuf) -> (Arc<TransferService>, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = TransferService::new(upload_dir, addr.port());
    let router = transfer::router(service.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (service, addr)
}

#[tokio::test]
async fn upload_writes_file_and_consumes_token() {
    let dir = tempfile::tempdir().unwrap();
    let (service, addr) = serve(dir.path().to_path_buf()).await;

    let body = vec![0x42_u8; 2048];
    let token = service.mint_upload("song.wav", body.len() as u64).await.unwrap();
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{addr}/upload/{token}"))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(std::fs::read(dir.path().join("song.wav")).unwrap(), body);

    // Second use of the same token is gone.
    let response = http
        .post(format!("http://{addr}/upload/{token}"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn size_mismatch_deletes_partial_and_returns_400() {
    let dir = tempfile::tempdir().unwrap();
    let (service, addr) = serve(dir.path().to_path_buf()).await;

    let token = service.mint_upload("song.wav", 100).await.unwrap();
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/upload/{token}"))
        .body(vec![1_u8; 50])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(response.text().await.unwrap().contains("Size mismatch"));
    assert!(!dir.path().join("song.wav").exists());
}

#[tokio::test]
async fn zero_expected_size_skips_validation() {
    let dir = tempfile::tempdir().unwrap();
    let (service, addr) = serve(dir.path().to_path_buf()).await;

    let token = service.mint_upload("any.wav", 0).await.unwrap();
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/upload/{token}"))
        .body(vec![7_u8; 13])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(std::fs::read(dir.path().join("any.wav")).unwrap().len(), 13);
}

#[tokio::test]
async fn download_sets_headers_and_streams_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let (service, addr) = serve(dir.path().to_path_buf()).await;

    let content = b"RIFF....WAVEdata".repeat(512);
    let path = dir.path().join("tune.wav");
    std::fs::write(&path, &content).unwrap();
    let token = service.mint_download(path).await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/download/{token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "application/octet-stream"
    );
    assert_eq!(
        response
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap(),
        "attachment; filename=\"tune.wav\""
    );
    assert_eq!(
        response
            .headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap(),
        content.len().to_string()
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), content);

    // Token consumed.
    let response = reqwest::Client::new()
        .get(format!("http://{addr}/download/{token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn download_of_missing_file_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let (service, addr) = serve(dir.path().to_path_buf()).await;

    let token = service.mint_download(dir.path().join("ghost.wav")).await;
    let response = reqwest::get(format!("http://{addr}/download/{token}"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn pcm_stream_advertises_format_and_ends_at_eof() {
    let dir = tempfile::tempdir().unwrap();
    let (service, addr) = serve(dir.path().to_path_buf()).await;

    let token = service
        .mint_stream(Box::new(SilenceSource::new(4, 1024)), 48_000, 2)
        .await;
    let response = reqwest::get(format!("http://{addr}/stream/{token}"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert_eq!(headers.get("content-type").unwrap(), "audio/pcm");
    assert_eq!(headers.get("x-sample-rate").unwrap(), "48000");
    assert_eq!(headers.get("x-channels").unwrap(), "2");
    assert_eq!(headers.get("x-sample-format").unwrap(), "S16_LE");

    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 4 * 1024);
    assert!(body.iter().all(|b| *b == 0));
}

#[tokio::test]
async fn expired_token_is_403() {
    let dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service =
        TransferService::with_lifetime(dir.path().to_path_buf(), addr.port(), Duration::ZERO);
    let router = transfer::router(service.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let token = service.mint_upload("late.wav", 0).await.unwrap();
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/upload/{token}"))
        .body(vec![0_u8; 8])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}
