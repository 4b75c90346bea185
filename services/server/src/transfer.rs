//! Out-of-band file transfer endpoint.
//!
//! A separate HTTPS listener (own port, same generated certificate) serving
//! three token-gated routes:
//!
//! - `POST /upload/{token}`   raw body streamed to the upload root
//! - `GET  /download/{token}` streams a bound filepath
//! - `GET  /stream/{token}`   live PCM feed from a bound source
//!
//! Tokens are opaque 128-bit ids, single-use, and expire 300 s after minting
//! (a sweeper clears the leftovers every 300 s).  Bulk bytes never touch the
//! control channel.

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bw_backend::PcmSource;
use bw_core::paths::{sanitize_filename, SecurityError};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TOKEN_LIFETIME: Duration = Duration::from_secs(300);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Per-chunk flush granularity for uploads and downloads.
pub const CHUNK_SIZE: usize = 65536;

struct UploadGrant {
    filename: String,
    expected_size: u64,
    expires: Instant,
}

struct DownloadGrant {
    path: PathBuf,
    expires: Instant,
}

struct StreamGrant {
    source: Box<dyn PcmSource + Send>,
    rate: u32,
    channels: u16,
    expires: Instant,
}

#[derive(Default)]
struct Tokens {
    upload: HashMap<String, UploadGrant>,
    download: HashMap<String, DownloadGrant>,
    stream: HashMap<String, StreamGrant>,
}

enum Lookup<T> {
    Found(T),
    Expired,
    Missing,
}

pub struct TransferService {
    tokens: Mutex<Tokens>,
    upload_root: RwLock<PathBuf>,
    lifetime: Duration,
    /// Port advertised to clients in `*_TOKEN` frames.
    port: u16,
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

impl TransferService {
    pub fn new(upload_root: PathBuf, port: u16) -> Arc<Self> {
        Self::with_lifetime(upload_root, port, TOKEN_LIFETIME)
    }

    pub fn with_lifetime(upload_root: PathBuf, port: u16, lifetime: Duration) -> Arc<Self> {
        Arc::new(TransferService {
            tokens: Mutex::new(Tokens::default()),
            upload_root: RwLock::new(upload_root),
            lifetime,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn upload_root(&self) -> PathBuf {
        self.upload_root.read().await.clone()
    }

    /// Redirect where uploads land (the sync engine points this at the
    /// destination folder for the duration of a pull).
    pub async fn set_upload_root(&self, root: PathBuf) {
        *self.upload_root.write().await = root;
    }

    /// Mint an upload token.  `expected_size` of 0 skips size validation.
    pub async fn mint_upload(
        &self,
        filename: &str,
        expected_size: u64,
    ) -> Result<String, SecurityError> {
        let filename = sanitize_filename(filename)?;
        let token = new_token();
        self.tokens.lock().await.upload.insert(
            token.clone(),
            UploadGrant {
                filename,
                expected_size,
                expires: Instant::now() + self.lifetime,
            },
        );
        Ok(token)
    }

    pub async fn mint_download(&self, path: PathBuf) -> String {
        let token = new_token();
        self.tokens.lock().await.download.insert(
            token.clone(),
            DownloadGrant {
                path,
                expires: Instant::now() + self.lifetime,
            },
        );
        token
    }

    pub async fn mint_stream(
        &self,
        source: Box<dyn PcmSource + Send>,
        rate: u32,
        channels: u16,
    ) -> String {
        let token = new_token();
        self.tokens.lock().await.stream.insert(
            token.clone(),
            StreamGrant {
                source,
                rate,
                channels,
                expires: Instant::now() + self.lifetime,
            },
        );
        token
    }

    /// Drop every expired token.  Runs on the sweep timer.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut tokens = self.tokens.lock().await;
        tokens.upload.retain(|_, g| g.expires > now);
        tokens.download.retain(|_, g| g.expires > now);
        tokens.stream.retain(|_, g| g.expires > now);
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                service.sweep().await;
            }
        });
    }

    async fn take_upload(&self, token: &str) -> Lookup<UploadGrant> {
        let mut tokens = self.tokens.lock().await;
        match tokens.upload.remove(token) {
            Some(grant) if grant.expires > Instant::now() => Lookup::Found(grant),
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        }
    }

    async fn take_download(&self, token: &str) -> Lookup<DownloadGrant> {
        let mut tokens = self.tokens.lock().await;
        match tokens.download.remove(token) {
            Some(grant) if grant.expires > Instant::now() => Lookup::Found(grant),
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        }
    }

    async fn take_stream(&self, token: &str) -> Lookup<StreamGrant> {
        let mut tokens = self.tokens.lock().await;
        match tokens.stream.remove(token) {
            Some(grant) if grant.expires > Instant::now() => Lookup::Found(grant),
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        }
    }
}

pub fn router(service: Arc<TransferService>) -> Router {
    Router::new()
        .route("/upload/{token}", post(handle_upload))
        .route("/download/{token}", get(handle_download))
        .route("/stream/{token}", get(handle_stream))
        .with_state(service)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_upload(
    State(service): State<Arc<TransferService>>,
    UrlPath(token): UrlPath<String>,
    body: Body,
) -> Response {
    let grant = match service.take_upload(&token).await {
        Lookup::Found(grant) => grant,
        Lookup::Expired => return (StatusCode::FORBIDDEN, "Token expired").into_response(),
        Lookup::Missing => return (StatusCode::NOT_FOUND, "Invalid token").into_response(),
    };

    let dest = service.upload_root.read().await.join(&grant.filename);
    match write_body(&dest, body).await {
        Ok(received) => {
            if grant.expected_size > 0 && received != grant.expected_size {
                let _ = tokio::fs::remove_file(&dest).await;
                warn!(
                    filename = grant.filename,
                    expected = grant.expected_size,
                    received,
                    "upload size mismatch"
                );
                return (
                    StatusCode::BAD_REQUEST,
                    format!(
                        "Size mismatch: expected {}, got {received}",
                        grant.expected_size
                    ),
                )
                    .into_response();
            }
            info!(filename = grant.filename, bytes = received, "upload complete");
            (StatusCode::OK, "Upload successful").into_response()
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&dest).await;
            warn!(filename = grant.filename, %e, "upload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Upload error: {e}"),
            )
                .into_response()
        }
    }
}

/// Stream the request body to disk, flushing chunk by chunk so a reader
/// polling the file sees steady growth.
async fn write_body(dest: &std::path::Path, body: Body) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut received: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(io::Error::other)?;
        file.write_all(&chunk).await?;
        file.flush().await?;
        received += chunk.len() as u64;
    }
    Ok(received)
}

async fn handle_download(
    State(service): State<Arc<TransferService>>,
    UrlPath(token): UrlPath<String>,
) -> Response {
    let grant = match service.take_download(&token).await {
        Lookup::Found(grant) => grant,
        Lookup::Expired => return (StatusCode::FORBIDDEN, "Token expired").into_response(),
        Lookup::Missing => {
            return (StatusCode::NOT_FOUND, "Invalid or expired token").into_response();
        }
    };

    let file = match tokio::fs::File::open(&grant.path).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "File not found").into_response(),
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Download error: {e}"),
            )
                .into_response();
        }
    };
    let filename = grant
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    debug!(filename, size, "serving download");
    let stream = ReaderStream::with_capacity(file, CHUNK_SIZE);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_stream(
    State(service): State<Arc<TransferService>>,
    UrlPath(token): UrlPath<String>,
) -> Response {
    let grant = match service.take_stream(&token).await {
        Lookup::Found(grant) => grant,
        Lookup::Expired => return (StatusCode::FORBIDDEN, "Token expired").into_response(),
        Lookup::Missing => return (StatusCode::NOT_FOUND, "Invalid token").into_response(),
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(8);
    let mut source = grant.source;
    // The source may block (ALSA period reads); keep it off the event loop.
    tokio::task::spawn_blocking(move || loop {
        match source.next_chunk() {
            Ok(Some(chunk)) => {
                if tx.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                    debug!("pcm stream consumer disconnected");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/pcm")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Sample-Rate", grant.rate)
        .header("X-Channels", grant.channels)
        .header("X-Sample-Format", "S16_LE")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
