//! Upload-directory bookkeeping and HTTPS transfers against the server's
//! token-gated file endpoint.

use bw_core::paths::{safe_join, sanitize_filename, SecurityError};
use futures_util::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("only WAV files are supported")]
    NotWav,
    #[error("file {0} not found")]
    NotFound(String),
}

pub struct TransferClient {
    http: reqwest::Client,
}

impl TransferClient {
    /// The server's certificate is self-signed and freshly minted each run;
    /// trust it on first use.
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(TransferClient {
            http: reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
        })
    }

    /// Fetch an arbitrary URL into the upload directory.  The destination
    /// name comes from the last URL segment and must be a WAV.
    pub async fn download_url(&self, url: &str, dir: &Path) -> Result<String, TransferError> {
        let name = url.rsplit('/').next().unwrap_or_default();
        if !name.to_lowercase().ends_with(".wav") {
            return Err(TransferError::NotWav);
        }
        let name = sanitize_filename(name)?;
        self.fetch_to(url, &dir.join(&name)).await?;
        info!(name, "file downloaded");
        Ok(name)
    }

    /// Fetch from the server's token endpoint into the upload directory.
    pub async fn download_token(
        &self,
        host: &str,
        port: u16,
        token: &str,
        filename: &str,
        dir: &Path,
    ) -> Result<(), TransferError> {
        let dest = safe_join(dir, filename)?;
        let url = format!("https://{host}:{port}/download/{token}");
        self.fetch_to(&url, &dest).await
    }

    /// Push a local file to the server's token endpoint.
    pub async fn upload_token(
        &self,
        host: &str,
        port: u16,
        token: &str,
        path: &Path,
    ) -> Result<(), TransferError> {
        if !path.is_file() {
            return Err(TransferError::NotFound(path.display().to_string()));
        }
        let file = tokio::fs::File::open(path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let url = format!("https://{host}:{port}/upload/{token}");
        let response = self.http.post(&url).body(body).send().await?;
        check_status(response).await?;
        Ok(())
    }

    /// Open a live PCM stream.  Returns the advertised sample rate and
    /// channel count together with the raw response.
    pub async fn open_stream(
        &self,
        host: &str,
        port: u16,
        token: &str,
    ) -> Result<(u32, u16, reqwest::Response), TransferError> {
        let url = format!("https://{host}:{port}/stream/{token}");
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let rate = header_number(&response, "X-Sample-Rate").unwrap_or(48_000);
        let channels = header_number(&response, "X-Channels").unwrap_or(2) as u16;
        Ok((rate, channels, response))
    }

    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<(), TransferError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

fn header_number(response: &reqwest::Response, name: &str) -> Option<u32> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

async fn check_status(response: reqwest::Response) -> Result<(), TransferError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(status_error(response).await)
    }
}

async fn status_error(response: reqwest::Response) -> TransferError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    TransferError::Status { status, body }
}
