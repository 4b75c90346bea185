//! Network-side runtime: services server commands over the control channel
//! and relays playback events back.
//!
//! Broadcast start/stop cross the trampoline to the main thread; everything
//! touching the disk stays constrained to `.wav` basenames inside the
//! single upload directory.

use crate::config::ClientArgs;
use crate::files::TransferClient;
use crate::link::{ConnectError, ControlLink};
use crate::machine::MachineReport;
use crate::trampoline::{LocalEvent, Trampoline};
use bw_backend::{AudioSource, PcmSource, TransmitJob};
use bw_core::paths::sanitize_filename;
use bw_protocol::{verbs, BroadcastParams, Frame};
use chrono::Utc;
use futures_util::StreamExt;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

enum Flow {
    Continue,
    Shutdown,
}

/// Connect, register, and serve commands until kicked, disconnected, or
/// interrupted.  The main loop is always told to shut down on the way out,
/// whatever the reason.
pub async fn run_network(
    args: ClientArgs,
    trampoline: Trampoline,
    local_events: mpsc::UnboundedReceiver<LocalEvent>,
) -> Result<(), ClientError> {
    let result = run_inner(args, trampoline.clone(), local_events).await;
    trampoline.shutdown();
    result
}

async fn run_inner(
    args: ClientArgs,
    trampoline: Trampoline,
    mut local_events: mpsc::UnboundedReceiver<LocalEvent>,
) -> Result<(), ClientError> {
    let machine = MachineReport::collect();
    info!(
        host = args.server_host,
        port = args.port,
        "connecting to server"
    );
    let (link, registration) = ControlLink::connect(
        &args.server_host,
        args.port,
        args.passkey.as_deref(),
        &machine,
    )
    .await?;
    info!(
        client_id = registration.client_id,
        server_version = registration.server_version,
        "successfully registered"
    );

    tokio::fs::create_dir_all(&args.upload_dir).await?;
    let transfers = TransferClient::new()?;
    let mut runtime = Runtime {
        args,
        link,
        transfers,
        trampoline,
    };

    loop {
        tokio::select! {
            frame = runtime.link.next_frame() => match frame {
                Some(Ok(frame)) => {
                    if let Flow::Shutdown = runtime.handle_frame(frame).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    // Unparseable line: answer and keep the channel open.
                    let _ = runtime.link.send(&Frame::error(&e.to_string())).await;
                }
                None => {
                    warn!("server disconnected");
                    break;
                }
            },
            event = local_events.recv() => match event {
                Some(LocalEvent::BroadcastEnded) => {
                    let _ = runtime
                        .link
                        .send(&Frame::new(verbs::BROADCAST_ENDED))
                        .await;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, shutting down");
                break;
            }
        }
    }

    Ok(())
}

struct Runtime {
    args: ClientArgs,
    link: ControlLink,
    transfers: TransferClient,
    trampoline: Trampoline,
}

impl Runtime {
    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        match frame.verb.as_str() {
            verbs::PING => {
                let _ = self.link.send(&Frame::new(verbs::PONG)).await;
            }
            verbs::START => {
                let reply = self.handle_start(&frame).await;
                let _ = self.link.send(&reply).await;
            }
            verbs::STOP => {
                let reply = match self.trampoline.stop().await {
                    Ok(()) => Frame::ok_with("Stopping broadcast"),
                    Err(e) => Frame::error(&e),
                };
                let _ = self.link.send(&reply).await;
            }
            verbs::KICK => {
                let reason = frame.kwarg("reason").unwrap_or("Kicked by administrator");
                warn!(reason, "kicked from server");
                let _ = self.link.send(&Frame::ok()).await;
                return Flow::Shutdown;
            }
            verbs::LIST_FILES => {
                let reply = match bw_core::files::list_wav_files(&self.args.upload_dir) {
                    Ok(files) => {
                        info!(count = files.len(), "listed broadcastable WAV files");
                        Frame::ok().kw("files", bw_protocol::encode_file_list(&files))
                    }
                    Err(e) => Frame::error(&e.to_string()),
                };
                let _ = self.link.send(&reply).await;
            }
            verbs::REMOVE_FILE => {
                let target = frame
                    .kwarg("filename")
                    .or_else(|| frame.positional(0))
                    .unwrap_or_default()
                    .to_owned();
                let reply = if target.is_empty() {
                    Frame::error("Missing filename")
                } else {
                    match bw_core::files::remove_wav(&self.args.upload_dir, &target) {
                        Ok(count) => Frame::ok_with(&format!("Removed {count} WAV file(s)")),
                        Err(e) => Frame::error(&e.to_string()),
                    }
                };
                let _ = self.link.send(&reply).await;
            }
            verbs::DOWNLOAD_URL => {
                let reply = match frame.kwarg("url").or_else(|| frame.positional(0)) {
                    Some(url) => match self
                        .transfers
                        .download_url(url, &self.args.upload_dir)
                        .await
                    {
                        Ok(_) => Frame::ok_with("File downloaded successfully"),
                        Err(e) => Frame::error(&format!("Download error: {e}")),
                    },
                    None => Frame::error("Missing URL"),
                };
                let _ = self.link.send(&reply).await;
            }
            verbs::DOWNLOAD_TOKEN => {
                let reply = self.handle_download_token(&frame).await;
                let _ = self.link.send(&reply).await;
            }
            verbs::UPLOAD_TOKEN => {
                let reply = self.handle_upload_token(&frame).await;
                let _ = self.link.send(&reply).await;
            }
            verbs::STREAM_TOKEN => {
                let reply = self.handle_stream_token(&frame).await;
                let _ = self.link.send(&reply).await;
            }
            other => {
                let _ = self
                    .link
                    .send(&Frame::error(&format!("Unknown command: {other}")))
                    .await;
            }
        }
        Flow::Continue
    }

    async fn handle_start(&mut self, frame: &Frame) -> Frame {
        let params = match BroadcastParams::from_start_frame(frame) {
            Ok(params) => params,
            Err(e) => return Frame::error(&e.to_string()),
        };
        let filename = match sanitize_filename(&params.filename) {
            Ok(name) => name,
            Err(e) => return Frame::error(&e.to_string()),
        };
        let path = self.args.upload_dir.join(&filename);
        if !path.is_file() {
            return Frame::error(&format!("File {filename} not found"));
        }

        let job = TransmitJob {
            frequency: params.frequency,
            ps: params.ps.clone(),
            rt: params.rt.clone(),
            pi: params.pi.clone(),
            loop_play: params.loop_play,
            source: AudioSource::WavFile(path),
        };

        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        if params.start_at > now {
            let delay = params.start_at - now;
            info!("waiting {delay:.2} seconds before starting broadcast");
            let trampoline = self.trampoline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                if let Err(e) = trampoline.start(job, Some(filename)).await {
                    warn!(%e, "scheduled broadcast failed to start");
                }
            });
            return Frame::ok_with(&format!(
                "Broadcast scheduled to start in {delay:.2} seconds"
            ));
        }

        match self.trampoline.start(job, Some(filename)).await {
            Ok(()) => Frame::ok_with("Broadcasting started"),
            Err(e) => Frame::error(&format!("Broadcast error: {e}")),
        }
    }

    async fn handle_download_token(&mut self, frame: &Frame) -> Frame {
        let (Some(token), Some(filename)) = (frame.kwarg("token"), frame.kwarg("filename"))
        else {
            return Frame::error("Missing token or filename");
        };
        let port = frame
            .kwarg("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(bw_protocol::TRANSFER_PORT);
        if !bw_core::files::is_wav(filename) {
            return Frame::error("Only WAV files are supported");
        }
        match self
            .transfers
            .download_token(
                &self.args.server_host,
                port,
                token,
                filename,
                &self.args.upload_dir,
            )
            .await
        {
            Ok(()) => {
                info!(filename, "file received from server");
                Frame::ok_with("File downloaded successfully")
            }
            Err(e) => Frame::error(&format!("Download error: {e}")),
        }
    }

    async fn handle_upload_token(&mut self, frame: &Frame) -> Frame {
        let (Some(token), Some(filename)) = (frame.kwarg("token"), frame.kwarg("filename"))
        else {
            return Frame::error("Missing token or filename");
        };
        let port = frame
            .kwarg("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(bw_protocol::TRANSFER_PORT);
        let name = match sanitize_filename(filename) {
            Ok(name) => name,
            Err(e) => return Frame::error(&e.to_string()),
        };
        let path = self.args.upload_dir.join(&name);
        match self
            .transfers
            .upload_token(&self.args.server_host, port, token, &path)
            .await
        {
            Ok(()) => {
                info!(name, "file pushed to server");
                Frame::ok_with("File uploaded successfully")
            }
            Err(e) => Frame::error(&format!("Upload error: {e}")),
        }
    }

    async fn handle_stream_token(&mut self, frame: &Frame) -> Frame {
        let Some(token) = frame.kwarg("token") else {
            return Frame::error("Missing token");
        };
        let port = frame
            .kwarg("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(bw_protocol::TRANSFER_PORT);

        let (rate, channels, response) = match self
            .transfers
            .open_stream(&self.args.server_host, port, token)
            .await
        {
            Ok(stream) => stream,
            Err(e) => return Frame::error(&format!("Stream error: {e}")),
        };
        info!(rate, channels, "connected to PCM stream");

        let job = TransmitJob {
            frequency: frame
                .kwarg("freq")
                .and_then(|v| v.parse().ok())
                .unwrap_or(90.0),
            ps: frame.kwarg("ps").unwrap_or("BotWave").to_owned(),
            rt: frame.kwarg("rt").unwrap_or("Broadcasting").to_owned(),
            pi: frame.kwarg("pi").unwrap_or("FFFF").to_owned(),
            loop_play: false,
            source: AudioSource::Pcm(Box::new(HttpPcmSource::spawn(rate, channels, response))),
        };
        match self.trampoline.start(job, None).await {
            Ok(()) => Frame::ok_with("Live stream started"),
            Err(e) => Frame::error(&format!("Stream error: {e}")),
        }
    }
}

/// Bridges the async HTTP stream into the blocking [`PcmSource`] contract:
/// a reader task pushes chunks into a bounded channel the feeder thread
/// drains with `blocking_recv`.
pub struct HttpPcmSource {
    rate: u32,
    channels: u16,
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl HttpPcmSource {
    pub fn spawn(rate: u32, channels: u16, response: reqwest::Response) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let item = chunk.map(|bytes| bytes.to_vec()).map_err(io::Error::other);
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        HttpPcmSource { rate, channels, rx }
    }
}

impl PcmSource for HttpPcmSource {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.rx.blocking_recv() {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            // Sender gone: the stream ended.
            None => Ok(None),
        }
    }
}
