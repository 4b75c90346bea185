//! Main-thread trampoline for the transmitter backend.
//!
//! The backend may only be driven from the process main thread, so the
//! network task posts requests onto a channel and blocks (with a timeout)
//! on the per-request reply.  The main loop consumes requests, drives the
//! backend, polls playback at 1 Hz, and reports end-of-track back to the
//! network side for queue auto-advance.

use bw_backend::{AudioSource, TransmitJob, Transmitter};
use bw_core::handlers::{self, events, ReentryGuard};
use bw_protocol::split_tokens;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// How long the network side waits for the main thread to act.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LOOP_TICK: Duration = Duration::from_millis(100);
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

type Reply = oneshot::Sender<Result<(), String>>;

pub enum MainCommand {
    Start {
        job: TransmitJob,
        filename: Option<String>,
        reply: Reply,
    },
    Stop {
        reply: Reply,
    },
    Shutdown,
}

/// Playback notifications flowing back to the network task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEvent {
    BroadcastEnded,
}

/// Cheap clonable sender used from async context.
#[derive(Clone)]
pub struct Trampoline {
    tx: std_mpsc::Sender<MainCommand>,
}

impl Trampoline {
    pub fn channel() -> (Self, std_mpsc::Receiver<MainCommand>) {
        let (tx, rx) = std_mpsc::channel();
        (Trampoline { tx }, rx)
    }

    pub async fn start(&self, job: TransmitJob, filename: Option<String>) -> Result<(), String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MainCommand::Start {
                job,
                filename,
                reply: reply_tx,
            })
            .map_err(|_| "main loop gone".to_owned())?;
        await_reply(reply_rx).await
    }

    pub async fn stop(&self) -> Result<(), String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MainCommand::Stop { reply: reply_tx })
            .map_err(|_| "main loop gone".to_owned())?;
        await_reply(reply_rx).await
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(MainCommand::Shutdown);
    }
}

async fn await_reply(rx: oneshot::Receiver<Result<(), String>>) -> Result<(), String> {
    match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("main loop dropped the request".to_owned()),
        Err(_) => Err("command timeout".to_owned()),
    }
}

/// The loop that owns the transmitter.  Runs on the real main thread and
/// returns when told to shut down (or when every sender is gone).
pub struct MainLoop {
    transmitter: Box<dyn Transmitter>,
    rx: std_mpsc::Receiver<MainCommand>,
    events: mpsc::UnboundedSender<LocalEvent>,
    upload_dir: PathBuf,
    handlers_dir: PathBuf,
    reentry: ReentryGuard,
    broadcasting: bool,
    current_file: Option<String>,
    last_monitor: Instant,
}

impl MainLoop {
    pub fn new(
        transmitter: Box<dyn Transmitter>,
        rx: std_mpsc::Receiver<MainCommand>,
        events: mpsc::UnboundedSender<LocalEvent>,
        upload_dir: PathBuf,
        handlers_dir: PathBuf,
    ) -> Self {
        MainLoop {
            transmitter,
            rx,
            events,
            upload_dir,
            handlers_dir,
            reentry: ReentryGuard::new(),
            broadcasting: false,
            current_file: None,
            last_monitor: Instant::now(),
        }
    }

    pub fn run(mut self) {
        self.run_handlers(events::LOCAL_READY);
        loop {
            match self.rx.recv_timeout(LOOP_TICK) {
                Ok(MainCommand::Start {
                    job,
                    filename,
                    reply,
                }) => {
                    let result = self.start(job, filename);
                    let _ = reply.send(result);
                }
                Ok(MainCommand::Stop { reply }) => {
                    let result = self.stop();
                    let _ = reply.send(result);
                }
                Ok(MainCommand::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            }
            self.poll_monitor();
        }
        if self.broadcasting {
            let _ = self.transmitter.stop();
        }
    }

    fn start(&mut self, job: TransmitJob, filename: Option<String>) -> Result<(), String> {
        if self.broadcasting {
            // One transmitter per client; the active job yields first.
            self.transmitter.stop().map_err(|e| e.to_string())?;
            self.broadcasting = false;
        }
        self.transmitter.start(job).map_err(|e| e.to_string())?;
        self.broadcasting = true;
        self.current_file = filename.clone();
        if let Some(name) = filename {
            info!(name, "broadcast started");
        } else {
            info!("live broadcast started");
        }
        self.run_handlers(events::LOCAL_START);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        if !self.broadcasting {
            return Err("No broadcast running".to_owned());
        }
        self.transmitter.stop().map_err(|e| e.to_string())?;
        self.broadcasting = false;
        self.current_file = None;
        info!("broadcast stopped");
        self.run_handlers(events::LOCAL_STOP);
        Ok(())
    }

    /// 1 Hz playback monitor; an active-to-idle transition means the track
    /// finished on its own.
    fn poll_monitor(&mut self) {
        if self.last_monitor.elapsed() < MONITOR_INTERVAL {
            return;
        }
        self.last_monitor = Instant::now();
        if self.broadcasting && !self.transmitter.status().is_playing {
            info!("playback finished");
            self.broadcasting = false;
            self.current_file = None;
            let _ = self.events.send(LocalEvent::BroadcastEnded);
            self.run_handlers(events::LOCAL_STOP);
        }
    }

    fn run_handlers(&mut self, prefix: &str) {
        let Some(_token) = self.reentry.enter(prefix) else {
            return;
        };
        for script in handlers::scan(&self.handlers_dir, prefix) {
            if !script.silent {
                info!(path = %script.path.display(), "running handler");
            }
            for line in script.lines.clone() {
                if !script.silent {
                    info!(line, "executing handler command");
                }
                self.execute_local(&line);
            }
        }
    }

    /// Tiny local command surface for handler scripts: everything runs on
    /// the main thread against the transmitter directly.
    fn execute_local(&mut self, line: &str) {
        let tokens = match split_tokens(line) {
            Ok(tokens) => tokens,
            Err(e) => {
                error!(%e, line, "bad handler command");
                return;
            }
        };
        let Some(cmd) = tokens.first() else {
            return;
        };
        match cmd.to_lowercase().as_str() {
            "start" => {
                let Some(filename) = tokens.get(1) else {
                    error!("Usage: start <file> [freq] [loop] [ps] [rt] [pi]");
                    return;
                };
                let path = self.upload_dir.join(filename);
                if !path.is_file() {
                    error!(filename, "file not found");
                    return;
                }
                let job = TransmitJob {
                    frequency: tokens
                        .get(2)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(90.0),
                    loop_play: tokens.get(3).is_some_and(|v| v.eq_ignore_ascii_case("true")),
                    ps: tokens.get(4).cloned().unwrap_or_else(|| "BotWave".to_owned()),
                    rt: tokens.get(5).cloned().unwrap_or_else(|| filename.clone()),
                    pi: tokens.get(6).cloned().unwrap_or_else(|| "FFFF".to_owned()),
                    source: AudioSource::WavFile(path),
                };
                if let Err(e) = self.start(job, Some(filename.clone())) {
                    error!(%e, "handler start failed");
                }
            }
            "stop" => {
                if let Err(e) = self.stop() {
                    warn!(%e, "handler stop failed");
                }
            }
            "rm" => {
                let Some(target) = tokens.get(1) else {
                    error!("Usage: rm <filename|all>");
                    return;
                };
                match bw_core::files::remove_wav(&self.upload_dir, target) {
                    Ok(count) => info!(count, "removed WAV file(s)"),
                    Err(e) => error!(%e, "remove failed"),
                }
            }
            "list" => match bw_core::files::list_wav_files(&self.upload_dir) {
                Ok(files) => {
                    for file in files {
                        info!("  {} ({} bytes)", file.name, file.size);
                    }
                }
                Err(e) => error!(%e, "listing failed"),
            },
            other => error!(command = other, "unknown handler command"),
        }
    }
}
