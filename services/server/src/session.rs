//! Per-client session actor.
//!
//! Each connected client gets one actor that exclusively owns the TLS
//! stream; everything else talks to it through a [`SessionHandle`].  Writes
//! are therefore serialized per session, and responses are matched to
//! pending commands in FIFO order (file listings form their own FIFO lane,
//! keyed by the `files=` keyword on the reply).
//!
//! The actor pings every 30 s; two consecutive missed pongs, or any I/O
//! error, end the session.  Pings are suppressed while a bulk transfer is
//! flagged on the session.

use crate::registry::ClientInfo;
use bw_protocol::{verbs, FileEntry, Frame, ProtocolError};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const FILE_LIST_TIMEOUT: Duration = Duration::from_secs(30);
/// Missed pongs tolerated before the session is declared dead.
pub const MAX_MISSED_PONGS: u32 = 2;
/// Upper bound on one control-channel line (file listings included).
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

static SESSION_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("command timed out")]
    Timeout,
    #[error("peer error: {0}")]
    Remote(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Which pending-response lane a command waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Plain `OK` / `ERROR`.
    Simple,
    /// Reply carrying a `files=` listing.
    Files,
}

pub enum SessionOp {
    Command {
        frame: Frame,
        kind: ReplyKind,
        reply: oneshot::Sender<Frame>,
    },
    Kick { reason: String },
    /// Silent close used when a reconnect evicts this session.
    Close,
    SetUploading(bool),
}

/// Fleet-level notifications consumed by the server's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    Connected { client_id: String },
    Disconnected { client_id: String, serial: u64 },
    BroadcastEnded { client_id: String },
    WsJoined,
    WsLeft,
}

#[derive(Clone)]
pub struct SessionHandle {
    serial: u64,
    ops: mpsc::Sender<SessionOp>,
}

impl SessionHandle {
    pub fn new() -> (Self, mpsc::Receiver<SessionOp>) {
        let (tx, rx) = mpsc::channel(32);
        (
            SessionHandle {
                serial: SESSION_SERIAL.fetch_add(1, Ordering::Relaxed),
                ops: tx,
            },
            rx,
        )
    }

    /// Handle without a live actor behind it; for registry-level tests.
    pub fn detached() -> (Self, mpsc::Receiver<SessionOp>) {
        SessionHandle::new()
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Send a command and wait for its `OK`/`ERROR` reply (30 s).
    pub async fn command(&self, frame: Frame) -> Result<Frame, SessionError> {
        self.command_timeout(frame, ReplyKind::Simple, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    pub async fn command_timeout(
        &self,
        frame: Frame,
        kind: ReplyKind,
        timeout: Duration,
    ) -> Result<Frame, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(SessionOp::Command {
                frame,
                kind,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Ask the client for its WAV listing.
    pub async fn request_file_list(
        &self,
        timeout: Duration,
    ) -> Result<Vec<FileEntry>, SessionError> {
        let reply = self
            .command_timeout(Frame::new(verbs::LIST_FILES), ReplyKind::Files, timeout)
            .await?;
        if !reply.is_ok() {
            return Err(SessionError::Remote(reply.message().to_owned()));
        }
        Ok(bw_protocol::decode_file_list(
            reply.require_kwarg("files")?,
        )?)
    }

    pub async fn kick(&self, reason: &str) {
        let _ = self
            .ops
            .send(SessionOp::Kick {
                reason: reason.to_owned(),
            })
            .await;
    }

    pub async fn close(&self) {
        let _ = self.ops.send(SessionOp::Close).await;
    }

    pub async fn set_uploading(&self, uploading: bool) {
        let _ = self.ops.send(SessionOp::SetUploading(uploading)).await;
    }
}

struct Pending {
    kind: ReplyKind,
    reply: oneshot::Sender<Frame>,
}

/// Runs one connected session to completion; emits `Disconnected` on exit.
pub struct SessionActor<S> {
    info: ClientInfo,
    serial: u64,
    framed: Framed<S, LinesCodec>,
    ops: mpsc::Receiver<SessionOp>,
    events: mpsc::Sender<FleetEvent>,
    pending: VecDeque<Pending>,
    uploading: bool,
    awaiting_pongs: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SessionActor<S> {
    pub fn new(
        info: ClientInfo,
        serial: u64,
        framed: Framed<S, LinesCodec>,
        ops: mpsc::Receiver<SessionOp>,
        events: mpsc::Sender<FleetEvent>,
    ) -> Self {
        SessionActor {
            info,
            serial,
            framed,
            ops,
            events,
            pending: VecDeque::new(),
            uploading: false,
            awaiting_pongs: 0,
        }
    }

    pub async fn run(mut self) {
        let client_id = self.info.client_id.clone();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval's first tick fires immediately; burn it.
        ping.tick().await;

        loop {
            tokio::select! {
                line = self.framed.next() => match line {
                    Some(Ok(line)) => {
                        if !self.handle_line(&line).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(client_id, %e, "control channel read error");
                        break;
                    }
                    None => {
                        debug!(client_id, "control channel closed by peer");
                        break;
                    }
                },
                op = self.ops.recv() => match op {
                    Some(op) => {
                        if !self.handle_op(op).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if self.uploading {
                        continue;
                    }
                    if self.awaiting_pongs >= MAX_MISSED_PONGS {
                        warn!(client_id, "keep-alive lapsed, dropping session");
                        break;
                    }
                    if self.framed.send(Frame::new(verbs::PING).encode()).await.is_err() {
                        break;
                    }
                    self.awaiting_pongs += 1;
                }
            }
        }

        let _ = self
            .events
            .send(FleetEvent::Disconnected {
                client_id,
                serial: self.serial,
            })
            .await;
    }

    /// Returns false when the session must end.
    async fn handle_line(&mut self, line: &str) -> bool {
        let frame = match Frame::parse(line) {
            Ok(frame) => frame,
            Err(ProtocolError::Empty) => return true,
            Err(e) => {
                // Syntax trouble is answered, never fatal.
                return self
                    .framed
                    .send(Frame::error(&e.to_string()).encode())
                    .await
                    .is_ok();
            }
        };
        self.info.touch();

        match frame.verb.as_str() {
            verbs::PONG => {
                self.awaiting_pongs = 0;
            }
            verbs::PING => {
                return self
                    .framed
                    .send(Frame::new(verbs::PONG).encode())
                    .await
                    .is_ok();
            }
            verbs::BROADCAST_ENDED => {
                let _ = self
                    .events
                    .send(FleetEvent::BroadcastEnded {
                        client_id: self.info.client_id.clone(),
                    })
                    .await;
            }
            v if v == verbs::OK || v == verbs::ERROR => {
                self.complete_pending(frame);
            }
            other => {
                debug!(client_id = self.info.client_id, verb = other, "unexpected frame from client");
            }
        }
        true
    }

    fn complete_pending(&mut self, frame: Frame) {
        let kind = if frame.kwarg("files").is_some() {
            ReplyKind::Files
        } else {
            ReplyKind::Simple
        };
        let matched = self
            .pending
            .iter()
            .position(|p| p.kind == kind)
            .and_then(|idx| self.pending.remove(idx));
        match matched {
            Some(pending) => {
                // A dropped receiver means the caller timed out; the reply is
                // consumed either way so later responses stay aligned.
                let _ = pending.reply.send(frame);
            }
            None => {
                debug!(
                    client_id = self.info.client_id,
                    frame = %frame,
                    "stray reply with no pending command"
                );
            }
        }
    }

    async fn handle_op(&mut self, op: SessionOp) -> bool {
        match op {
            SessionOp::Command { frame, kind, reply } => {
                if self.framed.send(frame.encode()).await.is_err() {
                    return false;
                }
                self.pending.push_back(Pending { kind, reply });
                true
            }
            SessionOp::Kick { reason } => {
                let _ = self
                    .framed
                    .send(Frame::new(verbs::KICK).kw("reason", reason).encode())
                    .await;
                false
            }
            SessionOp::Close => false,
            SessionOp::SetUploading(uploading) => {
                self.uploading = uploading;
                true
            }
        }
    }
}
