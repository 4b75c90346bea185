//! Remote-shell port: an authenticated WebSocket that feeds text commands
//! into the console dispatcher and tails the operator log back out.
//!
//! First client frame must be `{"type":"auth","passkey":"…"}` within 5 s.
//! A denylist keeps remote operators from killing the server (`exit`) or
//! reaching the host shell (`<`).

use crate::session::FleetEvent;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bw_core::LogFan;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::debug;

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Commands a remote shell may not run.
pub const BLOCKED_COMMANDS: [&str; 2] = ["exit", "<"];

#[derive(Debug, Deserialize)]
struct AuthRequest {
    #[serde(rename = "type")]
    kind: String,
    passkey: Option<String>,
}

#[derive(Debug, Serialize)]
struct AuthReply<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    message: &'a str,
}

#[derive(Clone)]
struct ShellState {
    passkey: Option<String>,
    logfan: LogFan,
    commands_tx: mpsc::Sender<String>,
    events_tx: mpsc::Sender<FleetEvent>,
}

/// Bind the WebSocket command port.  Returns the bound address and the serve
/// task.
pub async fn start_shell(
    app: &AppState,
    commands_tx: mpsc::Sender<String>,
    bind: &str,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let state = ShellState {
        passkey: app.passkey.clone(),
        logfan: app.logfan.clone(),
        commands_tx,
        events_tx: app.events_tx.clone(),
    };
    let router = Router::new().route("/", get(ws_handler)).with_state(state);
    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(%e, "shell port serve error");
        }
    });
    Ok((addr, task))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ShellState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: ShellState, mut socket: WebSocket) {
    if !authenticate(&state, &mut socket).await {
        let _ = socket.close().await;
        return;
    }

    // Subscribe before announcing the join so this client sees every line
    // its own join handlers produce.
    let mut log_rx = state.logfan.subscribe();
    state.logfan.info("Remote shell client joined");
    let _ = state.events_tx.send(FleetEvent::WsJoined).await;

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    inject_command(&state, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%e, "shell socket error");
                    break;
                }
            },
            line = log_rx.recv() => match line {
                Ok(line) => {
                    if socket.send(Message::Text(line.into())).await.is_err() {
                        break;
                    }
                }
                // A slow subscriber just misses the overwritten lines.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.logfan.info("Remote shell client left");
    let _ = state.events_tx.send(FleetEvent::WsLeft).await;
}

async fn authenticate(state: &ShellState, socket: &mut WebSocket) -> bool {
    let first = match tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => return false,
        Err(_) => {
            let _ = send_json(
                socket,
                &AuthReply {
                    kind: "error",
                    message: "Authentication timeout",
                },
            )
            .await;
            return false;
        }
    };

    let auth: AuthRequest = match serde_json::from_str(first.as_str()) {
        Ok(auth) => auth,
        Err(_) => {
            let _ = send_json(
                socket,
                &AuthReply {
                    kind: "error",
                    message: "Invalid JSON",
                },
            )
            .await;
            return false;
        }
    };

    let authorized = auth.kind == "auth"
        && state
            .passkey
            .as_ref()
            .is_none_or(|expected| auth.passkey.as_deref() == Some(expected.as_str()));
    if !authorized {
        let _ = send_json(
            socket,
            &AuthReply {
                kind: "auth_failed",
                message: "Invalid passkey",
            },
        )
        .await;
        return false;
    }

    send_json(
        socket,
        &AuthReply {
            kind: "auth_ok",
            message: "Authenticated",
        },
    )
    .await
}

async fn send_json(socket: &mut WebSocket, reply: &AuthReply<'_>) -> bool {
    match serde_json::to_string(reply) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn inject_command(state: &ShellState, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return;
    }
    let head = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if BLOCKED_COMMANDS.contains(&head.as_str()) {
        state.logfan.warn("Hmmm, you can't do that. ;)");
        return;
    }
    state.logfan.info(format!("WebSocket CMD: {trimmed}"));
    let _ = state.commands_tx.send(trimmed.to_owned()).await;
}
