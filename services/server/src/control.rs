//! Control-channel listener and registration handshake.
//!
//! One TLS connection per client.  The server walks the three-phase
//! handshake (`REGISTER` → `AUTH` when a passkey is configured → `VER`)
//! under a 5 s deadline, answers `REGISTER_OK` with the assigned client id,
//! and hands the stream to a session actor.  Rejections (`AUTH_FAILED`,
//! `VERSION_MISMATCH`) are terminal for the connection, never for the
//! server.

use crate::registry::{ClientInfo, MachineInfo, RegisteredClient};
use crate::session::{FleetEvent, SessionActor, SessionHandle, MAX_LINE_LENGTH};
use crate::state::AppState;
use bw_protocol::{verbs, Frame, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type LineStream = Framed<TlsStream<TcpStream>, LinesCodec>;

/// Bind the control listener and serve it until the task is aborted.
/// Returns the bound address and the accept-loop task.
pub async fn start_control(
    state: AppState,
    acceptor: TlsAcceptor,
    bind: &str,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(accept_loop(state, listener, acceptor));
    Ok((addr, task))
}

async fn accept_loop(state: AppState, listener: TcpListener, acceptor: TlsAcceptor) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%e, "error accepting client");
                continue;
            }
        };
        state
            .logfan
            .info(format!("New connection from {}:{}", peer.ip(), peer.port()));
        let state = state.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(state, tcp, peer, acceptor).await {
                debug!(%peer, reason = e, "connection ended before registration");
            }
        });
    }
}

async fn handle_connection(
    state: AppState,
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
) -> Result<(), String> {
    let tls = acceptor
        .accept(tcp)
        .await
        .map_err(|e| format!("tls accept: {e}"))?;
    let mut framed = Framed::new(tls, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let info = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&state, &mut framed, peer))
        .await
    {
        Ok(Ok(info)) => info,
        Ok(Err(reason)) => {
            state
                .logfan
                .error(format!("Registration failed for {}: {reason}", peer.ip()));
            return Err(reason);
        }
        Err(_) => return Err("handshake timed out".to_owned()),
    };

    let display = info.display_name();
    let client_id = info.client_id.clone();
    state.logfan.info(format!("Client registered: {display}"));
    state.logfan.info(format!(
        "  Client protocol version: {}",
        info.protocol_version
    ));

    let (handle, ops_rx) = SessionHandle::new();
    let serial = handle.serial();
    if let Some(evicted) = state
        .registry
        .insert(RegisteredClient {
            info: info.clone(),
            handle,
        })
        .await
    {
        state
            .logfan
            .warn(format!("Replacing prior session for {client_id}"));
        evicted.handle.close().await;
    }

    let actor = SessionActor::new(info, serial, framed, ops_rx, state.events_tx.clone());
    tokio::spawn(actor.run());
    let _ = state.events_tx.send(FleetEvent::Connected { client_id }).await;
    Ok(())
}

/// Walk the registration state machine.  `Err` carries the rejection reason
/// after the appropriate terminal frame has been sent.
async fn handshake(
    state: &AppState,
    framed: &mut LineStream,
    peer: SocketAddr,
) -> Result<ClientInfo, String> {
    // AwaitRegister
    let register = recv_frame(framed).await?;
    if register.verb != verbs::REGISTER {
        let _ = framed
            .send(Frame::error("expected REGISTER").encode())
            .await;
        return Err(format!("first frame was {}", register.verb));
    }
    let machine = MachineInfo {
        hostname: register.kwarg("hostname").unwrap_or("unknown").to_owned(),
        machine: register.kwarg("machine").unwrap_or("unknown").to_owned(),
        system: register.kwarg("system").unwrap_or("unknown").to_owned(),
        release: register.kwarg("release").unwrap_or("unknown").to_owned(),
    };

    // AwaitAuth (only when a passkey is configured)
    let mut next = recv_frame(framed).await?;
    if let Some(expected) = &state.passkey {
        let supplied = (next.verb == verbs::AUTH)
            .then(|| next.positional(0))
            .flatten();
        if supplied != Some(expected.as_str()) {
            let _ = framed
                .send(
                    Frame::new(verbs::AUTH_FAILED)
                        .kw("message", "Invalid passkey")
                        .encode(),
                )
                .await;
            return Err("invalid passkey".to_owned());
        }
        next = recv_frame(framed).await?;
    } else if next.verb == verbs::AUTH {
        // Passkey offered but none required; tolerated.
        next = recv_frame(framed).await?;
    }

    // AwaitVer
    if next.verb != verbs::VER {
        let _ = framed.send(Frame::error("expected VER").encode()).await;
        return Err(format!("expected VER, got {}", next.verb));
    }
    let client_version = next.positional(0).unwrap_or("unknown").to_owned();
    if !bw_protocol::versions_compatible(PROTOCOL_VERSION, &client_version) {
        let _ = framed
            .send(
                Frame::new(verbs::VERSION_MISMATCH)
                    .kw("server_version", PROTOCOL_VERSION)
                    .kw("client_version", &client_version)
                    .encode(),
            )
            .await;
        return Err(format!(
            "version mismatch (server {PROTOCOL_VERSION}, client {client_version})"
        ));
    }

    // Connected
    let client_id = format!("{}_{}", machine.hostname, peer.ip());
    framed
        .send(
            Frame::new(verbs::REGISTER_OK)
                .kw("client_id", &client_id)
                .kw("server_version", PROTOCOL_VERSION)
                .encode(),
        )
        .await
        .map_err(|e| format!("send REGISTER_OK: {e}"))?;

    Ok(ClientInfo::new(client_id, machine, client_version, peer))
}

async fn recv_frame(framed: &mut LineStream) -> Result<Frame, String> {
    loop {
        let line = framed
            .next()
            .await
            .ok_or("connection closed during handshake")?
            .map_err(|e| format!("read error: {e}"))?;
        match Frame::parse(&line) {
            Ok(frame) => return Ok(frame),
            Err(bw_protocol::ProtocolError::Empty) => continue,
            Err(e) => {
                let _ = framed.send(Frame::error(&e.to_string()).encode()).await;
                return Err(e.to_string());
            }
        }
    }
}
