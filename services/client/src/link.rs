//! Client side of the control channel.
//!
//! Connects over TLS (trusting the server's self-signed certificate on
//! first use), walks the registration handshake, and then exposes the
//! framed line stream to the runtime loop.

use crate::machine::MachineReport;
use bw_core::tlsgen::insecure_client_config;
use bw_protocol::{verbs, Frame, ProtocolError, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::info;

/// Upper bound on one control-channel line.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("error connecting to server: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls setup failed: {0}")]
    Tls(#[from] bw_core::tlsgen::TlsError),
    #[error("invalid server name '{0}'")]
    ServerName(String),
    #[error("authentication failed: invalid passkey")]
    AuthFailed,
    #[error("protocol version mismatch (server {server}, client {client})")]
    VersionMismatch { server: String, client: String },
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("connection closed during registration")]
    Closed,
}

/// What the server assigned at registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub client_id: String,
    pub server_version: String,
}

#[derive(Debug)]
pub struct ControlLink {
    framed: Framed<TlsStream<TcpStream>, LinesCodec>,
}

impl ControlLink {
    /// Connect and register.  The passkey is sent only when configured; the
    /// server decides whether one is required.
    pub async fn connect(
        host: &str,
        port: u16,
        passkey: Option<&str>,
        machine: &MachineReport,
    ) -> Result<(Self, Registration), ConnectError> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        let connector = TlsConnector::from(insecure_client_config()?);
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| ConnectError::ServerName(host.to_owned()))?;
        let tls = connector.connect(server_name, tcp).await?;
        let mut framed = Framed::new(tls, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        framed
            .send(
                Frame::new(verbs::REGISTER)
                    .kw("hostname", &machine.hostname)
                    .kw("machine", &machine.machine)
                    .kw("system", &machine.system)
                    .kw("release", &machine.release)
                    .encode(),
            )
            .await
            .map_err(io_from_lines)?;
        if let Some(passkey) = passkey {
            framed
                .send(Frame::new(verbs::AUTH).arg(passkey).encode())
                .await
                .map_err(io_from_lines)?;
        }
        framed
            .send(Frame::new(verbs::VER).arg(PROTOCOL_VERSION).encode())
            .await
            .map_err(io_from_lines)?;

        let verdict = loop {
            let line = framed
                .next()
                .await
                .ok_or(ConnectError::Closed)?
                .map_err(io_from_lines)?;
            match Frame::parse(&line) {
                Ok(frame) => break frame,
                Err(ProtocolError::Empty) => continue,
                Err(e) => return Err(ConnectError::Rejected(e.to_string())),
            }
        };

        match verdict.verb.as_str() {
            verbs::REGISTER_OK => {
                let registration = Registration {
                    client_id: verdict.kwarg("client_id").unwrap_or("unknown").to_owned(),
                    server_version: verdict
                        .kwarg("server_version")
                        .unwrap_or("unknown")
                        .to_owned(),
                };
                info!(
                    client_id = registration.client_id,
                    server_version = registration.server_version,
                    "registered with server"
                );
                Ok((ControlLink { framed }, registration))
            }
            verbs::AUTH_FAILED => Err(ConnectError::AuthFailed),
            verbs::VERSION_MISMATCH => Err(ConnectError::VersionMismatch {
                server: verdict.kwarg("server_version").unwrap_or("unknown").to_owned(),
                client: verdict
                    .kwarg("client_version")
                    .unwrap_or(PROTOCOL_VERSION)
                    .to_owned(),
            }),
            other => Err(ConnectError::Rejected(format!(
                "unexpected response: {other}"
            ))),
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), std::io::Error> {
        self.framed
            .send(frame.encode())
            .await
            .map_err(io_from_lines)
    }

    /// Next frame from the server.  `None` means the channel closed.
    /// Syntax errors come back as `Err` so the caller can answer `ERROR`
    /// and keep the channel open.
    pub async fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        loop {
            let line = match self.framed.next().await? {
                Ok(line) => line,
                Err(_) => return None,
            };
            match Frame::parse(&line) {
                Ok(frame) => return Some(Ok(frame)),
                Err(ProtocolError::Empty) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn io_from_lines(e: tokio_util::codec::LinesCodecError) -> std::io::Error {
    match e {
        tokio_util::codec::LinesCodecError::Io(io) => io,
        other => std::io::Error::other(other.to_string()),
    }
}
