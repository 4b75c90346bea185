//! Scripted fleet client: connects to a real server's control port over TLS
//! and lets a test drive the registration handshake and command exchange
//! frame by frame.

use bw_core::tlsgen::insecure_client_config;
use bw_protocol::{verbs, Frame, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LinesCodec};

type LineStream = Framed<TlsStream<TcpStream>, LinesCodec>;

pub struct MockFleetClient {
    framed: LineStream,
}

impl MockFleetClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, Box<dyn std::error::Error>> {
        let tcp = TcpStream::connect(addr).await?;
        let connector = TlsConnector::from(insecure_client_config()?);
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from("localhost")?;
        let tls = connector.connect(server_name, tcp).await?;
        Ok(Self {
            framed: Framed::new(tls, LinesCodec::new()),
        })
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        self.framed.send(frame.encode()).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, line: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.framed.send(line.to_owned()).await?;
        Ok(())
    }

    /// Receive the next frame, with a 5 s guard against hangs.
    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await?
            .ok_or("connection closed")??;
        Ok(Frame::parse(&line)?)
    }

    /// Receive the next non-keep-alive frame, answering any interleaved PING.
    pub async fn recv_command(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.verb == verbs::PING {
                self.send_frame(&Frame::new(verbs::PONG)).await?;
                continue;
            }
            return Ok(frame);
        }
    }

    /// Service loop variant of [`recv_command`]: waits indefinitely,
    /// auto-answers PING, skips unparseable lines, and returns `None` when
    /// the server closes the channel.
    ///
    /// [`recv_command`]: MockFleetClient::recv_command
    pub async fn serve_next(&mut self) -> Option<Frame> {
        loop {
            let line = self.framed.next().await?.ok()?;
            match Frame::parse(&line) {
                Ok(frame) if frame.verb == verbs::PING => {
                    self.send_frame(&Frame::new(verbs::PONG)).await.ok()?;
                }
                Ok(frame) => return Some(frame),
                Err(_) => continue,
            }
        }
    }

    /// Run the REGISTER → AUTH → VER handshake and return the server's
    /// verdict frame.
    pub async fn handshake(
        &mut self,
        hostname: &str,
        passkey: Option<&str>,
        version: &str,
    ) -> Result<Frame, Box<dyn std::error::Error>> {
        self.send_frame(
            &Frame::new(verbs::REGISTER)
                .kw("hostname", hostname)
                .kw("machine", "armv7l")
                .kw("system", "Linux")
                .kw("release", "6.1"),
        )
        .await?;
        if let Some(pk) = passkey {
            self.send_frame(&Frame::new(verbs::AUTH).arg(pk)).await?;
        }
        self.send_frame(&Frame::new(verbs::VER).arg(version)).await?;
        self.recv_frame().await
    }

    /// Handshake with the crate's own protocol version and assert success.
    pub async fn register_ok(
        &mut self,
        hostname: &str,
        passkey: Option<&str>,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let reply = self.handshake(hostname, passkey, PROTOCOL_VERSION).await?;
        if reply.verb != verbs::REGISTER_OK {
            return Err(format!("expected REGISTER_OK, got {}", reply.encode()).into());
        }
        Ok(reply.require_kwarg("client_id")?.to_owned())
    }

    /// True once the server has dropped the connection.
    pub async fn wait_closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(5), self.framed.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        )
    }
}
