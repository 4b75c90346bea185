//! Scripted controller: a TLS line-protocol listener a test uses to play the
//! server role against a real client link.

use bw_core::tlsgen::TlsIdentity;
use bw_protocol::Frame;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LinesCodec};

pub struct MockController {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    addr: SocketAddr,
}

/// One accepted client connection, framed as lines.
pub struct ControllerLink {
    framed: Framed<TlsStream<TcpStream>, LinesCodec>,
}

impl MockController {
    /// Bind to an ephemeral localhost port with a fresh self-signed identity.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let identity = TlsIdentity::generate()?;
        let acceptor = TlsAcceptor::from(identity.server_config()?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            acceptor,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn accept(&self) -> Result<ControllerLink, Box<dyn std::error::Error>> {
        let (tcp, _) = self.listener.accept().await?;
        let tls = self.acceptor.accept(tcp).await?;
        Ok(ControllerLink {
            framed: Framed::new(tls, LinesCodec::new()),
        })
    }
}

impl ControllerLink {
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        self.framed.send(frame.encode()).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await?
            .ok_or("connection closed")??;
        Ok(Frame::parse(&line)?)
    }
}
