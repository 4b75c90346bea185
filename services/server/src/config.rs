//! Command-line configuration for the server binary.

use crate::state::ServerOptions;
use bw_protocol::{CONTROL_PORT, TRANSFER_PORT};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "bw-server", about = "BotWave fleet controller")]
pub struct ServerArgs {
    /// Bind address for every listener.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Control-channel port.
    #[arg(long, default_value_t = CONTROL_PORT)]
    pub port: u16,

    /// File-transfer (HTTPS) port.
    #[arg(long = "transfer-port", default_value_t = TRANSFER_PORT)]
    pub transfer_port: u16,

    /// Enable the remote-shell WebSocket port.
    #[arg(long = "ws-port")]
    pub ws_port: Option<u16>,

    /// Passkey clients must present during registration.
    #[arg(long = "pk")]
    pub passkey: Option<String>,

    /// Staging directory for server-side files.
    #[arg(long = "upload-dir", default_value = "/opt/BotWave/uploads")]
    pub upload_dir: PathBuf,

    /// Directory holding lifecycle handler scripts.
    #[arg(long = "handlers-dir", default_value = "/opt/BotWave/handlers")]
    pub handlers_dir: PathBuf,

    /// Compute a shared future start epoch when starting on several clients.
    #[arg(long = "wait-start")]
    pub wait_start: bool,
}

impl ServerArgs {
    pub fn to_options(&self) -> ServerOptions {
        ServerOptions {
            passkey: self.passkey.clone(),
            upload_dir: self.upload_dir.clone(),
            handlers_dir: self.handlers_dir.clone(),
            wait_start: self.wait_start,
            transfer_port: self.transfer_port,
        }
    }
}
