//! Command-line configuration for the client binary.

use bw_protocol::CONTROL_PORT;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "bw-client", about = "BotWave transmitter client")]
pub struct ClientArgs {
    /// Server hostname or IP address.
    pub server_host: String,

    /// Server control-channel port.
    #[arg(long, default_value_t = CONTROL_PORT)]
    pub port: u16,

    /// Directory holding broadcastable WAV files.
    #[arg(long = "upload-dir", default_value = "/opt/BotWave/uploads")]
    pub upload_dir: PathBuf,

    /// Directory holding lifecycle handler scripts.
    #[arg(long = "handlers-dir", default_value = "/opt/BotWave/handlers")]
    pub handlers_dir: PathBuf,

    /// Passkey presented during registration.
    #[arg(long = "pk")]
    pub passkey: Option<String>,

    /// Path to the transmitter backend executable.
    #[arg(long = "backend-cmd", default_value = "/opt/BotWave/bin/bw-transmit")]
    pub backend_cmd: PathBuf,
}
