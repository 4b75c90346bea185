use bw_backend::external::ExternalTransmitter;
use clap::Parser;
use client::config::ClientArgs;
use client::link::ConnectError;
use client::runtime::{self, ClientError};
use client::trampoline::{MainLoop, Trampoline};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    // Pin the process-wide rustls provider before any TLS config exists.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = ClientArgs::parse();
    if let Err(e) = std::fs::create_dir_all(&args.upload_dir) {
        eprintln!("cannot create upload dir {}: {e}", args.upload_dir.display());
        std::process::exit(1);
    }

    // The transmitter backend must stay on this (the main) thread; the
    // network runtime lives on worker threads and crosses over through the
    // trampoline channel.
    let (trampoline, commands_rx) = Trampoline::channel();
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let transmitter = Box::new(ExternalTransmitter::new(args.backend_cmd.clone()));
    let main_loop = MainLoop::new(
        transmitter,
        commands_rx,
        events_tx,
        args.upload_dir.clone(),
        args.handlers_dir.clone(),
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build async runtime");
    let network = rt.spawn(runtime::run_network(args, trampoline.clone(), events_rx));

    main_loop.run();

    let result = rt.block_on(network);
    rt.shutdown_timeout(std::time::Duration::from_secs(1));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            match &e {
                ClientError::Connect(ConnectError::VersionMismatch { server, client }) => {
                    error!("protocol version mismatch");
                    error!("server version: {server}");
                    error!("client version: {client}");
                    error!("please update your client or server to match protocol versions");
                }
                ClientError::Connect(ConnectError::AuthFailed) => {
                    error!("authentication failed: invalid passkey");
                }
                other => error!(%other, "client error"),
            }
            std::process::exit(1);
        }
        Err(e) => {
            error!(%e, "network task panicked");
            std::process::exit(1);
        }
    }
}
