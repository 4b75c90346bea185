use bw_core::handlers::events as handler_events;
use bw_core::tlsgen::TlsIdentity;
use clap::Parser;
use server::config::ServerArgs;
use server::dispatch::Dispatcher;
use server::{control, events, shell, state::AppState, transfer};
use std::net::SocketAddr;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    // Pin the process-wide rustls provider before any TLS config exists.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = ServerArgs::parse();
    if let Err(e) = std::fs::create_dir_all(&args.upload_dir) {
        eprintln!("cannot create upload dir {}: {e}", args.upload_dir.display());
        std::process::exit(1);
    }

    let identity = TlsIdentity::generate().expect("failed to generate TLS identity");
    let (state, events_rx) = AppState::new(args.to_options());
    state.transfer.spawn_sweeper();

    // File-transfer endpoint (own HTTPS listener, same identity).
    let transfer_addr: SocketAddr = format!("{}:{}", args.host, args.transfer_port)
        .parse()
        .expect("invalid transfer bind address");
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem(
        identity.cert_pem.clone().into_bytes(),
        identity.key_pem.clone().into_bytes(),
    )
    .await
    .expect("transfer TLS config");
    let transfer_router = transfer::router(state.transfer.clone());
    tokio::spawn(async move {
        if let Err(e) = axum_server::bind_rustls(transfer_addr, rustls_config)
            .serve(transfer_router.into_make_service())
            .await
        {
            tracing::error!(%e, "file transfer server error");
        }
    });
    state.logfan.info(format!(
        "File server started on https://{}:{}",
        args.host, args.transfer_port
    ));

    // Control channel.
    let acceptor = TlsAcceptor::from(identity.server_config().expect("control TLS config"));
    let control_bind = format!("{}:{}", args.host, args.port);
    let (control_addr, _control_task) = control::start_control(state.clone(), acceptor, &control_bind)
        .await
        .expect("failed to bind control port");
    state.logfan.info(format!(
        "BotWave Server started on {control_addr} (protocol {})",
        bw_protocol::PROTOCOL_VERSION
    ));
    if state.passkey.is_some() {
        state.logfan.info("Server is using authentication with a passkey");
    }

    // Remote-shell port.
    let (commands_tx, mut commands_rx) = mpsc::channel::<String>(64);
    if let Some(ws_port) = args.ws_port {
        let bind = format!("{}:{ws_port}", args.host);
        let (addr, _task) = shell::start_shell(&state, commands_tx.clone(), &bind)
            .await
            .expect("failed to bind shell port");
        state
            .logfan
            .info(format!("WebSocket command port on {addr}"));
    }

    let dispatcher = Dispatcher::new(state.clone());
    tokio::spawn(events::run_fleet_events(dispatcher.clone(), events_rx));
    dispatcher
        .run_event_handlers(handler_events::SERVER_READY)
        .await;
    state
        .logfan
        .info("Type 'help' for a list of available commands");

    // Console loop: interactive stdin plus injected remote-shell lines.
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut kicked_on_exit = false;
    loop {
        tokio::select! {
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if !dispatcher.execute(&line).await {
                        kicked_on_exit = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(%e, "stdin error");
                    break;
                }
            },
            cmd = commands_rx.recv() => match cmd {
                Some(cmd) => {
                    if !dispatcher.execute(&cmd).await {
                        kicked_on_exit = true;
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                state.logfan.warn("Use 'exit' to exit");
            }
        }
    }

    if !kicked_on_exit {
        dispatcher.shutdown_fleet().await;
    }
    // Give KICK frames a moment to flush before the listeners die.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("Server stopped");
}
