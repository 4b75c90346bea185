//! Shared server state handed to every subsystem.

use crate::queue::QueueEngine;
use crate::registry::Registry;
use crate::session::FleetEvent;
use crate::transfer::TransferService;
use bw_backend::capture::LoopbackCapture;
use bw_backend::PcmSource;
use bw_core::handlers::ReentryGuard;
use bw_core::LogFan;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Factory for live-stream PCM sources; swapped out in tests.
pub type PcmFactory = Arc<dyn Fn() -> io::Result<Box<dyn PcmSource + Send>> + Send + Sync>;

/// Plain construction options (the CLI layer fills these from flags).
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub passkey: Option<String>,
    pub upload_dir: PathBuf,
    pub handlers_dir: PathBuf,
    pub wait_start: bool,
    pub transfer_port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub transfer: Arc<TransferService>,
    pub queue: Arc<Mutex<QueueEngine>>,
    pub logfan: LogFan,
    pub reentry: ReentryGuard,
    pub events_tx: mpsc::Sender<FleetEvent>,
    pub pcm_factory: PcmFactory,
    pub passkey: Option<String>,
    pub upload_dir: PathBuf,
    pub handlers_dir: PathBuf,
    pub wait_start: bool,
}

impl AppState {
    pub fn new(options: ServerOptions) -> (Self, mpsc::Receiver<FleetEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let state = AppState {
            registry: Arc::new(Registry::new()),
            transfer: TransferService::new(options.upload_dir.clone(), options.transfer_port),
            queue: Arc::new(Mutex::new(QueueEngine::new())),
            logfan: LogFan::default(),
            reentry: ReentryGuard::new(),
            events_tx,
            pcm_factory: Arc::new(|| {
                LoopbackCapture::open_default()
                    .map(|capture| Box::new(capture) as Box<dyn PcmSource + Send>)
            }),
            passkey: options.passkey,
            upload_dir: options.upload_dir,
            handlers_dir: options.handlers_dir,
            wait_start: options.wait_start,
        };
        (state, events_rx)
    }

    pub fn with_pcm_factory(mut self, factory: PcmFactory) -> Self {
        self.pcm_factory = factory;
        self
    }
}
