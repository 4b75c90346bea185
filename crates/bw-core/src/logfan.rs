//! Log fan-out: every operator-facing line goes to `tracing` and to any
//! registered sink (remote-shell WebSocket subscribers tail the same feed the
//! terminal shows).

use std::fmt::Display;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct LogFan {
    tx: broadcast::Sender<String>,
}

impl Default for LogFan {
    fn default() -> Self {
        LogFan::new(1024)
    }
}

impl LogFan {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        LogFan { tx }
    }

    /// Subscribe a new sink; dropped receivers unregister themselves.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn info(&self, msg: impl Display) {
        let line = msg.to_string();
        tracing::info!("{line}");
        let _ = self.tx.send(line);
    }

    pub fn warn(&self, msg: impl Display) {
        let line = msg.to_string();
        tracing::warn!("{line}");
        let _ = self.tx.send(line);
    }

    pub fn error(&self, msg: impl Display) {
        let line = msg.to_string();
        tracing::error!("{line}");
        let _ = self.tx.send(line);
    }
}
