//! Lifecycle handler scripts.
//!
//! A handler is a text file in the handlers directory whose name prefix
//! selects the event (`s_onready…`, `l_onstart…`) and whose extension picks
//! verbosity: `.hdl` logs each executed line, `.shdl` stays silent.  Lines
//! starting with `#` and blank lines are skipped.  The caller feeds each
//! surviving line back into its own command dispatcher.
//!
//! Handlers may trigger further lifecycle events; a shared [`ReentryGuard`]
//! bounds the nesting depth so a script cannot recurse forever.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Maximum nested lifecycle-event depth before triggers are dropped.
pub const MAX_REENTRY_DEPTH: usize = 8;

/// Well-known event prefixes.
pub mod events {
    pub const SERVER_READY: &str = "s_onready";
    pub const SERVER_CONNECT: &str = "s_onconnect";
    pub const SERVER_DISCONNECT: &str = "s_ondisconnect";
    pub const SERVER_START: &str = "s_onstart";
    pub const SERVER_STOP: &str = "s_onstop";
    pub const SERVER_WS_JOIN: &str = "s_onwsjoin";
    pub const SERVER_WS_LEAVE: &str = "s_onwsleave";

    pub const LOCAL_READY: &str = "l_onready";
    pub const LOCAL_START: &str = "l_onstart";
    pub const LOCAL_STOP: &str = "l_onstop";
}

/// A parsed handler file: its source path, verbosity, and runnable lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerScript {
    pub path: PathBuf,
    pub silent: bool,
    pub lines: Vec<String>,
}

/// Collect the handler scripts matching an event prefix.
///
/// A missing directory or an unreadable file is logged and skipped; handler
/// problems never propagate to the triggering operation.
pub fn scan(dir: &Path, prefix: &str) -> Vec<HandlerScript> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(dir = %dir.display(), %e, "handlers directory not readable");
            return Vec::new();
        }
    };

    let mut scripts = Vec::new();
    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let silent = name.ends_with(".shdl");
        if !silent && !name.ends_with(".hdl") {
            continue;
        }
        let path = entry.path();
        match std::fs::read_to_string(&path) {
            Ok(text) => scripts.push(HandlerScript {
                silent,
                lines: text
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_owned)
                    .collect(),
                path,
            }),
            Err(e) => error!(path = %path.display(), %e, "error reading handler file"),
        }
    }
    scripts.sort_by(|a, b| a.path.cmp(&b.path));
    scripts
}

/// Shared nesting counter for handler-triggered events.
///
/// `enter` returns a token holding the slot for the duration of one event;
/// when the depth limit is hit the trigger is logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct ReentryGuard {
    depth: Arc<AtomicUsize>,
}

impl ReentryGuard {
    pub fn new() -> Self {
        ReentryGuard::default()
    }

    pub fn enter(&self, event: &str) -> Option<ReentryToken> {
        let prior = self.depth.fetch_add(1, Ordering::SeqCst);
        if prior >= MAX_REENTRY_DEPTH {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!(event, depth = prior, "handler reentry depth exceeded, dropping trigger");
            return None;
        }
        Some(ReentryToken {
            depth: Arc::clone(&self.depth),
        })
    }
}

pub struct ReentryToken {
    depth: Arc<AtomicUsize>,
}

impl Drop for ReentryToken {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}
