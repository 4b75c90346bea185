//! Console command dispatcher.
//!
//! One surface serves every input path: interactive stdin, remote-shell
//! frames, and lifecycle handler scripts all feed lines through
//! [`Dispatcher::execute`].  Handler scripts may trigger further lifecycle
//! events; the shared reentry guard bounds that nesting.

use crate::session::FILE_LIST_TIMEOUT;
use crate::state::AppState;
use crate::{scheduler, sync};
use bw_core::handlers;
use bw_protocol::{split_tokens, verbs, BroadcastParams, Frame};
use std::path::Path;

#[derive(Clone)]
pub struct Dispatcher {
    pub state: AppState,
}

impl Dispatcher {
    pub fn new(state: AppState) -> Self {
        Dispatcher { state }
    }

    /// Execute one command line.  Returns false only for `exit`.
    pub async fn execute(&self, line: &str) -> bool {
        // Inline comments are stripped the way handler files expect.
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            return true;
        }

        let tokens = match split_tokens(line) {
            Ok(tokens) => tokens,
            Err(e) => {
                self.state.logfan.error(format!("Error: {e}"));
                return true;
            }
        };
        let Some(cmd) = tokens.first() else {
            return true;
        };

        match cmd.to_lowercase().as_str() {
            "list" => self.cmd_list().await,
            "start" => self.cmd_start(&tokens).await,
            "live" => self.cmd_live(&tokens).await,
            "stop" => self.cmd_stop(&tokens).await,
            "upload" => self.cmd_upload(&tokens).await,
            "dl" => self.cmd_dl(&tokens).await,
            "sync" => self.cmd_sync(&tokens).await,
            "queue" => {
                let rest = line.get(cmd.len()..).unwrap_or_default().trim();
                let mut queue = self.state.queue.lock().await;
                queue.handle_command(&self.state, rest).await;
            }
            "lsfiles" => self.cmd_lsfiles(&tokens).await,
            "rm" => self.cmd_rm(&tokens).await,
            "kick" => self.cmd_kick(&tokens).await,
            "handlers" => self.cmd_handlers(tokens.get(1).map(String::as_str)),
            "<" => self.cmd_shell(line).await,
            "help" => self.cmd_help(),
            "exit" => {
                self.shutdown_fleet().await;
                return false;
            }
            other => {
                self.state
                    .logfan
                    .error(format!("Unknown command: {other}"));
                self.state
                    .logfan
                    .info("Type 'help' for a list of available commands");
            }
        }
        true
    }

    /// Run every handler script registered for a lifecycle event, feeding
    /// each surviving line back through this dispatcher.
    pub async fn run_event_handlers(&self, prefix: &str) {
        let Some(_token) = self.state.reentry.enter(prefix) else {
            return;
        };
        for script in handlers::scan(&self.state.handlers_dir, prefix) {
            if !script.silent {
                self.state
                    .logfan
                    .info(format!("Running handler on {}", script.path.display()));
            }
            for line in &script.lines {
                if !script.silent {
                    self.state
                        .logfan
                        .info(format!("Executing command: {line}"));
                }
                Box::pin(self.execute(line)).await;
            }
        }
    }

    async fn cmd_list(&self) {
        let clients = self.state.registry.list().await;
        if clients.is_empty() {
            self.state.logfan.warn("No clients connected");
            return;
        }
        self.state.logfan.info("Connected clients:");
        for info in clients {
            self.state.logfan.info(format!("ID: {}", info.client_id));
            self.state
                .logfan
                .info(format!("  Hostname: {}", info.machine.hostname));
            self.state
                .logfan
                .info(format!("  Machine: {}", info.machine.machine));
            self.state.logfan.info(format!(
                "  System: {} {}",
                info.machine.system, info.machine.release
            ));
            self.state.logfan.info(format!("  Address: {}", info.addr));
            self.state
                .logfan
                .info(format!("  Protocol Version: {}", info.protocol_version));
            self.state.logfan.info(format!(
                "  Connected: {}",
                info.connected_at.format("%Y-%m-%d %H:%M:%S")
            ));
            self.state.logfan.info(format!(
                "  Last seen: {}",
                info.last_seen().format("%Y-%m-%d %H:%M:%S")
            ));
        }
    }

    async fn cmd_start(&self, tokens: &[String]) {
        let (Some(targets), Some(filename)) = (tokens.get(1), tokens.get(2)) else {
            self.state
                .logfan
                .error("Usage: start <targets> <file> [freq] [loop] [ps] [rt] [pi]");
            return;
        };
        let mut params = BroadcastParams::for_file(filename);
        if let Some(freq) = tokens.get(3) {
            match freq.parse() {
                Ok(freq) => params.frequency = freq,
                Err(_) => {
                    self.state
                        .logfan
                        .error(format!("Invalid frequency: {freq}"));
                    return;
                }
            }
        }
        params.loop_play = tokens.get(4).is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if let Some(ps) = tokens.get(5) {
            params.ps = ps.clone();
        }
        if let Some(rt) = tokens.get(6) {
            params.rt = rt.clone();
        }
        if let Some(pi) = tokens.get(7) {
            params.pi = pi.clone();
        }

        self.state
            .queue
            .lock()
            .await
            .pause_for_manual_start(&self.state);
        if scheduler::start_broadcast(&self.state, targets, params).await > 0 {
            self.run_event_handlers(handlers::events::SERVER_START).await;
        }
    }

    async fn cmd_live(&self, tokens: &[String]) {
        let Some(targets) = tokens.get(1) else {
            self.state
                .logfan
                .error("Usage: live <targets> [freq] [ps] [rt] [pi]");
            return;
        };
        let freq = tokens
            .get(2)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(90.0);
        let ps = tokens.get(3).cloned().unwrap_or_else(|| "BotWave".to_owned());
        let rt = tokens
            .get(4)
            .cloned()
            .unwrap_or_else(|| "Broadcasting".to_owned());
        let pi = tokens.get(5).cloned().unwrap_or_else(|| "FFFF".to_owned());

        let ids = self
            .state
            .registry
            .resolve_targets(targets, &self.state.logfan)
            .await;
        if ids.is_empty() {
            self.state.logfan.warn("No clients to stream to");
            return;
        }
        self.state
            .queue
            .lock()
            .await
            .pause_for_manual_start(&self.state);

        let mut started = 0;
        for client in self.state.registry.handles_for(&ids).await {
            let source = match (self.state.pcm_factory)() {
                Ok(source) => source,
                Err(e) => {
                    self.state
                        .logfan
                        .error(format!("  {}: audio capture unavailable ({e})", client.info.display_name()));
                    continue;
                }
            };
            let rate = source.sample_rate();
            let channels = source.channels();
            let token = self.state.transfer.mint_stream(source, rate, channels).await;
            let frame = Frame::new(verbs::STREAM_TOKEN)
                .kw("token", token)
                .kw("port", self.state.transfer.port())
                .kw("freq", freq)
                .kw("ps", &ps)
                .kw("rt", &rt)
                .kw("pi", &pi);
            match client.handle.command(frame).await {
                Ok(reply) if reply.is_ok() => {
                    self.state
                        .logfan
                        .info(format!("  {}: Live stream started", client.info.display_name()));
                    started += 1;
                }
                Ok(reply) => self.state.logfan.error(format!(
                    "  {}: {}",
                    client.info.display_name(),
                    reply.message()
                )),
                Err(e) => self
                    .state
                    .logfan
                    .error(format!("  {}: {e}", client.info.display_name())),
            }
        }
        if started > 0 {
            self.run_event_handlers(handlers::events::SERVER_START).await;
        }
    }

    async fn cmd_stop(&self, tokens: &[String]) {
        let Some(targets) = tokens.get(1) else {
            self.state.logfan.error("Usage: stop <targets>");
            return;
        };
        if scheduler::stop_broadcast(&self.state, targets).await > 0 {
            self.run_event_handlers(handlers::events::SERVER_STOP).await;
        }
    }

    async fn cmd_upload(&self, tokens: &[String]) {
        let (Some(targets), Some(file)) = (tokens.get(1), tokens.get(2)) else {
            self.state.logfan.error("Usage: upload <targets> <file>");
            return;
        };
        let path = Path::new(file);
        if !path.is_file() {
            self.state.logfan.error(format!("File {file} not found"));
            return;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            self.state.logfan.error(format!("Invalid file name: {file}"));
            return;
        };

        let ids = self
            .state
            .registry
            .resolve_targets(targets, &self.state.logfan)
            .await;
        if ids.is_empty() {
            self.state.logfan.warn("No clients to upload to");
            return;
        }
        let clients = self.state.registry.handles_for(&ids).await;
        self.state.logfan.info(format!(
            "Uploading {name} to {} client(s)...",
            clients.len()
        ));
        let mut succeeded = 0;
        for client in &clients {
            let token = self.state.transfer.mint_download(path.to_path_buf()).await;
            let frame = Frame::new(verbs::DOWNLOAD_TOKEN)
                .kw("filename", name)
                .kw("token", token)
                .kw("port", self.state.transfer.port());
            match client
                .handle
                .command_timeout(
                    frame,
                    crate::session::ReplyKind::Simple,
                    sync::TRANSFER_COMMAND_TIMEOUT,
                )
                .await
            {
                Ok(reply) if reply.is_ok() => {
                    self.state
                        .logfan
                        .info(format!("  {}: Upload successful", client.info.display_name()));
                    succeeded += 1;
                }
                Ok(reply) => self.state.logfan.error(format!(
                    "  {}: {}",
                    client.info.display_name(),
                    reply.message()
                )),
                Err(e) => self
                    .state
                    .logfan
                    .error(format!("  {}: {e}", client.info.display_name())),
            }
        }
        self.state.logfan.info(format!(
            "Upload completed: {succeeded}/{} successful",
            clients.len()
        ));
    }

    async fn cmd_dl(&self, tokens: &[String]) {
        let (Some(targets), Some(url)) = (tokens.get(1), tokens.get(2)) else {
            self.state.logfan.error("Usage: dl <targets> <url>");
            return;
        };
        let ids = self
            .state
            .registry
            .resolve_targets(targets, &self.state.logfan)
            .await;
        for client in self.state.registry.handles_for(&ids).await {
            let frame = Frame::new(verbs::DOWNLOAD_URL).kw("url", url);
            match client
                .handle
                .command_timeout(
                    frame,
                    crate::session::ReplyKind::Simple,
                    sync::TRANSFER_COMMAND_TIMEOUT,
                )
                .await
            {
                Ok(reply) if reply.is_ok() => self
                    .state
                    .logfan
                    .info(format!("  {}: Downloaded", client.info.display_name())),
                Ok(reply) => self.state.logfan.error(format!(
                    "  {}: {}",
                    client.info.display_name(),
                    reply.message()
                )),
                Err(e) => self
                    .state
                    .logfan
                    .error(format!("  {}: {e}", client.info.display_name())),
            }
        }
    }

    async fn cmd_sync(&self, tokens: &[String]) {
        let (Some(a), Some(b)) = (tokens.get(1), tokens.get(2)) else {
            self.state
                .logfan
                .error("Usage: sync <path/|targets> <client|path/>");
            return;
        };
        let outcome = match sync::plan(a, b) {
            sync::SyncPlan::PullToFolder { folder, source } => {
                sync::sync_from_client(&self.state, Path::new(folder), source).await
            }
            sync::SyncPlan::PushFromFolder { targets, folder } => {
                sync::sync_to_clients(&self.state, targets, Path::new(folder)).await
            }
            sync::SyncPlan::Relay { targets, source } => {
                sync::sync_client_to_clients(&self.state, targets, source).await
            }
        };
        match outcome {
            Ok(count) => self
                .state
                .logfan
                .info(format!("Sync completed ({count} file(s))")),
            Err(e) => self.state.logfan.error(format!("Sync failed: {e}")),
        }
    }

    async fn cmd_lsfiles(&self, tokens: &[String]) {
        let Some(targets) = tokens.get(1) else {
            self.state.logfan.error("Usage: lsfiles <targets>");
            return;
        };
        let ids = self
            .state
            .registry
            .resolve_targets(targets, &self.state.logfan)
            .await;
        for client in self.state.registry.handles_for(&ids).await {
            match client.handle.request_file_list(FILE_LIST_TIMEOUT).await {
                Ok(files) => {
                    self.state.logfan.info(format!(
                        "{}: {} WAV file(s)",
                        client.info.display_name(),
                        files.len()
                    ));
                    for file in files {
                        self.state.logfan.info(format!(
                            "  {} ({} bytes, {})",
                            file.name, file.size, file.modified
                        ));
                    }
                }
                Err(e) => self
                    .state
                    .logfan
                    .error(format!("  {}: {e}", client.info.display_name())),
            }
        }
    }

    async fn cmd_rm(&self, tokens: &[String]) {
        let (Some(targets), Some(filename)) = (tokens.get(1), tokens.get(2)) else {
            self.state.logfan.error("Usage: rm <targets> <filename|all>");
            return;
        };
        let ids = self
            .state
            .registry
            .resolve_targets(targets, &self.state.logfan)
            .await;
        for client in self.state.registry.handles_for(&ids).await {
            let frame = Frame::new(verbs::REMOVE_FILE).kw("filename", filename);
            match client.handle.command(frame).await {
                Ok(reply) if reply.is_ok() => self.state.logfan.info(format!(
                    "  {}: {}",
                    client.info.display_name(),
                    reply.message()
                )),
                Ok(reply) => self.state.logfan.error(format!(
                    "  {}: {}",
                    client.info.display_name(),
                    reply.message()
                )),
                Err(e) => self
                    .state
                    .logfan
                    .error(format!("  {}: {e}", client.info.display_name())),
            }
        }
    }

    async fn cmd_kick(&self, tokens: &[String]) {
        let Some(targets) = tokens.get(1) else {
            self.state.logfan.error("Usage: kick <targets> [reason]");
            return;
        };
        let reason = if tokens.len() > 2 {
            tokens[2..].join(" ")
        } else {
            "Kicked by administrator".to_owned()
        };
        let ids = self
            .state
            .registry
            .resolve_targets(targets, &self.state.logfan)
            .await;
        for client in self.state.registry.handles_for(&ids).await {
            client.handle.kick(&reason).await;
            self.state.logfan.info(format!(
                "  {}: Kicked - {reason}",
                client.info.display_name()
            ));
        }
    }

    fn cmd_handlers(&self, filename: Option<&str>) {
        let dir = &self.state.handlers_dir;
        match filename {
            Some(name) => {
                let path = dir.join(name);
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        self.state
                            .logfan
                            .info(format!("Commands in handler file {name}:"));
                        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                            self.state.logfan.info(format!("  {line}"));
                        }
                    }
                    Err(_) => self
                        .state
                        .logfan
                        .error(format!("Handler file {name} not found")),
                }
            }
            None => match std::fs::read_dir(dir) {
                Ok(entries) => {
                    let mut names: Vec<String> = entries
                        .flatten()
                        .filter(|e| e.path().is_file())
                        .filter_map(|e| e.file_name().into_string().ok())
                        .collect();
                    names.sort();
                    if names.is_empty() {
                        self.state
                            .logfan
                            .info(format!("No handlers found in {}", dir.display()));
                        return;
                    }
                    self.state
                        .logfan
                        .info(format!("Handlers in directory {}:", dir.display()));
                    for name in names {
                        self.state.logfan.info(format!("  {name}"));
                    }
                }
                Err(_) => self
                    .state
                    .logfan
                    .error(format!("Directory {} not found", dir.display())),
            },
        }
    }

    async fn cmd_shell(&self, line: &str) {
        let command = line.trim_start_matches('<').trim();
        if command.is_empty() {
            self.state.logfan.error("Usage: < <shell command>");
            return;
        }
        match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
        {
            Ok(output) => {
                for out_line in String::from_utf8_lossy(&output.stdout).lines() {
                    self.state.logfan.info(out_line.to_owned());
                }
                if !output.status.success() {
                    for err_line in String::from_utf8_lossy(&output.stderr).lines() {
                        self.state.logfan.info(err_line.to_owned());
                    }
                    self.state.logfan.error(format!(
                        "Command failed with return code {}",
                        output.status.code().unwrap_or(-1)
                    ));
                }
            }
            Err(e) => self
                .state
                .logfan
                .error(format!("Error executing shell command: {e}")),
        }
    }

    fn cmd_help(&self) {
        let lines = [
            "Available commands:",
            "  list                                        - List connected clients",
            "  start <targets> <file> [freq] [loop] [ps] [rt] [pi] - Start a broadcast",
            "  live <targets> [freq] [ps] [rt] [pi]        - Stream live audio",
            "  stop <targets>                              - Stop broadcasting",
            "  upload <targets> <file>                     - Push a WAV to client(s)",
            "  dl <targets> <url>                          - Clients fetch a URL",
            "  sync <path/|targets> <client|path/>         - Reconcile file sets",
            "  queue +|-|*|!|? ...                         - Playlist engine",
            "  lsfiles <targets>                           - List client WAV files",
            "  rm <targets> <filename|all>                 - Remove client files",
            "  kick <targets> [reason]                     - Disconnect client(s)",
            "  handlers [file]                             - Inspect handler scripts",
            "  < <shell command>                           - Run a host shell command",
            "  help                                        - This message",
            "  exit                                        - Kick everyone and quit",
            "",
            "Targets: 'all', a client id, a hostname, or a comma-separated list",
        ];
        for line in lines {
            self.state.logfan.info(line);
        }
    }

    /// `exit` path: everyone is kicked before the listeners go down.
    pub async fn shutdown_fleet(&self) {
        let ids = self.state.registry.client_ids().await;
        for client in self.state.registry.handles_for(&ids).await {
            client.handle.kick("The server is closing.").await;
        }
    }
}
