//! Fleet-facing playlist driver.
//!
//! Wraps the queue state machine with the operator command surface
//! (`queue +… -… * ! ?`), the cross-fleet availability check, and the
//! auto-advance path fed by `BROADCAST_ENDED` events.

use crate::scheduler;
use crate::state::AppState;
use bw_core::queue::{self, Advance, QueueState};
use bw_protocol::BroadcastParams;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Listing timeout used for availability checks across the fleet.
pub const QUEUE_LIST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct QueueEngine {
    state: QueueState,
    params: BroadcastParams,
    active_targets: String,
}

impl Default for QueueEngine {
    fn default() -> Self {
        QueueEngine::new()
    }
}

impl QueueEngine {
    pub fn new() -> Self {
        QueueEngine {
            state: QueueState::new(),
            params: BroadcastParams::default(),
            active_targets: "all".to_owned(),
        }
    }

    pub fn is_playing(&self) -> bool {
        !self.state.is_paused()
    }

    pub fn items(&self) -> &[String] {
        self.state.items()
    }

    pub fn cursor(&self, client_id: &str) -> usize {
        self.state.cursor(client_id)
    }

    /// Entry point for `queue …` console input; the first character selects
    /// the action.
    pub async fn handle_command(&mut self, app: &AppState, input: &str) {
        let input = input.trim();
        let Some(action) = input.chars().next() else {
            self.show(app).await;
            return;
        };
        let rest = input[action.len_utf8()..].trim();
        match action {
            '+' => self.add(app, rest).await,
            '-' => self.remove(app, rest).await,
            '*' => self.show(app).await,
            '!' => self.toggle(app, rest).await,
            '?' => self.help(app),
            other => {
                app.logfan.error(format!("Invalid action: {other}."));
                app.logfan.info("Use 'queue ?' for help.");
            }
        }
    }

    async fn add(&mut self, app: &AppState, rest: &str) {
        let force = rest.ends_with('!');
        let rest = rest.trim_end_matches('!').trim();
        if rest.is_empty() {
            app.logfan.error("No file specified");
            return;
        }
        let specs: Vec<String> = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let ids = app.registry.client_ids().await;
        if ids.is_empty() {
            app.logfan.error("No clients connected");
            return;
        }

        let listings = self.gather_listings(app, &ids).await;
        if force {
            let reference = listings
                .values()
                .find(|files| !files.is_empty())
                .cloned()
                .unwrap_or_default();
            let added = queue::resolve_forced(&specs, &reference);
            let count = added.len();
            self.state.extend(added);
            app.logfan
                .info(format!("Added {count} file(s) to queue (forced)"));
            self.show(app).await;
            return;
        }

        let resolution = queue::resolve_specs(&specs, &listings);
        if !resolution.missing.is_empty() {
            app.logfan
                .error("Some files are not present on all clients:");
            for (client_id, missing) in &resolution.missing {
                let display = match app.registry.get(client_id).await {
                    Some(client) => client.info.display_name(),
                    None => client_id.clone(),
                };
                let mut names: Vec<&str> =
                    missing.iter().take(3).map(String::as_str).collect();
                if missing.len() > 3 {
                    names.push("...");
                }
                app.logfan
                    .error(format!("  {display}: missing {}", names.join(", ")));
            }
            app.logfan
                .info("Use '!' at the end to force add anyway (e.g., 'queue +file!')");
            return;
        }
        if resolution.matched.is_empty() {
            app.logfan.error("No matching files found on all clients.");
            app.logfan
                .info("Use '!' at the end to force add anyway (e.g., 'queue +file!')");
            return;
        }

        let count = resolution.matched.len();
        self.state.extend(resolution.matched);
        app.logfan.info(format!("Added {count} file(s) to queue"));
        self.show(app).await;
    }

    async fn gather_listings(
        &self,
        app: &AppState,
        ids: &[String],
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut listings = BTreeMap::new();
        for id in ids {
            let Some(client) = app.registry.get(id).await else {
                continue;
            };
            match client.handle.request_file_list(QUEUE_LIST_TIMEOUT).await {
                Ok(files) => {
                    listings.insert(
                        id.clone(),
                        files.into_iter().map(|f| f.name).collect::<BTreeSet<_>>(),
                    );
                }
                Err(e) => {
                    app.logfan
                        .warn(format!("No files from {}: {e}", client.info.display_name()));
                    listings.insert(id.clone(), BTreeSet::new());
                }
            }
        }
        listings
    }

    async fn remove(&mut self, app: &AppState, rest: &str) {
        if rest.is_empty() {
            app.logfan.error("No file specified");
            return;
        }
        let specs: Vec<String> = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        let removed = self.state.remove_specs(&specs);
        app.logfan
            .info(format!("Removed {removed} file(s) from queue"));
        self.show(app).await;
    }

    async fn show(&self, app: &AppState) {
        if self.state.is_empty() {
            app.logfan.info("Queue is empty");
            return;
        }
        let status = if self.state.is_paused() {
            "PAUSED"
        } else {
            "PLAYING"
        };
        app.logfan.info(format!(
            "Queue ({} files) - {status}:",
            self.state.len()
        ));

        let tracked = self.state.tracked_clients();
        if !tracked.is_empty() {
            app.logfan.info("Client positions:");
            for client_id in tracked {
                let Some(client) = app.registry.get(&client_id).await else {
                    continue;
                };
                let index = self.state.cursor(&client_id);
                let current = self
                    .state
                    .items()
                    .get(index)
                    .map(String::as_str)
                    .unwrap_or("finished");
                app.logfan.info(format!(
                    "  {}: [{}/{}] {current}",
                    client.info.display_name(),
                    index + 1,
                    self.state.len()
                ));
            }
        }
        for (i, filename) in self.state.items().iter().enumerate() {
            app.logfan.info(format!("  {}. {filename}", i + 1));
        }
    }

    fn help(&self, app: &AppState) {
        app.logfan.info("Queue commands:");
        app.logfan.info("  queue +file            - Add file to queue");
        app.logfan.info("  queue +file1,file2     - Add multiple files");
        app.logfan.info("  queue +pattern_*       - Add files matching pattern");
        app.logfan.info("  queue +*               - Add all files");
        app.logfan
            .info("  queue +file!           - Force add (skip availability check)");
        app.logfan.info("  queue -file            - Remove file from queue");
        app.logfan.info("  queue -*               - Clear queue");
        app.logfan.info("  queue *                - Show queue");
        app.logfan
            .info("  queue !                - Toggle play/pause on current targets");
        app.logfan
            .info("  queue !targets,freq,loop,ps,rt,pi - Toggle with overrides");
    }

    /// Apply a `!targets,freq,loop,ps,rt,pi` override list; every field is
    /// optional.  Returns the targets the toggle applies to.
    fn apply_toggle_spec(&mut self, rest: &str) -> String {
        if rest.is_empty() {
            return self.active_targets.clone();
        }
        let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
        if let Some(targets) = parts.first().filter(|t| !t.is_empty()) {
            self.active_targets = (*targets).to_owned();
        }
        if let Some(freq) = parts.get(1).and_then(|v| v.parse::<f64>().ok()) {
            self.params.frequency = freq;
        }
        if let Some(flag) = parts.get(2).filter(|v| !v.is_empty()) {
            self.params.loop_play = flag.eq_ignore_ascii_case("true");
        }
        if let Some(ps) = parts.get(3).filter(|v| !v.is_empty()) {
            self.params.ps = (*ps).to_owned();
        }
        if let Some(rt) = parts.get(4).filter(|v| !v.is_empty()) {
            self.params.rt = (*rt).to_owned();
        }
        if let Some(pi) = parts.get(5).filter(|v| !v.is_empty()) {
            self.params.pi = (*pi).to_owned();
        }
        self.active_targets.clone()
    }

    async fn toggle(&mut self, app: &AppState, rest: &str) {
        if self.state.is_empty() {
            app.logfan.error("Queue is empty");
            return;
        }
        let targets = self.apply_toggle_spec(rest);
        if self.state.is_paused() {
            let ids = app.registry.resolve_targets(&targets, &app.logfan).await;
            if ids.is_empty() {
                app.logfan.warn("No valid targets to play on");
                return;
            }
            self.state.set_paused(false);
            app.logfan.info(format!("Queue playing on {targets}"));
            for id in ids {
                self.state.ensure_cursor(&id);
                self.play_current(app, &id).await;
            }
        } else {
            self.state.set_paused(true);
            app.logfan.info(format!("Queue paused on {targets}"));
            scheduler::stop_broadcast(app, &targets).await;
        }
    }

    async fn play_current(&mut self, app: &AppState, client_id: &str) {
        let Some(client) = app.registry.get(client_id).await else {
            return;
        };
        let Some(filename) = self.state.current(client_id).map(str::to_owned) else {
            app.logfan
                .info(format!("{}: Queue finished", client.info.display_name()));
            return;
        };
        let index = self.state.cursor(client_id);
        app.logfan.info(format!(
            "{}: Playing [{}/{}] {filename}",
            client.info.display_name(),
            index + 1,
            self.state.len()
        ));
        let mut params = self.params.clone();
        params.filename = filename;
        params.start_at = 0.0;
        scheduler::start_on(app, &client, &params).await;
    }

    /// Auto-advance: one broadcast-ended event moves that client's cursor by
    /// exactly one and dispatches the next item.
    pub async fn on_broadcast_ended(&mut self, app: &AppState, client_id: &str) {
        if self.state.is_paused() {
            return;
        }
        if !self
            .state
            .tracked_clients()
            .iter()
            .any(|id| id == client_id)
        {
            app.logfan
                .warn(format!("Client {client_id} not in queue tracking"));
            return;
        }
        match self.state.advance(client_id, self.params.loop_play) {
            Advance::Next(filename) => {
                let Some(client) = app.registry.get(client_id).await else {
                    return;
                };
                let index = self.state.cursor(client_id);
                app.logfan.info(format!(
                    "{}: Next [{}/{}] {filename}",
                    client.info.display_name(),
                    index + 1,
                    self.state.len()
                ));
                let mut params = self.params.clone();
                params.filename = filename;
                params.start_at = 0.0;
                scheduler::start_on(app, &client, &params).await;
            }
            Advance::Finished => {
                let display = match app.registry.get(client_id).await {
                    Some(client) => client.info.display_name(),
                    None => client_id.to_owned(),
                };
                app.logfan.info(format!("{display}: Queue finished"));
            }
        }
    }

    /// An out-of-band `start`/`live` while the queue is playing pauses it so
    /// two broadcasters never fight over one transmitter.
    pub fn pause_for_manual_start(&mut self, app: &AppState) -> bool {
        if self.state.is_paused() {
            return false;
        }
        self.state.set_paused(true);
        app.logfan.info("Queue paused (manual broadcast started)");
        true
    }
}
