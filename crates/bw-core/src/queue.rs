//! Playlist state machine: an ordered list of filenames, a paused flag, and
//! one cursor per playing client.
//!
//! This module is pure bookkeeping — no I/O, no fleet access.  The
//! controlling process resolves availability (by intersecting per-client file
//! listings), dispatches the actual broadcasts, and feeds playback-ended
//! events back through [`QueueState::advance`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use wildmatch::WildMatch;

/// Outcome of one cursor advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Dispatch this file next for the client.
    Next(String),
    /// End of queue without loop: cursor pinned back to 0, queue paused.
    Finished,
}

/// What a set of add-specs resolved to across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    /// Files present on every client, sorted.
    pub matched: Vec<String>,
    /// Requested files absent from some client: `client_id -> missing names`.
    pub missing: BTreeMap<String, BTreeSet<String>>,
}

impl Resolution {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueState {
    items: Vec<String>,
    paused: bool,
    cursors: HashMap<String, usize>,
}

impl QueueState {
    pub fn new() -> Self {
        QueueState {
            items: Vec::new(),
            paused: true,
            cursors: HashMap::new(),
        }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Insertion order, duplicates permitted.
    pub fn extend(&mut self, files: impl IntoIterator<Item = String>) {
        self.items.extend(files);
    }

    /// Remove by spec list: exact names, `*` patterns, or a bare `*` which
    /// clears everything.  Returns the number of entries dropped.
    pub fn remove_specs(&mut self, specs: &[String]) -> usize {
        let mut removed = 0;
        for spec in specs {
            if spec == "*" {
                removed += self.items.len();
                self.items.clear();
                break;
            } else if spec.contains('*') {
                let pattern = WildMatch::new(spec);
                let before = self.items.len();
                self.items.retain(|item| !pattern.matches(item));
                removed += before - self.items.len();
            } else if let Some(pos) = self.items.iter().position(|item| item == spec) {
                self.items.remove(pos);
                removed += 1;
            }
        }
        removed
    }

    pub fn cursor(&self, client_id: &str) -> usize {
        self.cursors.get(client_id).copied().unwrap_or(0)
    }

    /// Start tracking a client at position 0 if it has no cursor yet.
    pub fn ensure_cursor(&mut self, client_id: &str) {
        self.cursors.entry(client_id.to_owned()).or_insert(0);
    }

    pub fn tracked_clients(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.cursors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The file under a client's cursor, if the cursor is in range.
    pub fn current(&self, client_id: &str) -> Option<&str> {
        self.items.get(self.cursor(client_id)).map(String::as_str)
    }

    /// Advance a client's cursor by exactly one after its broadcast ended.
    ///
    /// Past the end: wraps to 0 when `loop_play`, otherwise pins the cursor
    /// at 0 and pauses the whole queue.
    pub fn advance(&mut self, client_id: &str, loop_play: bool) -> Advance {
        let len = self.items.len();
        let cursor = self.cursors.entry(client_id.to_owned()).or_insert(0);
        *cursor += 1;
        if *cursor >= len {
            *cursor = 0;
            if loop_play && len > 0 {
                return Advance::Next(self.items[0].clone());
            }
            self.paused = true;
            return Advance::Finished;
        }
        Advance::Next(self.items[*cursor].clone())
    }
}

/// Resolve add-specs against the file sets of every connected client.
///
/// The candidate pool is the intersection of all non-empty listings; exact
/// names must be in the pool and patterns expand only against it.  Every
/// requested name a client lacks is reported in `missing` so the caller can
/// reject the add with a gap report.
pub fn resolve_specs(
    specs: &[String],
    client_files: &BTreeMap<String, BTreeSet<String>>,
) -> Resolution {
    let non_empty: Vec<&BTreeSet<String>> =
        client_files.values().filter(|set| !set.is_empty()).collect();
    if non_empty.is_empty() {
        return Resolution::default();
    }

    let mut common = non_empty[0].clone();
    for set in &non_empty[1..] {
        common = common.intersection(set).cloned().collect();
    }

    let mut matched = BTreeSet::new();
    let mut requested = BTreeSet::new();
    for spec in specs {
        if spec == "*" {
            matched.extend(common.iter().cloned());
            for files in client_files.values() {
                requested.extend(files.iter().cloned());
            }
        } else if spec.contains('*') {
            let pattern = WildMatch::new(spec);
            matched.extend(common.iter().filter(|f| pattern.matches(f)).cloned());
            for files in client_files.values() {
                requested.extend(files.iter().filter(|f| pattern.matches(f)).cloned());
            }
        } else {
            requested.insert(spec.clone());
            if common.contains(spec) {
                matched.insert(spec.clone());
            }
        }
    }

    let mut missing = BTreeMap::new();
    for (client_id, files) in client_files {
        let gaps: BTreeSet<String> = requested.difference(files).cloned().collect();
        if !gaps.is_empty() {
            missing.insert(client_id.clone(), gaps);
        }
    }

    Resolution {
        matched: matched.into_iter().collect(),
        missing,
    }
}

/// Forced resolution: exact names pass through unchecked; patterns expand
/// against a single reference listing.
pub fn resolve_forced(specs: &[String], reference: &BTreeSet<String>) -> Vec<String> {
    let mut out = Vec::new();
    for spec in specs {
        if spec == "*" {
            out.extend(reference.iter().cloned());
        } else if spec.contains('*') {
            let pattern = WildMatch::new(spec);
            out.extend(reference.iter().filter(|f| pattern.matches(f)).cloned());
        } else {
            out.push(spec.clone());
        }
    }
    out
}
