//! Fleet directory: every registered client, its descriptor, and the handle
//! used to talk to its session actor.
//!
//! `client_id` is unique; a reconnect under an existing id evicts the prior
//! session.  Target specs accepted everywhere: the literal `all`, a
//! client id, a bare hostname (first match wins), or a comma-separated list
//! of any of these.  Unknown targets are logged and skipped so a fan-out
//! proceeds on the valid subset.

use crate::session::SessionHandle;
use bw_core::LogFan;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;

/// Descriptor reported in the REGISTER frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineInfo {
    pub hostname: String,
    pub machine: String,
    pub system: String,
    pub release: String,
}

/// One registered client as the rest of the server sees it.
#[derive(Clone)]
pub struct ClientInfo {
    pub client_id: String,
    pub machine: MachineInfo,
    pub protocol_version: String,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    last_seen: Arc<StdMutex<DateTime<Utc>>>,
}

impl ClientInfo {
    pub fn new(
        client_id: String,
        machine: MachineInfo,
        protocol_version: String,
        addr: SocketAddr,
    ) -> Self {
        let now = Utc::now();
        ClientInfo {
            client_id,
            machine,
            protocol_version,
            addr,
            connected_at: now,
            last_seen: Arc::new(StdMutex::new(now)),
        }
    }

    /// `hostname (ip)`, the operator-facing name.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.machine.hostname, self.addr.ip())
    }

    pub fn touch(&self) {
        if let Ok(mut seen) = self.last_seen.lock() {
            *seen = Utc::now();
        }
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen.lock().map(|seen| *seen).unwrap_or(self.connected_at)
    }
}

#[derive(Clone)]
pub struct RegisteredClient {
    pub info: ClientInfo,
    pub handle: SessionHandle,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, RegisteredClient>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Insert a freshly registered client; returns the evicted prior session
    /// when the id was already taken.
    pub async fn insert(&self, client: RegisteredClient) -> Option<RegisteredClient> {
        self.inner
            .write()
            .await
            .insert(client.info.client_id.clone(), client)
    }

    pub async fn get(&self, client_id: &str) -> Option<RegisteredClient> {
        self.inner.read().await.get(client_id).cloned()
    }

    pub async fn remove(&self, client_id: &str) -> Option<RegisteredClient> {
        self.inner.write().await.remove(client_id)
    }

    /// Remove only if the stored session is still the one that died; a
    /// reconnect may already have replaced the entry.
    pub async fn remove_if_serial(&self, client_id: &str, serial: u64) -> Option<RegisteredClient> {
        let mut map = self.inner.write().await;
        if map.get(client_id).is_some_and(|c| c.handle.serial() == serial) {
            return map.remove(client_id);
        }
        None
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<_> = self
            .inner
            .read()
            .await
            .values()
            .map(|c| c.info.clone())
            .collect();
        infos.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        infos
    }

    pub async fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve a target spec to concrete client ids.
    pub async fn resolve_targets(&self, targets: &str, log: &LogFan) -> Vec<String> {
        let targets = targets.trim();
        if targets.is_empty() {
            log.error("No targets specified");
            return Vec::new();
        }
        if targets.eq_ignore_ascii_case("all") {
            return self.client_ids().await;
        }

        let map = self.inner.read().await;
        let mut resolved = Vec::new();
        for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if map.contains_key(target) {
                resolved.push(target.to_owned());
                continue;
            }
            match map
                .values()
                .find(|c| c.info.machine.hostname == target)
                .map(|c| c.info.client_id.clone())
            {
                Some(id) => resolved.push(id),
                None => log.error(format!("Client '{target}' not found")),
            }
        }
        resolved
    }

    /// Handles for a resolved id list, skipping ids that vanished meanwhile.
    pub async fn handles_for(&self, ids: &[String]) -> Vec<RegisteredClient> {
        let map = self.inner.read().await;
        ids.iter().filter_map(|id| map.get(id).cloned()).collect()
    }
}
