//! Coordinated broadcast starts.
//!
//! Geographically separate transmitters begin together by receiving the same
//! absolute `start_at` epoch: each additional client buys the fleet a fixed
//! 20 s arming slot.  Dispatch is best-effort per client; one failed target
//! never blocks the rest.

use crate::registry::RegisteredClient;
use crate::state::AppState;
use bw_protocol::{verbs, BroadcastParams, Frame};
use chrono::Utc;
use futures_util::future::join_all;

/// Arming pre-roll granted per additional client.
pub const BROADCAST_SLOT_SECONDS: f64 = 20.0;

pub fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// `now + 20·(n−1)` when coordinating more than one client, else 0
/// (immediate).
pub fn compute_start_at(now: f64, target_count: usize, wait_start: bool) -> f64 {
    if wait_start && target_count > 1 {
        now + BROADCAST_SLOT_SECONDS * (target_count - 1) as f64
    } else {
        0.0
    }
}

/// Send one START to one client and report whether it acknowledged.
pub async fn start_on(state: &AppState, client: &RegisteredClient, params: &BroadcastParams) -> bool {
    match client.handle.command(params.to_start_frame()).await {
        Ok(reply) if reply.is_ok() => {
            state
                .logfan
                .info(format!("  {}: Broadcasting started", client.info.display_name()));
            true
        }
        Ok(reply) => {
            state.logfan.error(format!(
                "  {}: {}",
                client.info.display_name(),
                reply.message()
            ));
            false
        }
        Err(e) => {
            state
                .logfan
                .error(format!("  {}: {e}", client.info.display_name()));
            false
        }
    }
}

/// Fan a START out to a target spec.  Returns the number of clients that
/// acknowledged.
pub async fn start_broadcast(state: &AppState, targets: &str, mut params: BroadcastParams) -> usize {
    let ids = state.registry.resolve_targets(targets, &state.logfan).await;
    if ids.is_empty() {
        state.logfan.warn("No clients to start");
        return 0;
    }
    params.start_at = compute_start_at(now_epoch(), ids.len(), state.wait_start);
    if params.start_at > 0.0 {
        state.logfan.info(format!(
            "Synchronized start at epoch {:.2} ({} clients)",
            params.start_at,
            ids.len()
        ));
    }

    let clients = state.registry.handles_for(&ids).await;
    state
        .logfan
        .info(format!("Starting broadcast on {} client(s)...", clients.len()));
    let results = join_all(
        clients
            .iter()
            .map(|client| start_on(state, client, &params)),
    )
    .await;
    let succeeded = results.into_iter().filter(|ok| *ok).count();
    state.logfan.info(format!(
        "Broadcast start completed: {succeeded}/{} successful",
        clients.len()
    ));
    succeeded
}

/// Fan a STOP out to a target spec.
pub async fn stop_broadcast(state: &AppState, targets: &str) -> usize {
    let ids = state.registry.resolve_targets(targets, &state.logfan).await;
    if ids.is_empty() {
        state.logfan.warn("No clients to stop");
        return 0;
    }
    let clients = state.registry.handles_for(&ids).await;
    state
        .logfan
        .info(format!("Stopping broadcast on {} client(s)...", clients.len()));

    let results = join_all(clients.iter().map(|client| async move {
        match client.handle.command(Frame::new(verbs::STOP)).await {
            Ok(reply) if reply.is_ok() => {
                state
                    .logfan
                    .info(format!("  {}: Broadcasting stopped", client.info.display_name()));
                true
            }
            Ok(reply) => {
                state.logfan.error(format!(
                    "  {}: {}",
                    client.info.display_name(),
                    reply.message()
                ));
                false
            }
            Err(e) => {
                state
                    .logfan
                    .error(format!("  {}: {e}", client.info.display_name()));
                false
            }
        }
    }))
    .await;
    let succeeded = results.into_iter().filter(|ok| *ok).count();
    state.logfan.info(format!(
        "Broadcast stop completed: {succeeded}/{} successful",
        clients.len()
    ));
    succeeded
}
