//! File-set reconciliation between clients and folders.
//!
//! Three directions, chosen by a trailing `/` on the argument:
//!
//! 1. client → local folder: pull every file the source reports, via upload
//!    tokens pointed at hidden temp names, then rename once stable.
//! 2. local folder → clients: clear the targets, then hand each client a
//!    download token per WAV, throttled between files.
//! 3. client → clients: (1) into a staging folder, then (2) from it.
//!
//! The stability check compensates for transport-layer flush races: a temp
//! file counts as complete when its size holds across three 500 ms polls and
//! the file opens for reading.

use crate::session::{SessionError, FILE_LIST_TIMEOUT};
use crate::state::AppState;
use bw_core::paths::{sanitize_filename, SecurityError};
use bw_protocol::{verbs, Frame};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const STABILITY_POLL: Duration = Duration::from_millis(500);
pub const STABILITY_TIMEOUT: Duration = Duration::from_secs(120);
/// Consecutive equal-size polls required before a temp file counts as done.
pub const STABILITY_WINDOW: u32 = 3;
pub const RENAME_RETRIES: u32 = 3;
pub const RENAME_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Pause between successive files when repopulating a fleet.
pub const INTER_FILE_DELAY: Duration = Duration::from_millis(500);
/// Generous ceiling for one token-mediated transfer to finish.
pub const TRANSFER_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source client '{0}' not found")]
    SourceNotFound(String),
    #[error("no valid targets in '{0}'")]
    NoTargets(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// Which way a `sync <a> <b>` invocation flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPlan<'a> {
    PullToFolder { folder: &'a str, source: &'a str },
    PushFromFolder { targets: &'a str, folder: &'a str },
    Relay { targets: &'a str, source: &'a str },
}

/// A trailing `/` marks the folder side; with no folder it is a
/// client-to-clients relay.
pub fn plan<'a>(a: &'a str, b: &'a str) -> SyncPlan<'a> {
    if a.ends_with('/') {
        SyncPlan::PullToFolder {
            folder: a,
            source: b,
        }
    } else if b.ends_with('/') {
        SyncPlan::PushFromFolder {
            targets: a,
            folder: b,
        }
    } else {
        SyncPlan::Relay {
            targets: a,
            source: b,
        }
    }
}

/// Mirror one client's WAV set into a local folder.  Returns how many files
/// landed.
pub async fn sync_from_client(
    state: &AppState,
    dest: &Path,
    source: &str,
) -> Result<usize, SyncError> {
    let ids = state.registry.resolve_targets(source, &state.logfan).await;
    let Some(id) = ids.first() else {
        return Err(SyncError::SourceNotFound(source.to_owned()));
    };
    let client = state
        .registry
        .get(id)
        .await
        .ok_or_else(|| SyncError::SourceNotFound(source.to_owned()))?;

    let files = client.handle.request_file_list(FILE_LIST_TIMEOUT).await?;
    tokio::fs::create_dir_all(dest).await?;
    state.logfan.info(format!(
        "Syncing {} file(s) from {} into {}",
        files.len(),
        client.info.display_name(),
        dest.display()
    ));

    let prev_root = state.transfer.upload_root().await;
    state.transfer.set_upload_root(dest.to_path_buf()).await;
    let result = pull_files(state, dest, &client, &files).await;
    state.transfer.set_upload_root(prev_root).await;
    result
}

async fn pull_files(
    state: &AppState,
    dest: &Path,
    client: &crate::registry::RegisteredClient,
    files: &[bw_protocol::FileEntry],
) -> Result<usize, SyncError> {
    let mut copied = 0;
    for file in files {
        let final_name = match sanitize_filename(&file.name) {
            Ok(name) => name,
            Err(e) => {
                state
                    .logfan
                    .error(format!("  {}: rejected filename ({e})", file.name));
                continue;
            }
        };
        let temp_name = format!(".sync_temp_{}_{final_name}", Uuid::new_v4().simple());
        let token = match state.transfer.mint_upload(&temp_name, file.size).await {
            Ok(token) => token,
            Err(e) => {
                state.logfan.error(format!("  {final_name}: {e}"));
                continue;
            }
        };

        let request = Frame::new(verbs::UPLOAD_TOKEN)
            .kw("filename", &file.name)
            .kw("token", token)
            .kw("port", state.transfer.port());
        match client
            .handle
            .command_timeout(request, crate::session::ReplyKind::Simple, TRANSFER_COMMAND_TIMEOUT)
            .await
        {
            Ok(reply) if reply.is_ok() => {}
            Ok(reply) => {
                state
                    .logfan
                    .error(format!("  {final_name}: {}", reply.message()));
                continue;
            }
            Err(e) => {
                state.logfan.error(format!("  {final_name}: {e}"));
                continue;
            }
        }

        let temp_path = dest.join(&temp_name);
        if !wait_for_stable(&temp_path, STABILITY_TIMEOUT).await {
            state
                .logfan
                .error(format!("  {final_name}: upload never stabilized"));
            let _ = tokio::fs::remove_file(&temp_path).await;
            continue;
        }
        if rename_with_retries(&temp_path, &dest.join(&final_name)).await {
            state.logfan.info(format!("  {final_name}: synced"));
            copied += 1;
        } else {
            state
                .logfan
                .error(format!("  {final_name}: could not finalize"));
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
    }
    Ok(copied)
}

/// Clear every target, then repopulate it with the folder's WAV files.
/// Returns the number of files pushed.
pub async fn sync_to_clients(
    state: &AppState,
    targets: &str,
    src: &Path,
) -> Result<usize, SyncError> {
    let ids = state.registry.resolve_targets(targets, &state.logfan).await;
    if ids.is_empty() {
        return Err(SyncError::NoTargets(targets.to_owned()));
    }
    let clients = state.registry.handles_for(&ids).await;
    let files = bw_core::files::list_wav_files(src)
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

    state.logfan.info(format!(
        "Clearing WAV files on {} client(s)...",
        clients.len()
    ));
    for client in &clients {
        match client
            .handle
            .command(Frame::new(verbs::REMOVE_FILE).kw("filename", "all"))
            .await
        {
            Ok(reply) if reply.is_ok() => {}
            Ok(reply) => state.logfan.error(format!(
                "  {}: {}",
                client.info.display_name(),
                reply.message()
            )),
            Err(e) => state
                .logfan
                .error(format!("  {}: {e}", client.info.display_name())),
        }
    }

    state
        .logfan
        .info(format!("Pushing {} file(s) to {} client(s)...", files.len(), clients.len()));
    for (index, file) in files.iter().enumerate() {
        if index > 0 {
            // Throttle so the whole fleet is not mid-transfer at once.
            tokio::time::sleep(INTER_FILE_DELAY).await;
        }
        let path = src.join(&file.name);
        for client in &clients {
            let token = state.transfer.mint_download(path.clone()).await;
            let request = Frame::new(verbs::DOWNLOAD_TOKEN)
                .kw("filename", &file.name)
                .kw("token", token)
                .kw("port", state.transfer.port());
            match client
                .handle
                .command_timeout(request, crate::session::ReplyKind::Simple, TRANSFER_COMMAND_TIMEOUT)
                .await
            {
                Ok(reply) if reply.is_ok() => state.logfan.info(format!(
                    "  {} -> {}",
                    file.name,
                    client.info.display_name()
                )),
                Ok(reply) => state.logfan.error(format!(
                    "  {} -> {}: {}",
                    file.name,
                    client.info.display_name(),
                    reply.message()
                )),
                Err(e) => state.logfan.error(format!(
                    "  {} -> {}: {e}",
                    file.name,
                    client.info.display_name()
                )),
            }
        }
    }
    Ok(files.len())
}

/// Relay: pull the source client into a staging folder, push the staging
/// folder to the targets, then discard the staging folder.
pub async fn sync_client_to_clients(
    state: &AppState,
    targets: &str,
    source: &str,
) -> Result<usize, SyncError> {
    let staging: PathBuf =
        std::env::temp_dir().join(format!("bw_sync_{}", Uuid::new_v4().simple()));
    tokio::fs::create_dir_all(&staging).await?;

    let result = async {
        sync_from_client(state, &staging, source).await?;
        sync_to_clients(state, targets, &staging).await
    }
    .await;

    let _ = tokio::fs::remove_dir_all(&staging).await;
    result
}

/// Poll a temp file until its size holds for [`STABILITY_WINDOW`] polls and
/// it can be opened for reading, or until the deadline passes.
pub async fn wait_for_stable(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut last_size: Option<u64> = None;
    let mut streak: u32 = 0;

    while Instant::now() < deadline {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let size = meta.len();
                if last_size == Some(size) {
                    streak += 1;
                } else {
                    last_size = Some(size);
                    streak = 1;
                }
                if streak >= STABILITY_WINDOW && tokio::fs::File::open(path).await.is_ok() {
                    return true;
                }
            }
            Err(_) => {
                last_size = None;
                streak = 0;
            }
        }
        tokio::time::sleep(STABILITY_POLL).await;
    }
    false
}

async fn rename_with_retries(from: &Path, to: &Path) -> bool {
    for attempt in 1..=RENAME_RETRIES {
        match tokio::fs::rename(from, to).await {
            Ok(()) => return true,
            Err(e) if attempt < RENAME_RETRIES => {
                tracing::debug!(%e, attempt, "rename failed, retrying");
                tokio::time::sleep(RENAME_RETRY_DELAY).await;
            }
            Err(e) => {
                tracing::warn!(%e, from = %from.display(), "rename failed");
            }
        }
    }
    false
}
