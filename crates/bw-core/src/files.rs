//! WAV bookkeeping for the flat upload directory.

use crate::paths::{safe_join, SecurityError};
use bw_protocol::FileEntry;
use chrono::{DateTime, Local};
use std::io;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("file {0} not found")]
    NotFound(String),
    #[error("only WAV files are supported")]
    NotWav,
}

pub fn is_wav(name: &str) -> bool {
    name.to_lowercase().ends_with(".wav")
}

/// List the broadcastable WAV files in `dir`, sorted by name.
pub fn list_wav_files(dir: &Path) -> Result<Vec<FileEntry>, FilesError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !is_wav(&name) || !entry.file_type()?.is_file() {
            continue;
        }
        let meta = entry.metadata()?;
        let modified: DateTime<Local> = meta.modified()?.into();
        files.push(FileEntry {
            name,
            size: meta.len(),
            modified: modified.format("%Y-%m-%d %H:%M:%S").to_string(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Remove one WAV file by name, or every WAV file when `target` is the
/// literal `all`.  Returns the number of files removed.
pub fn remove_wav(dir: &Path, target: &str) -> Result<usize, FilesError> {
    if target.eq_ignore_ascii_case("all") {
        let mut removed = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_wav(&name) && entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        return Ok(removed);
    }

    if !is_wav(target) {
        return Err(FilesError::NotWav);
    }
    let path = safe_join(dir, target)?;
    if !path.is_file() {
        return Err(FilesError::NotFound(target.to_owned()));
    }
    std::fs::remove_file(path)?;
    Ok(1)
}
