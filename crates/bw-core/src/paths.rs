//! Filename hygiene for the upload directory.
//!
//! Every filename that crosses the wire is reduced to a bare basename before
//! it touches the disk; `..`, path separators, and NUL are rejected outright.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("filename cannot be empty")]
    Empty,
    #[error("illegal character sequence in filename: {0}")]
    IllegalSequence(String),
    #[error("invalid filename after sanitization")]
    Invalid,
}

/// Reduce a wire-supplied filename to a safe basename.
///
/// Rejects empty names, NUL bytes, `..`, and both slash flavors.  The result
/// is guaranteed to be a single non-dot path component.
pub fn sanitize_filename(filename: &str) -> Result<String, SecurityError> {
    if filename.is_empty() {
        return Err(SecurityError::Empty);
    }
    if filename.contains('\0') {
        return Err(SecurityError::IllegalSequence("NUL".to_owned()));
    }
    for needle in ["..", "/", "\\"] {
        if filename.contains(needle) {
            return Err(SecurityError::IllegalSequence(needle.to_owned()));
        }
    }

    let basename = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(SecurityError::Invalid)?;
    if basename.is_empty() || basename == "." || basename == ".." {
        return Err(SecurityError::Invalid);
    }
    Ok(basename.to_owned())
}

/// Join a sanitized filename onto a base directory.
pub fn safe_join(base: &Path, filename: &str) -> Result<PathBuf, SecurityError> {
    Ok(base.join(sanitize_filename(filename)?))
}
