//! Validation of root-relative paths received from a peer.

use crate::utils::{AgentError, Result};
use std::path::{Path, PathBuf};

/// Accept only normalized, `/`-separated, root-relative paths: no absolute
/// paths, no `..` or `.` components, no empty components, no backslashes.
pub fn validate_relative_path(path: &str) -> Result<()> {
    let invalid = || AgentError::InvalidPath(path.to_string());

    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return Err(invalid());
    }

    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(invalid());
        }
    }

    Ok(())
}

/// Resolve a validated relative path under `root`.
pub fn resolve_under(root: &Path, path: &str) -> Result<PathBuf> {
    validate_relative_path(path)?;
    Ok(path.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part)))
}
