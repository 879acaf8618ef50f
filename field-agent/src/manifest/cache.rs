//! Persisted manifest cache beside the mirrored tree.

use super::Manifest;
use crate::fs::atomic::StagedFile;
use crate::utils::{AgentError, Result};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Load a cached manifest. A missing or unreadable cache is not an error:
/// it only means the next build hashes everything.
pub fn load_cache(path: &Path) -> Option<Manifest> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Cannot open manifest cache {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_reader::<_, Manifest>(BufReader::new(file)) {
        Ok(manifest) => {
            debug!("Loaded manifest cache with {} files", manifest.len());
            Some(manifest)
        }
        Err(e) => {
            warn!("Ignoring corrupt manifest cache {}: {}", path.display(), e);
            None
        }
    }
}

/// Atomically replace the cache file.
pub fn save_cache(path: &Path, manifest: &Manifest) -> Result<()> {
    let staged = StagedFile::create(path).map_err(|e| AgentError::io(path, e))?;
    let mut writer = BufWriter::new(staged);
    serde_json::to_writer_pretty(&mut writer, manifest)?;
    writer.flush().map_err(|e| AgentError::io(path, e))?;

    let staged = writer
        .into_inner()
        .map_err(|e| AgentError::io(path, e.into_error()))?;
    staged.commit().map_err(|e| AgentError::io(path, e))?;

    debug!("Saved manifest cache with {} files to {}", manifest.len(), path.display());
    Ok(())
}
