use crate::config::AppConfig;
use crate::error::AppError;
use field_agent::manifest::{build_manifest_with_cache, Manifest};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

struct CachedManifest {
    built_at: Instant,
    manifest: Arc<Manifest>,
}

pub struct AppState {
    pub config: AppConfig,
    manifest: Mutex<Option<CachedManifest>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            manifest: Mutex::new(None),
        }
    }

    /// The archive manifest, rebuilt once it is older than the configured TTL.
    ///
    /// Concurrent callers wait on the same rebuild. Checksums of files whose
    /// size and mtime are unchanged carry over from the previous build.
    pub async fn manifest(&self) -> Result<Arc<Manifest>, AppError> {
        let mut cached = self.manifest.lock().await;

        if let Some(entry) = cached.as_ref() {
            if entry.built_at.elapsed() < self.config.manifest_ttl {
                return Ok(Arc::clone(&entry.manifest));
            }
        }

        let root = self.config.archive_root.clone();
        let extensions = self.config.extensions.clone();
        let previous = cached.as_ref().map(|entry| Arc::clone(&entry.manifest));

        let manifest = tokio::task::spawn_blocking(move || {
            build_manifest_with_cache(&root, &extensions, previous.as_deref())
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

        tracing::info!(
            "Built archive manifest: {} files, {} bytes",
            manifest.len(),
            manifest.total_bytes()
        );

        let manifest = Arc::new(manifest);
        *cached = Some(CachedManifest {
            built_at: Instant::now(),
            manifest: Arc::clone(&manifest),
        });
        Ok(manifest)
    }

    /// File count of the last built manifest, without triggering a rebuild.
    pub async fn cached_file_count(&self) -> Option<usize> {
        self.manifest
            .lock()
            .await
            .as_ref()
            .map(|entry| entry.manifest.len())
    }
}
