//! Sync engine - mirrors the archive host's tree onto the local root.
//!
//! One run:
//! 1. checks the link and the peer through the resilience layer,
//! 2. builds the local manifest (reusing cached hashes) and fetches the
//!    remote one,
//! 3. diffs them from the mirror's point of view,
//! 4. deletes local files the archive no longer has,
//! 5. fetches the changed files in size-bounded batches, a few in flight at
//!    once, applying each file with write-then-rename,
//! 6. persists the applied manifest as the new local cache.
//!
//! A stop request is honored between batches: batches already in flight
//! finish, the rest are counted as skipped and the cache is left untouched.

use super::archive::unpack_batch;
use super::batch::{plan_batches, Batch};
use super::counting_stream::CountingStream;
use crate::fs::walker::{WalkOptions, STAGING_DIR_NAME};
use crate::manifest::{
    build_manifest_filtered, diff, load_cache, resolve_under, save_cache, FileRecord, Manifest,
};
use crate::protocol::{BatchRequest, BATCH_ROUTE, MANIFEST_ROUTE};
use crate::resilience::{NetworkError, NetworkErrorKind, ResilienceLayer};
use crate::supervisor::{ActionError, SupervisedAction};
use crate::updates::{check_all, product_for, UpdateInfo};
use crate::utils::{AgentError, Result};
use async_compression::tokio::bufread::ZstdDecoder;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of batch requests in flight.
pub const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 4;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub root: PathBuf,
    pub extensions: Vec<String>,
    pub batch_ceiling: u64,
    pub max_concurrent_batches: usize,
    pub cache_file_name: String,
}

impl SyncSettings {
    pub fn cache_path(&self) -> PathBuf {
        self.root.join(&self.cache_file_name)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }
}

/// Which paths the mirror keeps: files passing the extension filter plus
/// every product file, never the manifest cache itself.
#[derive(Debug, Clone)]
struct MirrorFilter {
    walk: WalkOptions,
    cache_file_name: String,
}

impl MirrorFilter {
    fn new(settings: &SyncSettings) -> Self {
        Self {
            walk: WalkOptions::with_extensions(&settings.extensions),
            cache_file_name: settings.cache_file_name.clone(),
        }
    }

    fn includes(&self, path: &str) -> bool {
        path != self.cache_file_name
            && (self.walk.matches_extension(Path::new(path)) || product_for(path).is_some())
    }

    /// Walk options for the local tree. Extensions are checked by
    /// [`MirrorFilter::includes`] so product files are not lost to the walk.
    fn walk_options(&self) -> WalkOptions {
        WalkOptions::default().excluding(self.cache_file_name.clone())
    }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub files_transferred: usize,
    pub bytes_transferred: u64,
    pub files_failed: usize,
    pub failed_paths: Vec<String>,
    pub files_deleted: usize,
    /// Changed files not attempted because of a stop request.
    pub files_skipped: usize,
    /// Compressed bytes received from the peer.
    pub wire_bytes: u64,
    pub duration_secs: f64,
    pub success: bool,
    /// Products the archive has newer content for, as of this run's diff.
    pub updates: Vec<UpdateInfo>,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    applied: Vec<(String, u64)>,
    failed: Vec<String>,
    skipped: usize,
}

pub struct SyncEngine {
    settings: SyncSettings,
    filter: MirrorFilter,
    resilience: Arc<ResilienceLayer>,
}

impl SyncEngine {
    pub fn new(settings: SyncSettings, resilience: Arc<ResilienceLayer>) -> Self {
        Self {
            filter: MirrorFilter::new(&settings),
            settings,
            resilience,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    /// Run one sync against the peer.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncResult> {
        let started = Instant::now();
        info!("Starting sync of {}", self.settings.root.display());

        self.resilience.ensure_reachable().await?;

        tokio::fs::create_dir_all(&self.settings.root)
            .await
            .map_err(|e| AgentError::io(&self.settings.root, e))?;

        let local = self.build_local_manifest().await?;
        let remote = self.fetch_remote_manifest().await?;

        let changes = diff(&remote, &local);
        info!(
            "Diff: {} changed, {} deleted (remote {} files, local {} files)",
            changes.changed.len(),
            changes.deleted.len(),
            remote.len(),
            local.len()
        );

        let updates = check_all(&local, &remote);
        for update in &updates {
            info!(
                "{} update available: {} file(s), {} bytes",
                update.kind,
                update.stale_files.len(),
                update.download_bytes
            );
        }

        let mut result = SyncResult {
            files_deleted: self.apply_deletions(&changes.deleted).await,
            updates,
            ..SyncResult::default()
        };

        let batches = plan_batches(&changes.changed, &remote, self.settings.batch_ceiling);
        if !batches.is_empty() {
            self.transfer_batches(batches, &remote, cancel, &mut result).await?;
        }

        let stopped = cancel.is_cancelled() && result.files_skipped > 0;
        if stopped {
            info!(
                "Sync stopped early: {} files skipped, manifest cache not updated",
                result.files_skipped
            );
        } else {
            self.persist_cache(remote, &local, &result.failed_paths).await?;
        }

        result.files_failed = result.failed_paths.len();
        result.success = result.files_failed == 0 && result.files_skipped == 0;
        result.duration_secs = started.elapsed().as_secs_f64();

        info!(
            "Sync finished: {} transferred ({} bytes, {} on the wire), {} deleted, {} failed, {} skipped in {:.1}s",
            result.files_transferred,
            result.bytes_transferred,
            result.wire_bytes,
            result.files_deleted,
            result.files_failed,
            result.files_skipped,
            result.duration_secs
        );

        Ok(result)
    }

    async fn build_local_manifest(&self) -> Result<Manifest> {
        let root = self.settings.root.clone();
        let filter = self.filter.clone();
        let cache_path = self.settings.cache_path();

        tokio::task::spawn_blocking(move || {
            let cache = load_cache(&cache_path);
            build_manifest_filtered(&root, &filter.walk_options(), cache.as_ref(), |path| {
                filter.includes(path)
            })
        })
        .await
        .map_err(|e| AgentError::Task(format!("manifest build panicked: {}", e)))?
    }

    async fn fetch_remote_manifest(&self) -> Result<Manifest> {
        let body = self
            .resilience
            .pool()
            .execute(|endpoint| async move {
                let response = endpoint
                    .client()
                    .get(endpoint.url(MANIFEST_ROUTE))
                    .timeout(endpoint.request_timeout())
                    .send()
                    .await?;
                let response = check_status(response)?;
                Ok::<_, NetworkError>(response.bytes().await?)
            })
            .await?;

        let manifest: Manifest = serde_json::from_slice::<Manifest>(&body)?
            .retain(|record| self.filter.includes(&record.path));
        debug!(
            "Fetched remote manifest: {} files, {} bytes",
            manifest.len(),
            manifest.total_bytes()
        );
        Ok(manifest)
    }

    /// Remove local files the archive no longer has. Best effort.
    async fn apply_deletions(&self, deleted: &[String]) -> usize {
        let mut removed = 0;

        for path in deleted {
            let full_path = match resolve_under(&self.settings.root, path) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Not deleting {}: {}", path, e);
                    continue;
                }
            };

            match tokio::fs::remove_file(&full_path).await {
                Ok(()) => {
                    debug!("Deleted {}", path);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed += 1,
                Err(e) => warn!("Failed to delete {}: {}", full_path.display(), e),
            }
        }

        removed
    }

    async fn transfer_batches(
        &self,
        batches: Vec<Batch>,
        remote: &Manifest,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) -> Result<()> {
        let staging = self.settings.staging_dir();
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| AgentError::io(&staging, e))?;

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_batches.max(1)));
        let wire_bytes = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(batches.len());

        info!(
            "Transferring {} batches ({} in flight)",
            batches.len(),
            self.settings.max_concurrent_batches
        );

        for batch in batches {
            let expected: Vec<FileRecord> = batch
                .paths
                .iter()
                .filter_map(|p| remote.get(p).cloned())
                .collect();

            let sem = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let resilience = Arc::clone(&self.resilience);
            let root = self.settings.root.clone();
            let staging = staging.clone();
            let wire_bytes = Arc::clone(&wire_bytes);

            let handle = tokio::spawn(async move {
                // Stop requests are honored at batch boundaries only
                if cancel.is_cancelled() {
                    return BatchOutcome {
                        skipped: expected.len(),
                        ..BatchOutcome::default()
                    };
                }

                let permit = tokio::select! {
                    permit = sem.acquire_owned() => permit,
                    _ = cancel.cancelled() => {
                        return BatchOutcome { skipped: expected.len(), ..BatchOutcome::default() };
                    }
                };
                let Ok(_permit) = permit else {
                    return BatchOutcome {
                        failed: expected.iter().map(|r| r.path.clone()).collect(),
                        ..BatchOutcome::default()
                    };
                };
                if cancel.is_cancelled() {
                    return BatchOutcome {
                        skipped: expected.len(),
                        ..BatchOutcome::default()
                    };
                }

                match run_batch(&resilience, &root, &staging, &expected, &wire_bytes).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Batch of {} files failed: {}", expected.len(), e);
                        BatchOutcome {
                            failed: expected.iter().map(|r| r.path.clone()).collect(),
                            ..BatchOutcome::default()
                        }
                    }
                }
            });

            handles.push((batch, handle));
        }

        for (batch, handle) in handles {
            match handle.await {
                Ok(outcome) => {
                    result.files_transferred += outcome.applied.len();
                    result.bytes_transferred += outcome.applied.iter().map(|(_, size)| size).sum::<u64>();
                    result.failed_paths.extend(outcome.failed);
                    result.files_skipped += outcome.skipped;
                }
                Err(e) => {
                    warn!("Batch task panicked: {}", e);
                    result.failed_paths.extend(batch.paths);
                }
            }
        }

        result.wire_bytes = wire_bytes.load(Ordering::Relaxed);

        // Only removes the directory when nothing is left in it
        let _ = tokio::fs::remove_dir(&staging).await;

        Ok(())
    }

    /// Save the applied state as the local cache, minus failed paths so
    /// their hashes are recomputed next time.
    ///
    /// Files that already matched keep their local record: only transferred
    /// files carry the archive's mtime, and the cache is only reused on an
    /// exact size and mtime match.
    async fn persist_cache(&self, remote: Manifest, local: &Manifest, failed: &[String]) -> Result<()> {
        let root = self.settings.root.clone();
        let cache_path = self.settings.cache_path();
        let generated_at = remote.generated_at();
        let failed: HashSet<&str> = failed.iter().map(String::as_str).collect();
        let records: Vec<FileRecord> = remote
            .records()
            .filter(|r| !failed.contains(r.path.as_str()))
            .map(|r| match local.get(&r.path) {
                Some(existing) if existing.checksum == r.checksum => existing.clone(),
                _ => r.clone(),
            })
            .collect();

        tokio::task::spawn_blocking(move || {
            let applied = Manifest::from_records(root, generated_at, records)?;
            save_cache(&cache_path, &applied)
        })
        .await
        .map_err(|e| AgentError::Task(format!("cache save panicked: {}", e)))?
    }
}

/// Request one batch, stream it to a staging file, and apply it.
async fn run_batch(
    resilience: &ResilienceLayer,
    root: &Path,
    staging: &Path,
    expected: &[FileRecord],
    wire_bytes: &Arc<AtomicU64>,
) -> Result<BatchOutcome> {
    let request = BatchRequest {
        files: expected.iter().map(|r| r.path.clone()).collect(),
    };

    let response = resilience
        .pool()
        .execute(|endpoint| async move {
            let response = endpoint
                .client()
                .post(endpoint.url(BATCH_ROUTE))
                .timeout(endpoint.request_timeout() * 2)
                .json(&request)
                .send()
                .await?;
            check_status(response)
        })
        .await?;

    let tar_path = staging.join(format!("batch-{}.tar", uuid::Uuid::new_v4().simple()));
    let download = download_tar(response, &tar_path, wire_bytes).await;

    let outcome = match download {
        Ok(()) => {
            let root = root.to_path_buf();
            let expected = expected.to_vec();
            let tar = tar_path.clone();
            tokio::task::spawn_blocking(move || unpack_batch(&tar, &root, &expected))
                .await
                .map_err(|e| AgentError::Task(format!("batch apply panicked: {}", e)))
                .and_then(|r| r)
        }
        Err(e) => Err(e),
    };

    if let Err(e) = tokio::fs::remove_file(&tar_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove staging file {}: {}", tar_path.display(), e);
        }
    }

    let report = outcome?;
    Ok(BatchOutcome {
        applied: report.applied,
        failed: report.failed,
        skipped: 0,
    })
}

/// Decompress the response body into a plain tar file.
async fn download_tar(
    response: reqwest::Response,
    tar_path: &Path,
    wire_bytes: &Arc<AtomicU64>,
) -> Result<()> {
    let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
    let counted = CountingStream::new(body, Arc::clone(wire_bytes));
    let mut decoder = ZstdDecoder::new(StreamReader::new(counted));

    let mut file = tokio::fs::File::create(tar_path)
        .await
        .map_err(|e| AgentError::io(tar_path, e))?;

    tokio::io::copy(&mut decoder, &mut file)
        .await
        .map_err(|e| match e.get_ref().and_then(|inner| inner.downcast_ref::<reqwest::Error>()) {
            Some(_) => AgentError::Network(NetworkError::from(e)),
            None => AgentError::io(tar_path, e),
        })?;
    file.flush().await.map_err(|e| AgentError::io(tar_path, e))?;

    Ok(())
}

fn check_status(response: reqwest::Response) -> std::result::Result<reqwest::Response, NetworkError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(NetworkError::new(
            NetworkErrorKind::Remote(status.as_u16()),
            format!("{} returned {}", response.url().path(), status),
        ))
    }
}

#[async_trait]
impl SupervisedAction for SyncEngine {
    type Output = SyncResult;

    fn name(&self) -> &str {
        "sync"
    }

    async fn run(&self, cancel: &CancellationToken) -> std::result::Result<SyncResult, ActionError> {
        let result = self.sync(cancel).await?;
        if result.files_failed > 0 {
            return Err(ActionError::retry(format!(
                "{} of {} files failed: {}",
                result.files_failed,
                result.files_failed + result.files_transferred,
                result.failed_paths.join(", ")
            )));
        }
        if result.files_skipped > 0 {
            return Err(ActionError::retry(format!(
                "sync stopped before completion: {} files skipped",
                result.files_skipped
            )));
        }
        Ok(result)
    }
}
