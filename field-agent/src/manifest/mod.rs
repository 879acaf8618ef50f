//! Checksum manifests of a mirrored tree.
//!
//! A [`Manifest`] is an immutable snapshot mapping root-relative paths to
//! their size, SHA-256 and mtime. The field host builds one per sync attempt
//! (reusing hashes from the persisted cache where size and mtime match) and
//! diffs it against the archive host's manifest.
//!
//! On the wire and on disk a manifest is a versioned document holding a list
//! of [`FileRecord`]s. Unknown fields are ignored when reading; duplicate or
//! unsafe paths are rejected.

pub mod cache;
pub mod diff;
pub mod hash;
pub mod path;

pub use cache::{load_cache, save_cache};
pub use diff::{diff, DiffResult};
pub use path::{resolve_under, validate_relative_path};

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current on-disk/on-wire document version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub checksum: String,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ManifestDocument", try_from = "ManifestDocument")]
pub struct Manifest {
    root_path: PathBuf,
    generated_at: DateTime<Utc>,
    files: BTreeMap<String, FileRecord>,
}

#[derive(Serialize, Deserialize)]
struct ManifestDocument {
    #[serde(default = "default_version")]
    version: u32,
    root_path: PathBuf,
    generated_at: DateTime<Utc>,
    #[serde(default)]
    files: Vec<FileRecord>,
}

fn default_version() -> u32 {
    MANIFEST_FORMAT_VERSION
}

impl From<Manifest> for ManifestDocument {
    fn from(manifest: Manifest) -> Self {
        ManifestDocument {
            version: MANIFEST_FORMAT_VERSION,
            root_path: manifest.root_path,
            generated_at: manifest.generated_at,
            files: manifest.files.into_values().collect(),
        }
    }
}

impl TryFrom<ManifestDocument> for Manifest {
    type Error = AgentError;

    fn try_from(doc: ManifestDocument) -> Result<Self> {
        Manifest::from_records(doc.root_path, doc.generated_at, doc.files)
    }
}

impl Manifest {
    pub fn empty(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            generated_at: Utc::now(),
            files: BTreeMap::new(),
        }
    }

    /// Build from records, rejecting unsafe and duplicate paths.
    pub fn from_records(
        root_path: PathBuf,
        generated_at: DateTime<Utc>,
        records: impl IntoIterator<Item = FileRecord>,
    ) -> Result<Self> {
        let mut files = BTreeMap::new();
        for record in records {
            validate_relative_path(&record.path)?;
            if files.contains_key(&record.path) {
                return Err(AgentError::Integrity {
                    path: record.path,
                    reason: "duplicate path in manifest".to_string(),
                });
            }
            files.insert(record.path.clone(), record);
        }

        Ok(Self {
            root_path,
            generated_at,
            files,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    /// Records in path order.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().fold(0u64, |total, r| total.saturating_add(r.size))
    }

    /// Keep only the records matching `keep`.
    pub fn retain(mut self, mut keep: impl FnMut(&FileRecord) -> bool) -> Self {
        self.files.retain(|_, record| keep(record));
        self
    }

    /// Same records, re-rooted. Used when the archive's manifest becomes the
    /// mirror's cache.
    pub fn with_root(mut self, root_path: impl Into<PathBuf>) -> Self {
        self.root_path = root_path.into();
        self
    }
}

/// Walk `root` and hash every file matching `extensions` (empty = all).
///
/// Files that cannot be read are skipped and counted, never fatal.
pub fn build_manifest(root: &Path, extensions: &[String]) -> Result<Manifest> {
    build_manifest_with_cache(root, extensions, None)
}

/// Like [`build_manifest`], but reuse the cached checksum of any file whose
/// size and mtime are unchanged.
pub fn build_manifest_with_cache(
    root: &Path,
    extensions: &[String],
    cache: Option<&Manifest>,
) -> Result<Manifest> {
    let options = WalkOptions::with_extensions(extensions);
    build_manifest_filtered(root, &options, cache, |_| true)
}

/// Walk `root` with `options` and hash the files whose relative path `keep`
/// accepts. Rejected files are never read.
pub fn build_manifest_filtered(
    root: &Path,
    options: &WalkOptions,
    cache: Option<&Manifest>,
    keep: impl Fn(&str) -> bool,
) -> Result<Manifest> {
    let outcome = walk_directory(root, options).map_err(|e| AgentError::io(root, e))?;

    let mut files = BTreeMap::new();
    let mut skipped = outcome.skipped;
    let mut reused = 0usize;

    for info in outcome.files {
        if !keep(&info.relative_path) {
            continue;
        }

        let cached = cache
            .and_then(|c| c.get(&info.relative_path))
            .filter(|r| r.size == info.size && r.mtime == info.mtime);

        let checksum = match cached {
            Some(record) => {
                reused += 1;
                record.checksum.clone()
            }
            None => match hash::hash_file(&info.path) {
                Ok(checksum) => checksum,
                Err(e) => {
                    warn!("Skipping {}: {}", info.path.display(), e);
                    skipped += 1;
                    continue;
                }
            },
        };

        files.insert(
            info.relative_path.clone(),
            FileRecord {
                path: info.relative_path,
                size: info.size,
                checksum,
                mtime: info.mtime,
            },
        );
    }

    if skipped > 0 {
        warn!("Skipped {} unreadable entries under {}", skipped, root.display());
    }
    debug!("Reused {} cached checksums", reused);
    info!("Built manifest for {}: {} files", root.display(), files.len());

    Ok(Manifest {
        root_path: root.to_path_buf(),
        generated_at: Utc::now(),
        files,
    })
}
