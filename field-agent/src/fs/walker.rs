//! Directory traversal restricted to an extension set.
//!
//! The walk never fails because of a single bad entry: unreadable files and
//! directories are logged and counted, and the walk carries on. Only an
//! unreadable root is reported as an error.

use crate::fs::metadata::FileStamp;
use std::path::{Component, Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Name of the persisted manifest cache inside a mirrored tree.
pub const MANIFEST_CACHE_NAME: &str = ".sync_manifest.json";

/// Directory holding in-flight batch archives inside a mirrored tree.
pub const STAGING_DIR_NAME: &str = ".sync-tmp";

/// Suffix of temporary sibling files written before an atomic rename.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Entry names to skip; a leading `*` matches by suffix (`*.partial`)
    pub exclude_patterns: Vec<String>,

    /// Lower-case extensions without the dot; empty means every file
    pub extensions: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: vec![
                MANIFEST_CACHE_NAME.to_string(),
                STAGING_DIR_NAME.to_string(),
                format!("*{}", PARTIAL_SUFFIX),
                ".DS_Store".to_string(),
            ],
            extensions: Vec::new(),
        }
    }
}

impl WalkOptions {
    /// Default excludes plus the given extension filter.
    ///
    /// Extensions are normalised: `".PNG"`, `"png"` and `"Png"` are the same.
    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: normalize_extensions(extensions),
            ..Self::default()
        }
    }

    /// Also skip entries named `name`.
    pub fn excluding(mut self, name: impl Into<String>) -> Self {
        self.exclude_patterns.push(name.into());
        self
    }

    /// Whether the file at `path` passes the extension filter.
    pub fn matches_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            }
            None => false,
        }
    }
}

/// Lower-case extensions and strip any leading dot.
pub fn normalize_extensions<I, S>(extensions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    extensions
        .into_iter()
        .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Root-relative, `/`-separated path
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,

    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,
}

/// Files found by a walk plus the number of entries that had to be skipped.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub files: Vec<FileInfo>,
    pub skipped: usize,
}

/// Walk a directory tree and collect every file matching the options.
///
/// A missing root yields an empty outcome; an unreadable root is an error.
///
/// # Example
/// ```no_run
/// use field_agent::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let outcome = walk_directory(Path::new("/srv/charts"), &WalkOptions::with_extensions(["png"])).unwrap();
/// println!("Found {} files ({} skipped)", outcome.files.len(), outcome.skipped);
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<WalkOutcome> {
    let mut outcome = WalkOutcome::default();

    if !root.exists() {
        return Ok(outcome);
    }

    let mut walker = WalkDir::new(root).follow_links(options.follow_links);

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_patterns));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                outcome.skipped += 1;
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        if !options.matches_extension(entry.path()) {
            continue;
        }

        match file_info(&entry, root) {
            Ok(Some(info)) => outcome.files.push(info),
            Ok(None) => {}
            Err(e) => {
                warn!("Skipping {}: {}", entry.path().display(), e);
                outcome.skipped += 1;
            }
        }
    }

    Ok(outcome)
}

/// Build a [`FileInfo`] for a walked entry. Symlinks to directories, broken
/// symlinks and non-UTF-8 names yield `None`.
fn file_info(entry: &DirEntry, root: &Path) -> std::io::Result<Option<FileInfo>> {
    let path = entry.path().to_path_buf();

    // Resolve symlinks to the real file
    let metadata = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(_) if entry.path_is_symlink() => return Ok(None),
        Err(e) => return Err(e),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let relative = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return Ok(None),
    };
    let Some(relative_path) = to_relative_string(relative) else {
        warn!("Skipping non UTF-8 path: {}", path.display());
        return Ok(None);
    };

    let stamp = FileStamp::from_metadata(&metadata);

    Ok(Some(FileInfo {
        path,
        relative_path,
        size: stamp.size,
        mtime: stamp.mtime,
    }))
}

/// Join the normal components of a relative path with `/`.
pub fn to_relative_string(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();

    patterns.iter().any(|pattern| match pattern.strip_prefix('*') {
        Some(suffix) => file_name.ends_with(suffix),
        None => file_name == pattern.as_str(),
    })
}
