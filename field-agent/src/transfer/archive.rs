//! Batch archives: a tar stream of the requested files, zstd-compressed on
//! the wire.
//!
//! The archive host packs with [`pack_batch`]. The field host decompresses
//! while downloading into a staging file and applies it with
//! [`unpack_batch`], which verifies every entry against the archive's
//! manifest record before renaming it into place.

use crate::fs::atomic::StagedFile;
use crate::fs::walker::to_relative_string;
use crate::manifest::{resolve_under, validate_relative_path, FileRecord};
use crate::utils::{AgentError, Result};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use tracing::{debug, warn};

pub const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackSummary {
    pub packed: usize,
    pub absent: usize,
    pub bytes: u64,
}

/// Write a zstd-compressed tar of `paths` (relative to `root`) to `writer`.
///
/// Paths the host no longer has are left out of the archive.
pub fn pack_batch<W: Write>(root: &Path, paths: &[String], writer: W) -> Result<PackSummary> {
    let archive_err = |e: io::Error| AgentError::Archive(e.to_string());

    let encoder = zstd::Encoder::new(writer, ZSTD_LEVEL).map_err(archive_err)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    let mut summary = PackSummary::default();

    for path in paths {
        let full_path = resolve_under(root, path)?;
        let mut file = match File::open(&full_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Requested file no longer present: {}", path);
                summary.absent += 1;
                continue;
            }
            Err(e) => return Err(AgentError::io(full_path, e)),
        };

        let size = file.metadata().map_err(|e| AgentError::io(&full_path, e))?.len();
        builder
            .append_file(path, &mut file)
            .map_err(|e| AgentError::io(&full_path, e))?;

        summary.packed += 1;
        summary.bytes += size;
    }

    let encoder = builder.into_inner().map_err(archive_err)?;
    encoder.finish().map_err(archive_err)?;

    Ok(summary)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Applied paths with their sizes.
    pub applied: Vec<(String, u64)>,
    pub failed: Vec<String>,
}

/// Apply an (already decompressed) tar archive under `root`.
///
/// Each expected entry is written to a staged sibling, checked against its
/// record's size and checksum, stamped with the record's mtime and only then
/// renamed into place. Expected paths missing from the archive, or failing
/// verification, are reported as failed; unexpected entries are ignored.
pub fn unpack_batch(tar_path: &Path, root: &Path, expected: &[FileRecord]) -> Result<ApplyReport> {
    let file = File::open(tar_path).map_err(|e| AgentError::io(tar_path, e))?;
    let mut archive = tar::Archive::new(BufReader::new(file));

    let wanted: HashMap<&str, &FileRecord> =
        expected.iter().map(|r| (r.path.as_str(), r)).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut report = ApplyReport::default();

    let entries = archive
        .entries()
        .map_err(|e| AgentError::Archive(format!("unreadable batch archive: {}", e)))?;

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // Truncated or corrupt stream: everything not yet seen fails below
                warn!("Batch archive ended early: {}", e);
                break;
            }
        };

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let Some(path) = entry.path().ok().and_then(|p| to_relative_string(&p)) else {
            warn!("Ignoring archive entry with an unusable path");
            continue;
        };
        if validate_relative_path(&path).is_err() {
            warn!("Ignoring unsafe archive entry: {}", path);
            continue;
        }
        let Some(record) = wanted.get(path.as_str()).copied() else {
            debug!("Ignoring unexpected archive entry: {}", path);
            continue;
        };
        if !seen.insert(path.clone()) {
            continue;
        }

        match apply_entry(&mut entry, root, record) {
            Ok(()) => report.applied.push((path, record.size)),
            Err(e) => {
                warn!("Failed to apply {}: {}", path, e);
                report.failed.push(path);
            }
        }
    }

    for record in expected {
        if !seen.contains(&record.path) {
            warn!("Expected file missing from batch archive: {}", record.path);
            report.failed.push(record.path.clone());
        }
    }

    Ok(report)
}

fn apply_entry<R: io::Read>(entry: &mut R, root: &Path, record: &FileRecord) -> Result<()> {
    let final_path = resolve_under(root, &record.path)?;
    let mut staged = StagedFile::create(&final_path).map_err(|e| AgentError::io(&final_path, e))?;

    io::copy(entry, &mut staged).map_err(|e| AgentError::io(staged.temp_path(), e))?;

    if staged.bytes_written() != record.size {
        return Err(AgentError::Integrity {
            path: record.path.clone(),
            reason: format!("expected {} bytes, got {}", record.size, staged.bytes_written()),
        });
    }
    let checksum = staged.checksum();
    if checksum != record.checksum {
        return Err(AgentError::Integrity {
            path: record.path.clone(),
            reason: format!("checksum mismatch (got {})", checksum),
        });
    }

    staged
        .set_mtime(record.mtime)
        .map_err(|e| AgentError::io(&final_path, e))?;
    staged.commit().map_err(|e| AgentError::io(&final_path, e))?;
    Ok(())
}
