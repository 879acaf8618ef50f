//! Write-then-rename file staging.
//!
//! Content goes to a uniquely named sibling (`<name>.<uuid>.partial`) and is
//! only renamed over the final path by [`StagedFile::commit`]. A staged file
//! dropped without commit removes its temporary sibling, so the final path
//! only ever holds the old or the new content.

use super::walker::PARTIAL_SUFFIX;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct StagedFile {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    bytes_written: u64,
}

impl StagedFile {
    /// Create the temporary sibling, creating parent directories as needed.
    pub fn create(final_path: impl AsRef<Path>) -> io::Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let file_name = final_path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy()
            .into_owned();

        let temp_path = final_path.with_file_name(format!(
            "{}.{}{}",
            file_name,
            uuid::Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));

        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&temp_path)?;

        Ok(Self {
            final_path,
            temp_path,
            file: Some(file),
            hasher: Sha256::new(),
            bytes_written: 0,
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Hex SHA-256 of everything written so far.
    pub fn checksum(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Stamp the modification time on the staged content.
    pub fn set_mtime(&self, secs: i64) -> io::Result<()> {
        match &self.file {
            Some(file) => super::metadata::set_mtime(file, secs),
            None => Err(finalized()),
        }
    }

    /// Sync and rename over the final path.
    pub fn commit(mut self) -> io::Result<PathBuf> {
        let file = self.file.take().ok_or_else(finalized)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&self.temp_path, &self.final_path) {
            self.discard();
            return Err(e);
        }

        debug!(
            "Committed {} bytes to {}",
            self.bytes_written,
            self.final_path.display()
        );
        Ok(std::mem::take(&mut self.final_path))
    }

    fn discard(&mut self) {
        self.file.take();
        match fs::remove_file(&self.temp_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to clean up temp file {}: {}",
                self.temp_path.display(),
                e
            ),
        }
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file.as_mut().ok_or_else(finalized)?;
        let n = file.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().ok_or_else(finalized)?.flush()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        // commit() empties final_path once the rename happened
        if !self.final_path.as_os_str().is_empty() {
            self.discard();
        }
    }
}

fn finalized() -> io::Error {
    io::Error::other("staged file already finalized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn leftovers(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .count()
    }

    #[test]
    fn test_commit_replaces_final_path() -> io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("nested/chart.png");

        let mut staged = StagedFile::create(&target)?;
        staged.write_all(b"new content")?;
        assert!(!target.exists());

        let committed = staged.commit()?;
        assert_eq!(committed, target);
        assert_eq!(fs::read(&target)?, b"new content");
        assert_eq!(leftovers(target.parent().unwrap()), 0);
        Ok(())
    }

    #[test]
    fn test_interrupted_write_keeps_old_content() -> io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("chart.png");
        fs::write(&target, b"old content")?;

        let mut staged = StagedFile::create(&target)?;
        staged.write_all(b"half of the new")?;
        // Fault between write and rename
        drop(staged);

        assert_eq!(fs::read(&target)?, b"old content");
        assert_eq!(leftovers(dir.path()), 0);
        Ok(())
    }

    #[test]
    fn test_checksum_tracks_written_bytes() -> io::Result<()> {
        let dir = TempDir::new()?;
        let mut staged = StagedFile::create(dir.path().join("a.png"))?;
        staged.write_all(b"abc")?;

        assert_eq!(staged.bytes_written(), 3);
        assert_eq!(
            staged.checksum(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn test_unique_temp_names() -> io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("a.png");
        let first = StagedFile::create(&target)?;
        let second = StagedFile::create(&target)?;
        assert_ne!(first.temp_path(), second.temp_path());
        Ok(())
    }
}
