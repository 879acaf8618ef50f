//! File size and timestamp handling for mirrored files.
//!
//! Modification times travel between hosts as whole seconds since the Unix
//! epoch. Applied files get the archive's mtime stamped on them so that the
//! next manifest build can reuse cached hashes.

use std::fs::{self, File, Metadata};
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Size and modification time of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (seconds since Unix epoch, negative before 1970)
    pub mtime: i64,
}

impl FileStamp {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: metadata.len(),
            mtime: metadata.modified().map(system_time_to_secs).unwrap_or(0),
        }
    }

    /// Extract the stamp from a file path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }
}

pub fn system_time_to_secs(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

pub fn secs_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Stamp a modification time on an open file.
pub fn set_mtime(file: &File, secs: i64) -> std::io::Result<()> {
    file.set_modified(secs_to_system_time(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_extract_stamp() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let stamp = FileStamp::from_path(temp_file.path())?;

        assert_eq!(stamp.size, 12);
        assert!(stamp.mtime > 0);

        Ok(())
    }

    #[test]
    fn test_set_mtime() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        set_mtime(temp_file.as_file(), 1_600_000_000)?;

        let stamp = FileStamp::from_path(temp_file.path())?;
        assert_eq!(stamp.mtime, 1_600_000_000);

        Ok(())
    }

    #[test]
    fn test_time_conversion_before_epoch() {
        let t = secs_to_system_time(-90);
        assert_eq!(system_time_to_secs(t), -90);
    }
}
