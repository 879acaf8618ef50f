//! SHA-256 content hashing.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const BUFFER_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of a file's full content, streamed.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    hash_reader(file)
}

pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_hash_matches_bytes() -> io::Result<()> {
        let mut file = NamedTempFile::new()?;
        let data = vec![7u8; BUFFER_SIZE * 3 + 17];
        file.write_all(&data)?;
        file.flush()?;

        assert_eq!(hash_file(file.path())?, hash_bytes(&data));
        Ok(())
    }
}
