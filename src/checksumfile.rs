//! Single-file store with content checksums and crash-safe rewrites.
//!
//! Layout on disk: 8-byte big-endian payload length, 32-byte SHA-256 of the
//! payload, then the payload itself. Writes go to a temp file which is
//! fsynced and renamed over the target, followed by an fsync of the
//! containing directory.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{KronosError, Result};

const HEADER_LEN: usize = 8 + 32;

pub fn read(path: &Path) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    if data.len() < HEADER_LEN {
        return Err(corrupt(path));
    }
    let payload_len = u64::from_be_bytes(data[0..8].try_into().unwrap()) as usize;
    let payload = &data[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(corrupt(path));
    }
    let digest = Sha256::digest(payload);
    if digest.as_slice() != &data[8..HEADER_LEN] {
        return Err(corrupt(path));
    }
    Ok(payload.to_vec())
}

pub fn write(path: &Path, payload: &[u8]) -> Result<()> {
    let tmp_path = match path.file_name() {
        Some(name) => {
            let mut tmp = name.to_os_string();
            tmp.push(".tmp");
            path.with_file_name(tmp)
        }
        None => return Err(KronosError::Config(format!("invalid path: {:?}", path))),
    };

    let digest = Sha256::digest(payload);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&(payload.len() as u64).to_be_bytes())?;
    file.write_all(digest.as_slice())?;
    file.write_all(payload)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

fn corrupt(path: &Path) -> KronosError {
    KronosError::Corrupt {
        path: path.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster_info");
        let payload = b"some cluster metadata".to_vec();

        write(&path, &payload).unwrap();
        assert_eq!(read(&path).unwrap(), payload);

        // Rewrite replaces atomically.
        let payload2 = b"replacement".to_vec();
        write(&path, &payload2).unwrap();
        assert_eq!(read(&path).unwrap(), payload2);
        assert!(!dir.path().join("cluster_info.tmp").exists());
    }

    #[test]
    fn test_empty_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        write(&path, &[]).unwrap();
        assert_eq!(read(&path).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster_info");
        write(&path, b"payload").unwrap();

        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, &raw).unwrap();

        assert!(matches!(read(&path), Err(KronosError::Corrupt { .. })));
    }

    #[test]
    fn test_truncated_file_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster_info");
        write(&path, b"payload").unwrap();

        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 2]).unwrap();

        assert!(matches!(read(&path), Err(KronosError::Corrupt { .. })));
    }

    #[test]
    fn test_corrupt_header_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short");
        fs::write(&path, b"tiny").unwrap();
        assert!(matches!(read(&path), Err(KronosError::Corrupt { .. })));
    }
}
