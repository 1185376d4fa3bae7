//! Crash-safe 8-byte value files
//!
//! A write goes to a sibling temp file, is synced, then renamed over the
//! destination. Readers therefore see either the previous value or the
//! new one, never a truncated file. Reads take no lock.

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of a stored value
pub const VALUE_LEN: usize = 8;

/// Reads and atomically replaces little-endian `u64` files
pub struct AtomicFileStore;

impl AtomicFileStore {
    /// Replace the value at `path`
    pub fn write(path: &Path, value: u64) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;

        let tmp = temp_sibling(path);
        let written = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp)?;
            file.write_all(&value.to_le_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(Error::io(format!("write {}", path.display()), e));
        }

        // Persist the rename itself; failure here only weakens durability
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!(dir = %dir.display(), error = %e, "Directory sync skipped");
        }
        Ok(())
    }

    /// Current value, `0` when absent or unreadable
    pub fn read(path: &Path) -> u64 {
        Self::try_read(path).unwrap_or(0)
    }

    /// Current value, `None` when the file is absent, short or unreadable
    pub fn try_read(path: &Path) -> Option<u64> {
        match fs::read(path) {
            Ok(bytes) if bytes.len() >= VALUE_LEN => {
                let mut buf = [0u8; VALUE_LEN];
                buf.copy_from_slice(&bytes[..VALUE_LEN]);
                Some(u64::from_le_bytes(buf))
            }
            Ok(bytes) => {
                debug!(path = %path.display(), len = bytes.len(), "Value file too short, treating as unknown");
                None
            }
            Err(_) => None,
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "value".to_string());
    path.with_file_name(format!(
        ".{}.{}.{:08x}.tmp",
        name,
        std::process::id(),
        rand::random::<u32>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.epoch");
        assert_eq!(AtomicFileStore::read(&path), 0);
        assert_eq!(AtomicFileStore::try_read(&path), None);
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("a.epoch");
        AtomicFileStore::write(&path, 41)?;
        AtomicFileStore::write(&path, 42)?;
        assert_eq!(AtomicFileStore::read(&path), 42);
        assert_eq!(std::fs::read(&path).unwrap().len(), VALUE_LEN);
        Ok(())
    }

    #[test]
    fn test_short_file_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.epoch");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        assert_eq!(AtomicFileStore::try_read(&path), None);
        assert_eq!(AtomicFileStore::read(&path), 0);
    }

    #[test]
    fn test_leftover_temp_file_does_not_affect_value() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.epoch");
        AtomicFileStore::write(&path, 7)?;

        // A writer killed before its rename leaves a partial temp file behind
        std::fs::write(dir.path().join(".a.epoch.999.deadbeef.tmp"), [0xffu8; 3]).unwrap();

        assert_eq!(AtomicFileStore::read(&path), 7);
        AtomicFileStore::write(&path, 8)?;
        assert_eq!(AtomicFileStore::read(&path), 8);
        Ok(())
    }
}
