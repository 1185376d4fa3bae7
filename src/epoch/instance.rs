//! Per-instance epoch files
//!
//! Every logical database instance gets one 8-byte epoch file under
//! `<base_path>/epochs`, named by an xxh3 hash of the deployment's
//! isolation key and the instance identity. Increments serialize on the
//! striped lock for the instance; reads never lock.
//!
//! Older deployments named the file by a truncated SHA-256 digest. A
//! read that only finds the legacy file returns its value and, when the
//! stripe is free, copies it forward and removes the legacy file.

use super::atomic_file::AtomicFileStore;
use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::metrics::EPOCH_INCREMENTS;
use crate::sync::StripedLockPool;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use xxhash_rust::xxh3::xxh3_64;

/// File extension of epoch files (current and legacy naming)
pub const EPOCH_EXTENSION: &str = "epoch";

pub struct InstanceEpochStore {
    dir: PathBuf,
    isolation_key: String,
    locks: Arc<StripedLockPool>,
    timeout: Duration,
}

impl InstanceEpochStore {
    pub fn new(config: &CoordinationConfig) -> Result<Self> {
        Self::with_pool(config, Arc::new(StripedLockPool::new(config)))
    }

    /// Share an existing lock pool
    pub fn with_pool(config: &CoordinationConfig, locks: Arc<StripedLockPool>) -> Result<Self> {
        let dir = config.epoch_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;

        Ok(Self {
            dir,
            isolation_key: config.isolation_key.clone(),
            locks,
            timeout: config.lock_timeout(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn locks(&self) -> &Arc<StripedLockPool> {
        &self.locks
    }

    /// Epoch file for `instance_id` under the current naming scheme
    pub fn epoch_path(&self, instance_id: &str) -> PathBuf {
        let hash = xxh3_64(self.hash_input(instance_id).as_bytes());
        self.dir.join(format!("{:016x}.{}", hash, EPOCH_EXTENSION))
    }

    /// Epoch file for `instance_id` under the retired SHA-256 naming scheme
    pub fn legacy_epoch_path(&self, instance_id: &str) -> PathBuf {
        let digest = Sha256::digest(self.hash_input(instance_id).as_bytes());
        let name = hex::encode(&digest[..16]);
        self.dir.join(format!("{}.{}", name, EPOCH_EXTENSION))
    }

    fn hash_input(&self, instance_id: &str) -> String {
        format!("{}\u{0}{}", self.isolation_key, instance_id)
    }

    /// Current epoch of `instance_id`, `0` if it was never incremented
    pub fn get_epoch(&self, instance_id: &str) -> u64 {
        let path = self.epoch_path(instance_id);
        if let Some(value) = AtomicFileStore::try_read(&path) {
            return value;
        }

        let legacy = self.legacy_epoch_path(instance_id);
        match AtomicFileStore::try_read(&legacy) {
            Some(value) => {
                self.migrate_legacy(instance_id, value, &path, &legacy);
                value
            }
            None => 0,
        }
    }

    /// Current epoch without migrating a legacy file
    ///
    /// One small file read (two when only a legacy file exists) and never a
    /// write, for callers on latency-sensitive paths.
    pub fn peek_epoch(&self, instance_id: &str) -> u64 {
        AtomicFileStore::try_read(&self.epoch_path(instance_id))
            .or_else(|| AtomicFileStore::try_read(&self.legacy_epoch_path(instance_id)))
            .unwrap_or(0)
    }

    /// Bump the epoch of `instance_id` and return the new value
    ///
    /// Waits at most the configured lock timeout for the instance's stripe,
    /// then fails with [`Error::CoordinationTimeout`].
    #[instrument(skip(self), level = "debug")]
    pub fn increment_epoch(&self, instance_id: &str) -> Result<u64> {
        let _guard = self.locks.lock_for(instance_id).acquire(self.timeout)?;

        let path = self.epoch_path(instance_id);
        let (current, legacy) = match AtomicFileStore::try_read(&path) {
            Some(value) => (value, None),
            None => {
                let legacy = self.legacy_epoch_path(instance_id);
                match AtomicFileStore::try_read(&legacy) {
                    Some(value) => (value, Some(legacy)),
                    None => (0, None),
                }
            }
        };

        let next = current.saturating_add(1);
        AtomicFileStore::write(&path, next)?;
        if let Some(legacy) = legacy {
            remove_legacy(&legacy);
        }

        EPOCH_INCREMENTS.with_label_values(&["instance"]).inc();
        debug!(epoch = next, "Instance epoch incremented");
        Ok(next)
    }

    /// Copy a legacy value forward; failures are logged and ignored
    fn migrate_legacy(&self, instance_id: &str, value: u64, path: &Path, legacy: &Path) {
        let guard = match self.locks.lock_for(instance_id).try_acquire() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(instance = instance_id, "Epoch stripe busy, legacy migration deferred");
                return;
            }
            Err(e) => {
                warn!(instance = instance_id, error = %e, "Legacy epoch migration failed");
                return;
            }
        };

        // Someone may have written the current file since our read
        if AtomicFileStore::try_read(path).is_none() {
            if let Err(e) = AtomicFileStore::write(path, value) {
                warn!(instance = instance_id, error = %e, "Legacy epoch migration failed");
                return;
            }
            info!(
                instance = instance_id,
                epoch = value,
                from = %legacy.display(),
                to = %path.display(),
                "Migrated legacy epoch file"
            );
        }
        remove_legacy(legacy);
        drop(guard);
    }
}

fn remove_legacy(legacy: &Path) {
    if let Err(e) = std::fs::remove_file(legacy) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %legacy.display(), error = %e, "Could not remove legacy epoch file");
        }
    }
}
