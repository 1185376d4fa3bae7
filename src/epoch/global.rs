//! Host-wide epoch counter
//!
//! The counter lives in an 8-byte file mapped into every cooperating
//! process. Reads are a single atomic load on the shared mapping;
//! increments serialize on one dedicated named lock.

use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::metrics::EPOCH_INCREMENTS;
use crate::sync::{LockNamespace, NamedLock};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// "Something, somewhere, changed"
pub trait GlobalEpoch: Send + Sync {
    /// Lock-free read of the shared counter
    fn current(&self) -> u64;

    /// Add one under the epoch lock and return the new value
    fn increment(&self) -> Result<u64>;
}

/// [`GlobalEpoch`] over a shared memory mapping
pub struct MmapGlobalEpoch {
    path: PathBuf,
    lock: NamedLock,
    timeout: Duration,
    counter: NonNull<AtomicU64>,
    mmap: MmapMut,
    _file: File,
}

// SAFETY: `counter` points into `mmap`, which lives as long as `self` and is
// only ever accessed through the atomic.
unsafe impl Send for MmapGlobalEpoch {}
unsafe impl Sync for MmapGlobalEpoch {}

impl MmapGlobalEpoch {
    /// Map the deployment's global epoch segment, creating it if needed
    pub fn open(config: &CoordinationConfig) -> Result<Self> {
        let namespace = LockNamespace::resolve(config);
        let path = config
            .base_path
            .join(format!("{}-global.epoch", config.namespace()));
        Self::open_at(&path, namespace.open("global-epoch"), config.lock_timeout())
    }

    pub fn open_at(path: &Path, lock: NamedLock, timeout: Duration) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(format!("open {}", path.display()), e))?;

        let len = file
            .metadata()
            .map_err(|e| Error::io(format!("stat {}", path.display()), e))?
            .len();
        if len < 8 {
            // Only ever grows; a concurrent creator extending to the same size is harmless
            file.set_len(8)
                .map_err(|e| Error::io(format!("size {}", path.display()), e))?;
            debug!(path = %path.display(), "Initialized global epoch segment");
        }

        let mut mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| Error::io(format!("map {}", path.display()), e))?
        };
        // Mappings are page aligned, so the first 8 bytes are a valid AtomicU64
        let counter = NonNull::new(mmap.as_mut_ptr().cast::<AtomicU64>())
            .ok_or_else(|| Error::Config("empty global epoch mapping".to_string()))?;

        info!(path = %path.display(), lock = %lock.name(), "Global epoch mapped");
        Ok(Self {
            path: path.to_path_buf(),
            lock,
            timeout,
            counter,
            mmap,
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn counter(&self) -> &AtomicU64 {
        unsafe { self.counter.as_ref() }
    }
}

impl GlobalEpoch for MmapGlobalEpoch {
    fn current(&self) -> u64 {
        self.counter().load(Ordering::Acquire)
    }

    fn increment(&self) -> Result<u64> {
        let guard = self.lock.acquire(self.timeout)?;
        if guard.acquired().was_abandoned() {
            warn!(path = %self.path.display(), "Global epoch lock was abandoned mid-increment");
        }
        let next = self.counter().load(Ordering::Acquire).saturating_add(1);
        self.counter().store(next, Ordering::Release);
        if let Err(e) = self.mmap.flush_async_range(0, 8) {
            debug!(path = %self.path.display(), error = %e, "Global epoch flush deferred");
        }
        EPOCH_INCREMENTS.with_label_values(&["global"]).inc();
        debug!(epoch = next, "Global epoch incremented");
        Ok(next)
    }
}
