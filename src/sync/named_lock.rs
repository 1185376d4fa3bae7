//! Cross-process named locks
//!
//! A named lock is an advisory `flock` on `<dir>/<prefix>-<name>.lock`,
//! paired with an in-process mutex so that threads of one process
//! exclude each other before touching the file lock.
//!
//! # Scope ladder
//!
//! ```text
//! Global     → lock dir shared by every process on the host
//!   │ permission denied
//!   ▼
//! Local      → <base_path>/locks, shared by processes of one deployment
//!   │ any failure
//!   ▼
//! InProcess  → mutex only, no cross-process exclusion
//! ```
//!
//! The lock file is opened for each acquisition and closed on release.
//! A single lock file that is not permitted in the Global directory is
//! taken from the Local directory instead; any other open failure is an
//! error rather than a silent drop to in-process exclusion.
//!
//! The holder writes its pid into the lock file and truncates it on
//! release. Finding a pid on acquisition means the previous holder died
//! while holding the lock; the OS already dropped its `flock`, so the
//! acquisition succeeds and is reported as
//! [`LockAcquired::RecoveredFromAbandoned`].

use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::metrics::LOCK_ACQUISITIONS;
use dashmap::DashMap;
use fs2::FileExt;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

lazy_static::lazy_static! {
    /// Process-wide mutexes, one per lock identity
    static ref IN_PROCESS_LOCKS: DashMap<String, Arc<Mutex<()>>> = DashMap::new();
}

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Visibility of a named lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Every process on the host
    Global,
    /// Processes sharing the deployment's base path
    Local,
    /// This process only
    InProcess,
}

impl LockScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockScope::Global => "global",
            LockScope::Local => "local",
            LockScope::InProcess => "in_process",
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a lock was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquired {
    /// Previous holder released normally (or there was none)
    Fresh,
    /// Previous holder terminated while holding the lock
    RecoveredFromAbandoned { previous_holder: Option<u32> },
}

impl LockAcquired {
    pub fn was_abandoned(&self) -> bool {
        matches!(self, LockAcquired::RecoveredFromAbandoned { .. })
    }
}

/// Resolved lock directory and name prefix for one deployment
#[derive(Debug, Clone)]
pub struct LockNamespace {
    prefix: String,
    scope: LockScope,
    dir: Option<PathBuf>,
    /// Deployment-local directory tried when a Global lock file is not permitted
    fallback_dir: Option<PathBuf>,
}

impl LockNamespace {
    /// Walk the scope ladder and settle on the first usable tier
    pub fn resolve(config: &CoordinationConfig) -> Self {
        let prefix = config.namespace();
        let ladder = [
            (LockScope::Global, config.global_lock_dir()),
            (LockScope::Local, config.local_lock_dir()),
        ];

        for (scope, dir) in ladder {
            match probe_dir(&dir, &prefix) {
                Ok(()) => {
                    if scope == LockScope::Global {
                        info!(scope = %scope, dir = %dir.display(), "Named locks ready");
                    } else {
                        warn!(scope = %scope, dir = %dir.display(), "Named locks degraded to deployment-local scope");
                    }
                    let fallback_dir = match scope {
                        LockScope::Global => Some(config.local_lock_dir()),
                        _ => None,
                    };
                    return Self {
                        prefix,
                        scope,
                        dir: Some(dir),
                        fallback_dir,
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(scope = %scope, dir = %dir.display(), error = %e, "Lock directory not permitted, trying next scope");
                }
                Err(e) => {
                    warn!(scope = %scope, dir = %dir.display(), error = %e, "Lock directory unusable");
                    break;
                }
            }
        }

        warn!(prefix = %prefix, "Named locks degraded to in-process only; other processes are not excluded");
        Self::in_process(prefix)
    }

    /// Namespace without any cross-process visibility
    pub fn in_process(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            scope: LockScope::InProcess,
            dir: None,
            fallback_dir: None,
        }
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Create the handle for `name`; no file is opened until acquisition
    pub fn open(&self, name: &str) -> NamedLock {
        let full_name = format!("{}-{}", self.prefix, name);
        let file_name = format!("{}.lock", full_name);
        let path = self.dir.as_ref().map(|dir| dir.join(&file_name));
        let fallback_path = self.fallback_dir.as_ref().map(|dir| dir.join(&file_name));
        let identity = match &path {
            Some(path) => path.display().to_string(),
            None => format!("mem:{}", full_name),
        };
        let local = IN_PROCESS_LOCKS
            .entry(identity)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        NamedLock {
            name: full_name,
            scope: self.scope,
            path,
            fallback_path,
            local,
        }
    }
}

fn probe_dir(dir: &Path, prefix: &str) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(format!("{}.ns", prefix)))?;
    Ok(())
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

/// A named lock usable from any thread of this process and, unless
/// degraded, from other processes
///
/// The lock file is opened per acquisition and closed on release, so an
/// idle lock holds no file descriptor.
pub struct NamedLock {
    name: String,
    scope: LockScope,
    path: Option<PathBuf>,
    fallback_path: Option<PathBuf>,
    local: Arc<Mutex<()>>,
}

impl fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLock")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("path", &self.path)
            .finish()
    }
}

impl NamedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Scope decided when the namespace was resolved
    pub fn scope(&self) -> LockScope {
        self.scope
    }

    /// Open the lock file for one acquisition
    ///
    /// A Global file that is not permitted is retried in the Local
    /// directory. Every other failure is an error: silently dropping to
    /// in-process exclusion here would let another process in.
    fn open_file(&self) -> Result<Option<(File, LockScope)>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        match open_lock_file(path) {
            Ok(file) => Ok(Some((file, self.scope))),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                let Some(fallback) = &self.fallback_path else {
                    return Err(Error::io(format!("open lock {}", path.display()), e));
                };
                warn!(lock = %self.name, path = %path.display(), error = %e, "Lock file not permitted, using deployment-local lock file");
                if let Some(dir) = fallback.parent() {
                    std::fs::create_dir_all(dir)
                        .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
                }
                let file = open_lock_file(fallback)
                    .map_err(|e| Error::io(format!("open lock {}", fallback.display()), e))?;
                Ok(Some((file, LockScope::Local)))
            }
            Err(e) => Err(Error::io(format!("open lock {}", path.display()), e)),
        }
    }

    /// Block for at most `timeout` waiting for the lock
    pub fn acquire(&self, timeout: Duration) -> Result<NamedLockGuard> {
        let start = Instant::now();
        let Some(local) = self.local.try_lock_arc_for(timeout) else {
            return Err(self.timed_out(start.elapsed()));
        };

        let Some((file, scope)) = self.open_file()? else {
            return Ok(self.guard(LockAcquired::Fresh, None, LockScope::InProcess, local));
        };

        let mut backoff = Duration::from_millis(1);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(self.timed_out(elapsed));
                    }
                    std::thread::sleep(backoff.min(timeout - elapsed));
                    backoff = (backoff * 2).min(MAX_POLL_INTERVAL);
                }
                Err(e) => return Err(Error::io(format!("lock {}", self.name), e)),
            }
        }

        let acquired = self.claim(&file);
        Ok(self.guard(acquired, Some(file), scope, local))
    }

    /// Take the lock only if nobody holds it right now
    pub fn try_acquire(&self) -> Result<Option<NamedLockGuard>> {
        let Some(local) = self.local.try_lock_arc() else {
            LOCK_ACQUISITIONS
                .with_label_values(&[self.scope.as_str(), "busy"])
                .inc();
            return Ok(None);
        };

        let Some((file, scope)) = self.open_file()? else {
            return Ok(Some(self.guard(LockAcquired::Fresh, None, LockScope::InProcess, local)));
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                let acquired = self.claim(&file);
                Ok(Some(self.guard(acquired, Some(file), scope, local)))
            }
            Err(e) if is_contended(&e) => {
                LOCK_ACQUISITIONS
                    .with_label_values(&[scope.as_str(), "busy"])
                    .inc();
                Ok(None)
            }
            Err(e) => Err(Error::io(format!("lock {}", self.name), e)),
        }
    }

    /// Inspect the holder marker and stamp our own pid into the file
    fn claim(&self, file: &File) -> LockAcquired {
        let mut handle = file;
        let mut previous = String::new();
        let read = handle
            .seek(SeekFrom::Start(0))
            .and_then(|_| handle.read_to_string(&mut previous));
        if let Err(e) = read {
            debug!(lock = %self.name, error = %e, "Could not read lock holder marker");
        }

        let previous = previous.trim();
        let acquired = if previous.is_empty() {
            LockAcquired::Fresh
        } else {
            let previous_holder = previous.parse::<u32>().ok();
            warn!(
                lock = %self.name,
                previous_holder = ?previous_holder,
                "Recovered abandoned lock; previous holder exited while holding it"
            );
            LockAcquired::RecoveredFromAbandoned { previous_holder }
        };

        let stamp = file
            .set_len(0)
            .and_then(|_| handle.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(handle, "{}", std::process::id()));
        if let Err(e) = stamp {
            debug!(lock = %self.name, error = %e, "Could not write lock holder marker");
        }
        acquired
    }

    fn guard(
        &self,
        acquired: LockAcquired,
        file: Option<File>,
        scope: LockScope,
        local: ArcMutexGuard<RawMutex, ()>,
    ) -> NamedLockGuard {
        let outcome = if acquired.was_abandoned() {
            "recovered"
        } else {
            "fresh"
        };
        LOCK_ACQUISITIONS
            .with_label_values(&[scope.as_str(), outcome])
            .inc();

        NamedLockGuard {
            name: self.name.clone(),
            acquired,
            scope,
            file,
            _local: local,
        }
    }

    fn timed_out(&self, waited: Duration) -> Error {
        warn!(lock = %self.name, waited_ms = waited.as_millis() as u64, "Coordination timeout");
        LOCK_ACQUISITIONS
            .with_label_values(&[self.scope.as_str(), "timeout"])
            .inc();
        Error::CoordinationTimeout {
            lock: self.name.clone(),
            waited,
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held lock; released on drop, which also closes the lock file
pub struct NamedLockGuard {
    name: String,
    acquired: LockAcquired,
    scope: LockScope,
    file: Option<File>,
    _local: ArcMutexGuard<RawMutex, ()>,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquired(&self) -> LockAcquired {
        self.acquired
    }

    /// Scope this acquisition actually achieved
    pub fn scope(&self) -> LockScope {
        self.scope
    }
}

impl fmt::Debug for NamedLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("name", &self.name)
            .field("acquired", &self.acquired)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.set_len(0) {
                debug!(lock = %self.name, error = %e, "Could not clear lock holder marker");
            }
            if let Err(e) = FileExt::unlock(&file) {
                warn!(lock = %self.name, error = %e, "Failed to release file lock");
            }
        }
    }
}
