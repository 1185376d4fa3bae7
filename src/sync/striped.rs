//! Striped lock pool
//!
//! A fixed set of named locks (`stripe-0000` .. `stripe-1023` by default).
//! Keys hash onto one stripe with xxh3, so unrelated keys may share a
//! lock; that only costs throughput, never correctness.

use super::named_lock::{LockNamespace, LockScope, NamedLock};
use crate::config::CoordinationConfig;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

pub struct StripedLockPool {
    scope: LockScope,
    locks: Vec<NamedLock>,
}

impl StripedLockPool {
    /// Create the pool for the deployment described by `config`
    pub fn new(config: &CoordinationConfig) -> Self {
        let namespace = LockNamespace::resolve(config);
        Self::with_namespace(&namespace, config.stripe_count.max(1))
    }

    pub fn with_namespace(namespace: &LockNamespace, stripes: usize) -> Self {
        let locks = (0..stripes.max(1))
            .map(|index| namespace.open(&format!("stripe-{:04}", index)))
            .collect();
        debug!(stripes, scope = %namespace.scope(), "Created striped lock pool");
        Self {
            scope: namespace.scope(),
            locks,
        }
    }

    /// Stripe index for `key`; stable across processes and restarts
    pub fn stripe_index(&self, key: &str) -> usize {
        (xxh3_64(key.as_bytes()) % self.locks.len() as u64) as usize
    }

    /// The lock guarding `key`
    pub fn lock_for(&self, key: &str) -> &NamedLock {
        &self.locks[self.stripe_index(key)]
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn pool(dir: &std::path::Path) -> StripedLockPool {
        let mut config = CoordinationConfig::with_base_path(dir);
        config.lock_dir = Some(dir.join("global-locks"));
        StripedLockPool::new(&config)
    }

    #[test]
    fn test_default_pool_has_1024_stripes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        assert_eq!(pool.len(), 1024);
        assert_eq!(pool.scope(), LockScope::Global);
    }

    #[test]
    fn test_key_mapping_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = pool(dir.path());
        let b = pool(dir.path());
        for key in ["instance1", "Server=db01;Database=orders", ""] {
            assert_eq!(a.stripe_index(key), b.stripe_index(key));
            assert_eq!(a.lock_for(key).name(), b.lock_for(key).name());
        }
    }

    #[test]
    fn test_keys_spread_across_stripes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let used: HashSet<usize> = (0..500)
            .map(|i| pool.stripe_index(&format!("instance-{}", i)))
            .collect();
        assert!(used.len() > 300, "only {} stripes used", used.len());
    }

    #[test]
    fn test_same_key_excludes_across_pools() {
        let dir = tempfile::tempdir().unwrap();
        let a = pool(dir.path());
        let b = pool(dir.path());

        let _held = a.lock_for("instance1").acquire(Duration::from_secs(1)).unwrap();
        assert!(b.lock_for("instance1").try_acquire().unwrap().is_none());
    }
}
