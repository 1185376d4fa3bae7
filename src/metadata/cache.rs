//! Metadata cache
//!
//! Caches schema metadata per (object, instance) on top of a
//! [`MetadataSource`]. Lookup outcomes:
//!
//! ```text
//! miss                → full load  → positive entry | negative entry + NotFound(fresh miss)
//! negative, unexpired → NotFound(from negative cache), no backend call
//! positive, fresh     → cached metadata, no backend call
//! positive, stale     → version check ─ same version → touch timestamp
//!                                      └ new version  → full reload
//! ```
//!
//! Freshness intervals are jittered per entry so processes sharing one
//! configured interval do not re-validate in lockstep. Entries remember
//! the instance and global epochs they were loaded under; when either has
//! moved, a positive entry is re-validated and a negative entry expires.
//! Backend calls for one key are serialized; different keys never wait on
//! each other.

use super::hooks::{FlushHooks, FlushReport, FlushScope};
use super::source::{MetadataSource, SchemaMetadata};
use crate::config::{CacheConfig, CoordinationConfig};
use crate::epoch::{GlobalEpoch, InstanceEpochStore};
use crate::error::{Error, NotFoundOrigin, Result};
use crate::metrics::{BACKEND_CALLS, CACHE_LOOKUPS};
use crate::resilience::{Cancellation, ResiliencePipeline};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    object: String,
    instance: String,
}

impl CacheKey {
    fn new(object: &str, instance: &str) -> Self {
        Self {
            object: object.to_string(),
            instance: instance.to_string(),
        }
    }
}

/// Epoch values an entry was validated under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct EpochStamp {
    instance: u64,
    global: u64,
}

#[derive(Debug, Clone)]
enum CacheEntry {
    Positive {
        metadata: Arc<SchemaMetadata>,
        checked_at: Instant,
        checked_wall: DateTime<Utc>,
        fresh_for: Duration,
        stamp: EpochStamp,
    },
    Negative {
        recorded_at: Instant,
        recorded_wall: DateTime<Utc>,
        ttl: Duration,
        stamp: EpochStamp,
    },
}

/// Per-key reload mutex, dropped from the map by its last user
struct ReloadSlot<'a> {
    locks: &'a DashMap<CacheKey, Arc<AsyncMutex<()>>>,
    key: CacheKey,
    lock: Arc<AsyncMutex<()>>,
}

impl<'a> ReloadSlot<'a> {
    fn claim(locks: &'a DashMap<CacheKey, Arc<AsyncMutex<()>>>, key: &CacheKey) -> Self {
        let lock = locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        Self {
            locks,
            key: key.clone(),
            lock,
        }
    }
}

impl Drop for ReloadSlot<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and ours, so nobody else is waiting
        self.locks.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

enum Lookup {
    Fresh(Arc<SchemaMetadata>),
    Stale(Arc<SchemaMetadata>),
    Negative,
    Missing,
}

/// Kind of a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Positive,
    Negative,
}

/// Read-only view of one cache entry
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntrySnapshot {
    pub object: String,
    pub instance: String,
    pub state: EntryState,
    pub version: Option<i64>,
    pub checked_at: DateTime<Utc>,
}

pub struct MetadataCache {
    source: Arc<dyn MetadataSource>,
    pipeline: ResiliencePipeline,
    config: CacheConfig,
    instance_epochs: Option<Arc<InstanceEpochStore>>,
    global_epoch: Option<Arc<dyn GlobalEpoch>>,
    entries: DashMap<CacheKey, CacheEntry>,
    reload_locks: DashMap<CacheKey, Arc<AsyncMutex<()>>>,
    hooks: FlushHooks,
}

impl MetadataCache {
    pub fn new(source: Arc<dyn MetadataSource>, config: &CoordinationConfig) -> Self {
        Self {
            source,
            pipeline: ResiliencePipeline::new("metadata", &config.resilience),
            config: config.cache.clone(),
            instance_epochs: None,
            global_epoch: None,
            entries: DashMap::new(),
            reload_locks: DashMap::new(),
            hooks: FlushHooks::new(),
        }
    }

    /// Use per-instance epochs as an invalidation signal
    pub fn with_instance_epochs(mut self, epochs: Arc<InstanceEpochStore>) -> Self {
        self.instance_epochs = Some(epochs);
        self
    }

    /// Use the global epoch as an invalidation signal
    pub fn with_global_epoch(mut self, epoch: Arc<dyn GlobalEpoch>) -> Self {
        self.global_epoch = Some(epoch);
        self
    }

    pub fn hooks(&self) -> &FlushHooks {
        &self.hooks
    }

    pub fn pipeline(&self) -> &ResiliencePipeline {
        &self.pipeline
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Metadata for `object` on `instance`
    ///
    /// Fails with [`Error::SchemaNotFound`] when the object is confirmed
    /// absent, and with a backend error when the backend could not answer.
    ///
    /// With an instance epoch store attached, every call reads the
    /// instance's epoch file synchronously (a read of 8 bytes, no lock and
    /// no write). That is the price of noticing other processes' bumps
    /// without a freshness delay.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn get_metadata(
        &self,
        object: &str,
        instance: &str,
        cancel: &Cancellation,
    ) -> Result<Arc<SchemaMetadata>> {
        let key = CacheKey::new(object, instance);

        match self.lookup(&key, self.stamp(instance)) {
            Lookup::Fresh(metadata) => {
                CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
                return Ok(metadata);
            }
            Lookup::Negative => {
                CACHE_LOOKUPS.with_label_values(&["negative_hit"]).inc();
                debug!(object, instance, "Negative cache hit");
                return Err(not_found(&key, NotFoundOrigin::NegativeCache));
            }
            Lookup::Stale(_) | Lookup::Missing => {}
        }

        let slot = ReloadSlot::claim(&self.reload_locks, &key);
        let _reloading = slot.lock.lock().await;

        // Another task may have refreshed the entry while we waited
        let stamp = self.stamp(instance);
        match self.lookup(&key, stamp) {
            Lookup::Fresh(metadata) => {
                CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
                Ok(metadata)
            }
            Lookup::Negative => {
                CACHE_LOOKUPS.with_label_values(&["negative_hit"]).inc();
                Err(not_found(&key, NotFoundOrigin::NegativeCache))
            }
            Lookup::Missing => {
                CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
                self.load(&key, stamp, cancel).await
            }
            Lookup::Stale(cached) => self.revalidate(&key, cached, stamp, cancel).await,
        }
    }

    fn lookup(&self, key: &CacheKey, stamp: EpochStamp) -> Lookup {
        let Some(entry) = self.entries.get(key) else {
            return Lookup::Missing;
        };
        match &*entry {
            CacheEntry::Positive {
                metadata,
                checked_at,
                fresh_for,
                stamp: loaded_under,
                ..
            } => {
                if *loaded_under == stamp && checked_at.elapsed() < *fresh_for {
                    Lookup::Fresh(metadata.clone())
                } else {
                    Lookup::Stale(metadata.clone())
                }
            }
            CacheEntry::Negative {
                recorded_at,
                ttl,
                stamp: recorded_under,
                ..
            } => {
                if *recorded_under == stamp && recorded_at.elapsed() < *ttl {
                    Lookup::Negative
                } else {
                    Lookup::Missing
                }
            }
        }
    }

    /// Full load of an uncached (or expired negative) key
    async fn load(
        &self,
        key: &CacheKey,
        stamp: EpochStamp,
        cancel: &Cancellation,
    ) -> Result<Arc<SchemaMetadata>> {
        match self.fetch_full(key, cancel).await? {
            Some(metadata) => {
                debug!(object = %key.object, instance = %key.instance, version = metadata.version, "Loaded metadata");
                let metadata = Arc::new(metadata);
                self.store_positive(key, metadata.clone(), stamp);
                Ok(metadata)
            }
            None => {
                self.store_negative(key, stamp);
                Err(not_found(key, NotFoundOrigin::FreshMiss))
            }
        }
    }

    /// Cheap version check of a stale entry, full reload only if it moved
    async fn revalidate(
        &self,
        key: &CacheKey,
        cached: Arc<SchemaMetadata>,
        stamp: EpochStamp,
        cancel: &Cancellation,
    ) -> Result<Arc<SchemaMetadata>> {
        let version = self
            .pipeline
            .execute(cancel, || {
                BACKEND_CALLS.with_label_values(&["version"]).inc();
                self.source.get_version(&key.object, &key.instance)
            })
            .await?;

        if version <= 0 {
            info!(object = %key.object, instance = %key.instance, "Cached object no longer exists");
            CACHE_LOOKUPS.with_label_values(&["stale_reload"]).inc();
            self.store_negative(key, stamp);
            return Err(not_found(key, NotFoundOrigin::FreshMiss));
        }

        if version <= cached.version {
            if version < cached.version {
                warn!(
                    object = %key.object,
                    instance = %key.instance,
                    cached = cached.version,
                    reported = version,
                    "Backend reported an older version, keeping cached metadata"
                );
            }
            CACHE_LOOKUPS.with_label_values(&["stale_touch"]).inc();
            self.store_positive(key, cached.clone(), stamp);
            return Ok(cached);
        }

        CACHE_LOOKUPS.with_label_values(&["stale_reload"]).inc();
        match self.fetch_full(key, cancel).await? {
            Some(metadata) if metadata.version > cached.version => {
                debug!(
                    object = %key.object,
                    instance = %key.instance,
                    from = cached.version,
                    to = metadata.version,
                    "Reloaded metadata"
                );
                let metadata = Arc::new(metadata);
                self.store_positive(key, metadata.clone(), stamp);
                Ok(metadata)
            }
            Some(_) => {
                self.store_positive(key, cached.clone(), stamp);
                Ok(cached)
            }
            None => {
                self.store_negative(key, stamp);
                Err(not_found(key, NotFoundOrigin::FreshMiss))
            }
        }
    }

    async fn fetch_full(
        &self,
        key: &CacheKey,
        cancel: &Cancellation,
    ) -> Result<Option<SchemaMetadata>> {
        let metadata = self
            .pipeline
            .execute(cancel, || {
                BACKEND_CALLS.with_label_values(&["full"]).inc();
                self.source.get_full_metadata(&key.object, &key.instance)
            })
            .await?;
        Ok(metadata.filter(SchemaMetadata::exists))
    }

    fn store_positive(&self, key: &CacheKey, metadata: Arc<SchemaMetadata>, stamp: EpochStamp) {
        let fresh_for = self.jittered(self.config.freshness_interval());
        self.entries.insert(
            key.clone(),
            CacheEntry::Positive {
                metadata,
                checked_at: Instant::now(),
                checked_wall: Utc::now(),
                fresh_for,
                stamp,
            },
        );
    }

    fn store_negative(&self, key: &CacheKey, stamp: EpochStamp) {
        let ttl = self.jittered(self.config.negative_ttl());
        self.entries.insert(
            key.clone(),
            CacheEntry::Negative {
                recorded_at: Instant::now(),
                recorded_wall: Utc::now(),
                ttl,
                stamp,
            },
        );
    }

    fn jittered(&self, base: Duration) -> Duration {
        let (low, high) = (self.config.jitter_min, self.config.jitter_max);
        if high <= low {
            return base.mul_f64(low);
        }
        base.mul_f64(rand::thread_rng().gen_range(low..=high))
    }

    fn stamp(&self, instance: &str) -> EpochStamp {
        EpochStamp {
            instance: self
                .instance_epochs
                .as_ref()
                .map(|epochs| epochs.peek_epoch(instance))
                .unwrap_or(0),
            global: self
                .global_epoch
                .as_ref()
                .map(|epoch| epoch.current())
                .unwrap_or(0),
        }
    }

    /// Populate the cache for `instance` with one bulk backend call
    #[instrument(skip(self, cancel))]
    pub async fn warm_up(&self, instance: &str, cancel: &Cancellation) -> Result<usize> {
        let all = self
            .pipeline
            .execute(cancel, || {
                BACKEND_CALLS.with_label_values(&["bulk"]).inc();
                self.source.get_all(instance)
            })
            .await?;

        let stamp = self.stamp(instance);
        let mut loaded = 0;
        for metadata in all.into_iter().filter(SchemaMetadata::exists) {
            let key = CacheKey::new(&metadata.object_name, instance);
            self.store_positive(&key, Arc::new(metadata), stamp);
            loaded += 1;
        }
        info!(instance, loaded, "Metadata cache warmed up");
        Ok(loaded)
    }

    /// Load the named objects concurrently, at most `max_concurrent_loads` at a time
    pub async fn warm_up_objects(
        self: &Arc<Self>,
        instance: &str,
        objects: Vec<String>,
        cancel: &Cancellation,
    ) -> Vec<(String, Result<Arc<SchemaMetadata>>)> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_loads.max(1)));
        let mut tasks = JoinSet::new();

        for object in objects {
            let cache = Arc::clone(self);
            let permits = permits.clone();
            let instance = instance.to_string();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => cache.get_metadata(&object, &instance, &cancel).await,
                    Err(_) => Err(Error::Cancelled),
                };
                (object, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => error!(error = %e, "Metadata warm-up task failed"),
            }
        }
        results
    }

    /// Drop `object` on every instance and run the flush hooks
    pub fn flush_object(&self, object: &str) -> FlushReport {
        self.entries.retain(|key, _| key.object != object);
        self.prune_reload_locks(|key| key.object == object);
        self.run_hooks(FlushScope::Object(object.to_string()))
    }

    /// Drop every entry of `instance` and run the flush hooks
    pub fn flush_instance(&self, instance: &str) -> FlushReport {
        self.entries.retain(|key, _| key.instance != instance);
        self.prune_reload_locks(|key| key.instance == instance);
        self.run_hooks(FlushScope::Instance(instance.to_string()))
    }

    /// Drop everything and run the flush hooks
    pub fn flush_all(&self) -> FlushReport {
        self.entries.clear();
        self.prune_reload_locks(|_| true);
        self.run_hooks(FlushScope::All)
    }

    /// Forget idle reload locks of matching keys; locks in use stay
    fn prune_reload_locks(&self, matches: impl Fn(&CacheKey) -> bool) {
        self.reload_locks
            .retain(|key, lock| !(matches(key) && Arc::strong_count(lock) == 1));
    }

    #[cfg(test)]
    fn reload_lock_count(&self) -> usize {
        self.reload_locks.len()
    }

    fn run_hooks(&self, scope: FlushScope) -> FlushReport {
        let report = self.hooks.run(&scope);
        info!(scope = %scope, hooks = report.ran, failed = report.failed.len(), "Metadata cache flushed");
        report
    }

    /// Tell every process that `instance` changed, then flush it locally
    ///
    /// Returns the new instance epoch, or `None` without an epoch store.
    pub async fn invalidate_instance(&self, instance: &str) -> Result<Option<u64>> {
        let epoch = match &self.instance_epochs {
            Some(epochs) => {
                let epochs = epochs.clone();
                let id = instance.to_string();
                let epoch = tokio::task::spawn_blocking(move || epochs.increment_epoch(&id))
                    .await
                    .map_err(|e| Error::io("epoch increment task", std::io::Error::other(e)))??;
                Some(epoch)
            }
            None => None,
        };
        self.flush_instance(instance);
        Ok(epoch)
    }

    /// Tell every process that something changed, then flush everything locally
    pub async fn invalidate_all(&self) -> Result<Option<u64>> {
        let epoch = match &self.global_epoch {
            Some(global) => {
                let global = global.clone();
                let epoch = tokio::task::spawn_blocking(move || global.increment())
                    .await
                    .map_err(|e| Error::io("epoch increment task", std::io::Error::other(e)))??;
                Some(epoch)
            }
            None => None,
        };
        self.flush_all();
        Ok(epoch)
    }

    /// Current entries, for diagnostics
    pub fn snapshot(&self) -> Vec<CacheEntrySnapshot> {
        let mut entries: Vec<CacheEntrySnapshot> = self
            .entries
            .iter()
            .map(|item| {
                let key = item.key();
                match item.value() {
                    CacheEntry::Positive {
                        metadata,
                        checked_wall,
                        ..
                    } => CacheEntrySnapshot {
                        object: key.object.clone(),
                        instance: key.instance.clone(),
                        state: EntryState::Positive,
                        version: Some(metadata.version),
                        checked_at: *checked_wall,
                    },
                    CacheEntry::Negative { recorded_wall, .. } => CacheEntrySnapshot {
                        object: key.object.clone(),
                        instance: key.instance.clone(),
                        state: EntryState::Negative,
                        version: None,
                        checked_at: *recorded_wall,
                    },
                }
            })
            .collect();
        entries.sort_by(|a, b| (&a.instance, &a.object).cmp(&(&b.instance, &b.object)));
        entries
    }
}

fn not_found(key: &CacheKey, origin: NotFoundOrigin) -> Error {
    Error::SchemaNotFound {
        object: key.object.clone(),
        instance: key.instance.clone(),
        origin,
    }
}
