//! In-memory metadata source for testing
//!
//! Objects are registered per instance with a version; every call is
//! counted so tests can assert how often the backend was reached.

use super::source::{ColumnMetadata, MetadataSource, SchemaMetadata};
use crate::resilience::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct MockMetadataSource {
    objects: Mutex<HashMap<(String, String), SchemaMetadata>>,
    failures: Mutex<VecDeque<BackendError>>,
    version_calls: AtomicUsize,
    full_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
}

impl MockMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or bump) an object with a single `Id int` column
    pub fn set_object(&self, object: &str, instance: &str, version: i64) {
        let metadata = SchemaMetadata {
            object_name: object.to_string(),
            version,
            columns: vec![ColumnMetadata {
                name: "Id".to_string(),
                ordinal: 1,
                type_name: "int".to_string(),
                max_length: None,
                nullable: false,
            }],
        };
        self.objects
            .lock()
            .insert((instance.to_string(), object.to_string()), metadata);
    }

    pub fn remove_object(&self, object: &str, instance: &str) {
        self.objects
            .lock()
            .remove(&(instance.to_string(), object.to_string()));
    }

    /// Make the next calls fail with `error`, one call per queued error
    pub fn fail_next(&self, times: usize, error: BackendError) {
        let mut failures = self.failures.lock();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    pub fn version_calls(&self) -> usize {
        self.version_calls.load(Ordering::SeqCst)
    }

    pub fn full_calls(&self) -> usize {
        self.full_calls.load(Ordering::SeqCst)
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<(), BackendError> {
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn lookup(&self, object: &str, instance: &str) -> Option<SchemaMetadata> {
        self.objects
            .lock()
            .get(&(instance.to_string(), object.to_string()))
            .cloned()
    }
}

#[async_trait]
impl MetadataSource for MockMetadataSource {
    async fn get_version(&self, object: &str, instance: &str) -> Result<i64, BackendError> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        Ok(self.lookup(object, instance).map(|m| m.version).unwrap_or(0))
    }

    async fn get_full_metadata(
        &self,
        object: &str,
        instance: &str,
    ) -> Result<Option<SchemaMetadata>, BackendError> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        Ok(self.lookup(object, instance))
    }

    async fn get_all(&self, instance: &str) -> Result<Vec<SchemaMetadata>, BackendError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        let mut all: Vec<SchemaMetadata> = self
            .objects
            .lock()
            .iter()
            .filter(|((owner, _), _)| owner == instance)
            .map(|(_, metadata)| metadata.clone())
            .collect();
        all.sort_by(|a, b| a.object_name.cmp(&b.object_name));
        Ok(all)
    }
}
