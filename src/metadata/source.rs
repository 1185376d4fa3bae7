//! Backend metadata source

use crate::resilience::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Column of a schema object (table type, table, view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub ordinal: u32,
    pub type_name: String,
    pub max_length: Option<u32>,
    pub nullable: bool,
}

/// Schema of one object as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub object_name: String,
    /// Monotonic per object; `0` means the object does not exist
    pub version: i64,
    pub columns: Vec<ColumnMetadata>,
}

impl SchemaMetadata {
    pub fn exists(&self) -> bool {
        self.version > 0
    }
}

/// Where schema metadata comes from
///
/// Version `0` (or `None`) means "object does not exist".
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Cheap version-only lookup
    async fn get_version(&self, object: &str, instance: &str) -> Result<i64, BackendError>;

    /// Full metadata for one object
    async fn get_full_metadata(
        &self,
        object: &str,
        instance: &str,
    ) -> Result<Option<SchemaMetadata>, BackendError>;

    /// Every object of the instance in one call
    async fn get_all(&self, instance: &str) -> Result<Vec<SchemaMetadata>, BackendError>;
}
