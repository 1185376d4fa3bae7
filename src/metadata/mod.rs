//! Schema metadata caching
//!
//! [`MetadataCache`] sits between callers and a [`MetadataSource`] and
//! keeps backend round trips to version checks wherever it can.

pub mod cache;
pub mod hooks;
pub mod mock;
pub mod source;

pub use cache::{CacheEntrySnapshot, EntryState, MetadataCache};
pub use hooks::{FlushHooks, FlushReport, FlushScope};
pub use mock::MockMetadataSource;
pub use source::{ColumnMetadata, MetadataSource, SchemaMetadata};
