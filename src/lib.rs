// epochguard - cache coherence for database access layers
// Cross-process epochs, slot election and metadata caching over the filesystem

#![warn(rust_2018_idioms)]

pub mod config;
pub mod election;
pub mod epoch;
pub mod metadata;
pub mod metrics;
pub mod resilience;
pub mod sync;

// Re-exports for convenience
pub use config::{CacheConfig, CoordinationConfig, ResilienceConfig};
pub use election::SlotAllocator;
pub use epoch::{AtomicFileStore, GlobalEpoch, InstanceEpochStore, MmapGlobalEpoch};
pub use metadata::{MetadataCache, MetadataSource, SchemaMetadata};
pub use resilience::{BackendError, Cancellation, ResiliencePipeline};
pub use sync::{LockAcquired, LockScope, NamedLock, StripedLockPool};

/// Error types
pub mod error {
    use crate::resilience::BackendError;
    use std::fmt;
    use std::time::Duration;
    use thiserror::Error;

    /// Why a metadata lookup reported a missing object
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum NotFoundOrigin {
        /// The backend was asked just now and reported the object absent
        FreshMiss,
        /// Answered from a negative cache entry without asking the backend
        NegativeCache,
    }

    impl fmt::Display for NotFoundOrigin {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                NotFoundOrigin::FreshMiss => f.write_str("fresh miss"),
                NotFoundOrigin::NegativeCache => f.write_str("from negative cache"),
            }
        }
    }

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Coordination timeout: lock '{lock}' not acquired within {waited:?}")]
        CoordinationTimeout { lock: String, waited: Duration },

        #[error("Transient backend error: {0}")]
        BackendTransient(BackendError),

        #[error("Backend error: {0}")]
        BackendFatal(BackendError),

        #[error("Circuit open: backend calls suspended for another {retry_after:?}")]
        CircuitOpen { retry_after: Duration },

        #[error("Operation timed out after {0:?}")]
        Timeout(Duration),

        #[error("Operation cancelled")]
        Cancelled,

        #[error("Schema object '{object}' not found on '{instance}' ({origin})")]
        SchemaNotFound {
            object: String,
            instance: String,
            origin: NotFoundOrigin,
        },

        #[error("I/O error ({context}): {source}")]
        Io {
            context: String,
            #[source]
            source: std::io::Error,
        },

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl Error {
        pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
            Error::Io {
                context: context.into(),
                source,
            }
        }

        /// True for the "object does not exist" outcome, whichever way it was decided
        pub fn is_not_found(&self) -> bool {
            matches!(self, Error::SchemaNotFound { .. })
        }
    }

    impl From<::config::ConfigError> for Error {
        fn from(e: ::config::ConfigError) -> Self {
            Error::Config(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::{Error, NotFoundOrigin};
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_not_found_message_names_origin() {
        let err = Error::SchemaNotFound {
            object: "dbo.MissingTvp".to_string(),
            instance: "instance1".to_string(),
            origin: NotFoundOrigin::NegativeCache,
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("from negative cache"));
    }
}
