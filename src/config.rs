//! Coordination configuration
//!
//! One explicitly constructed [`CoordinationConfig`] is handed to every
//! component that needs it. Nothing here is process-global: tests that
//! want a clean slate simply build a fresh value.
//!
//! Values can be layered from a TOML/JSON file and `EPOCHGUARD__*`
//! environment variables (double underscore separates nesting, e.g.
//! `EPOCHGUARD__CACHE__FRESHNESS_INTERVAL_MS=2000`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "EPOCHGUARD";

/// Largest slot range supported by the election (slot ids 0..=31)
pub const MAX_SLOTS: u32 = 32;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Directory holding epoch files and the global epoch segment
    pub base_path: PathBuf,
    /// System-wide lock directory; defaults to a directory under the OS temp dir
    pub lock_dir: Option<PathBuf>,
    /// Per-deployment isolation key, folded into lock and file names
    pub isolation_key: String,
    /// Prefix for every named lock
    pub lock_prefix: String,
    /// Bounded wait for request-path locks (epoch increments)
    pub lock_timeout_ms: u64,
    /// Number of striped locks guarding per-instance epochs
    pub stripe_count: usize,
    /// Number of election slots
    pub slot_count: u32,
    pub cache: CacheConfig,
    pub resilience: ResilienceConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data/epochguard"),
            lock_dir: None,
            isolation_key: "default".to_string(),
            lock_prefix: "epochguard".to_string(),
            lock_timeout_ms: 5_000,
            stripe_count: 1024,
            slot_count: MAX_SLOTS,
            cache: CacheConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

impl CoordinationConfig {
    /// Configuration rooted at `base_path` with defaults everywhere else
    pub fn with_base_path<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: CoordinationConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the coordination layer cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.stripe_count == 0 {
            return Err(Error::Config("stripe_count must be at least 1".to_string()));
        }
        if self.slot_count == 0 || self.slot_count > MAX_SLOTS {
            return Err(Error::Config(format!(
                "slot_count must be within 1..={}, got {}",
                MAX_SLOTS, self.slot_count
            )));
        }
        if self.isolation_key.is_empty() || self.lock_prefix.is_empty() {
            return Err(Error::Config(
                "isolation_key and lock_prefix must not be empty".to_string(),
            ));
        }
        self.cache.validate()?;
        self.resilience.validate()
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Prefix shared by all lock and file names of this deployment
    pub fn namespace(&self) -> String {
        format!("{}-{}", self.lock_prefix, self.isolation_key)
    }

    /// Directory for system-wide lock files
    pub fn global_lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("epochguard-locks"))
    }

    /// Directory for locks visible only to processes sharing `base_path`
    pub fn local_lock_dir(&self) -> PathBuf {
        self.base_path.join("locks")
    }

    pub fn epoch_dir(&self) -> PathBuf {
        self.base_path.join("epochs")
    }
}

/// Metadata cache policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base interval before a positive entry is re-validated
    pub freshness_interval_ms: u64,
    /// Lower bound of the multiplicative jitter applied to the freshness interval
    pub jitter_min: f64,
    /// Upper bound of the multiplicative jitter
    pub jitter_max: f64,
    /// How long a confirmed-absent object stays negatively cached
    pub negative_ttl_ms: u64,
    /// Concurrent backend loads during warm-up
    pub max_concurrent_loads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness_interval_ms: 30_000,
            jitter_min: 0.9,
            jitter_max: 1.1,
            negative_ttl_ms: 10_000,
            max_concurrent_loads: 4,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if !(self.jitter_min > 0.0 && self.jitter_min <= self.jitter_max) {
            return Err(Error::Config(format!(
                "jitter range must satisfy 0 < min <= max, got [{}, {}]",
                self.jitter_min, self.jitter_max
            )));
        }
        if self.max_concurrent_loads == 0 {
            return Err(Error::Config(
                "max_concurrent_loads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn freshness_interval(&self) -> Duration {
        Duration::from_millis(self.freshness_interval_ms)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_millis(self.negative_ttl_ms)
    }
}

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffShape {
    Constant,
    Linear,
    Exponential,
}

/// Retry, circuit breaker and timeout thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: BackoffShape,
    pub base_delay_ms: u64,
    /// Cap for any single retry delay
    pub max_delay_ms: u64,
    pub use_jitter: bool,
    /// Failure ratio within the sampling window that opens the circuit
    pub failure_ratio: f64,
    /// Samples required in the window before the ratio is considered
    pub minimum_throughput: u32,
    pub sampling_window_ms: u64,
    pub break_duration_ms: u64,
    /// Probe calls allowed while half-open
    pub half_open_probes: u32,
    /// Overall timeout around a pipeline execution
    pub timeout_ms: u64,
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffShape::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            use_jitter: true,
            failure_ratio: 0.5,
            minimum_throughput: 10,
            sampling_window_ms: 30_000,
            break_duration_ms: 30_000,
            half_open_probes: 1,
            timeout_ms: 30_000,
            adaptive: None,
        }
    }
}

impl ResilienceConfig {
    fn validate(&self) -> Result<()> {
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "failure_ratio must be within (0, 1], got {}",
                self.failure_ratio
            )));
        }
        if self.minimum_throughput == 0 || self.half_open_probes == 0 {
            return Err(Error::Config(
                "minimum_throughput and half_open_probes must be at least 1".to_string(),
            ));
        }
        if let Some(adaptive) = &self.adaptive {
            if !(adaptive.tightened_failure_ratio > 0.0
                && adaptive.tightened_failure_ratio <= self.failure_ratio)
            {
                return Err(Error::Config(
                    "tightened_failure_ratio must be within (0, failure_ratio]".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn sampling_window(&self) -> Duration {
        Duration::from_millis(self.sampling_window_ms)
    }

    pub fn break_duration(&self) -> Duration {
        Duration::from_millis(self.break_duration_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Sensitivity adjustments under sustained failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Rolling failure count above which the pipeline tightens
    pub failure_watermark: u64,
    /// Retries added on top of `max_retries` while tightened
    pub extra_retries: u32,
    /// Breaker failure ratio used while tightened
    pub tightened_failure_ratio: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            failure_watermark: 20,
            extra_retries: 2,
            tightened_failure_ratio: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stripe_count, 1024);
        assert_eq!(config.slot_count, 32);
        assert_eq!(config.namespace(), "epochguard-default");
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = CoordinationConfig::default();
        config.slot_count = 33;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.cache.jitter_min = 1.2;
        config.cache.jitter_max = 1.1;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.resilience.failure_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let path = dir.path().join("epochguard.toml");
        std::fs::write(
            &path,
            r#"
isolation_key = "orders"
lock_timeout_ms = 250

[cache]
freshness_interval_ms = 1000

[resilience]
backoff = "linear"
max_retries = 1
"#,
        )
        .map_err(|e| Error::io("write config", e))?;

        let config = CoordinationConfig::load(Some(&path))?;
        assert_eq!(config.isolation_key, "orders");
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.cache.freshness_interval_ms, 1000);
        assert_eq!(config.cache.negative_ttl_ms, 10_000);
        assert_eq!(config.resilience.backoff, BackoffShape::Linear);
        assert_eq!(config.resilience.max_retries, 1);
        Ok(())
    }

    #[test]
    fn test_toml_render_round_trips_key_fields() -> Result<()> {
        let config = CoordinationConfig::with_base_path("/var/lib/epochguard");
        let rendered = config.to_toml()?;
        assert!(rendered.contains("base_path = \"/var/lib/epochguard\""));
        assert!(rendered.contains("[resilience]"));
        Ok(())
    }
}
