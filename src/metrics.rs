//! Prometheus metrics for coordination and caching
//!
//! Counters are always updated; they only become visible once
//! [`register_metrics`] has attached them to [`METRICS_REGISTRY`].

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Once;
use tracing::error;

lazy_static::lazy_static! {
    /// Crate metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref EPOCH_INCREMENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("epochguard_epoch_increments_total", "Epoch increments"),
        &["kind"]
    ).unwrap();

    pub static ref LOCK_ACQUISITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("epochguard_lock_acquisitions_total", "Named lock acquisition attempts"),
        &["scope", "outcome"]
    ).unwrap();

    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("epochguard_metadata_cache_lookups_total", "Metadata cache lookups"),
        &["outcome"]
    ).unwrap();

    pub static ref BACKEND_CALLS: IntCounterVec = IntCounterVec::new(
        Opts::new("epochguard_backend_calls_total", "Metadata backend calls"),
        &["kind"]
    ).unwrap();

    pub static ref CIRCUIT_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("epochguard_circuit_transitions_total", "Circuit breaker state transitions"),
        &["state"]
    ).unwrap();
}

static REGISTER: Once = Once::new();

/// Attach all collectors to the crate registry (idempotent)
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(EPOCH_INCREMENTS.clone()),
            Box::new(LOCK_ACQUISITIONS.clone()),
            Box::new(CACHE_LOOKUPS.clone()),
            Box::new(BACKEND_CALLS.clone()),
            Box::new(CIRCUIT_TRANSITIONS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = METRICS_REGISTRY.register(collector) {
                error!(error = %e, "Failed to register metric");
            }
        }
    });
}

/// Render the registry in the Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
