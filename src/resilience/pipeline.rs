//! Resilience pipeline
//!
//! ```text
//! timeout( breaker( retry( call ) ) )
//! ```
//!
//! Retries only transient errors, with bounded attempts and capped
//! backoff. A full retry sequence counts as one breaker sample. Calls
//! that time out count as breaker failures. Cancellation is checked
//! before every attempt and interrupts backoff sleeps.
//!
//! The adaptive variant keeps a rolling failure count. Above its
//! watermark it grants extra retries and tightens the breaker's failure
//! ratio; both revert, and the count resets, when the breaker closes.

use super::cancel::Cancellation;
use super::circuit_breaker::{Admission, CircuitBreaker, CircuitState};
use super::retry::RetryPolicy;
use super::transient::{BackendError, TransientFailureDetector};
use crate::config::{AdaptiveConfig, ResilienceConfig};
use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

struct AdaptiveState {
    config: AdaptiveConfig,
    base_ratio: f64,
    failures: AtomicU64,
}

impl AdaptiveState {
    fn tightened(&self) -> bool {
        self.failures.load(Ordering::Acquire) > self.config.failure_watermark
    }
}

pub struct ResiliencePipeline {
    name: String,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    timeout: Duration,
    detector: TransientFailureDetector,
    adaptive: Option<AdaptiveState>,
}

impl ResiliencePipeline {
    /// Build from configuration; adaptive when `config.adaptive` is set
    pub fn new(name: impl Into<String>, config: &ResilienceConfig) -> Self {
        let name = name.into();
        let adaptive = config.adaptive.clone().map(|adaptive| AdaptiveState {
            config: adaptive,
            base_ratio: config.failure_ratio,
            failures: AtomicU64::new(0),
        });
        Self {
            breaker: CircuitBreaker::new(name.clone(), config),
            name,
            retry: RetryPolicy::from_config(config),
            timeout: config.timeout(),
            detector: TransientFailureDetector::new(),
            adaptive,
        }
    }

    pub fn with_detector(mut self, detector: TransientFailureDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn detector(&self) -> &TransientFailureDetector {
        &self.detector
    }

    /// Rolling failure count of the adaptive variant
    pub fn adaptive_failures(&self) -> Option<u64> {
        self.adaptive
            .as_ref()
            .map(|a| a.failures.load(Ordering::Acquire))
    }

    /// Retries granted to the next execution
    pub fn effective_max_retries(&self) -> u32 {
        match &self.adaptive {
            Some(adaptive) if adaptive.tightened() => {
                self.retry.max_retries + adaptive.config.extra_retries
            }
            _ => self.retry.max_retries,
        }
    }

    /// Run `op` under timeout, circuit breaker and retry
    pub async fn execute<T, F, Fut>(&self, cancel: &Cancellation, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let admission = self.breaker.try_pass()?;
        let outcome = match tokio::time::timeout(self.timeout, self.retry_loop(cancel, &mut op)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(pipeline = %self.name, timeout_ms = self.timeout.as_millis() as u64, "Pipeline timed out");
                Err(Error::Timeout(self.timeout))
            }
        };

        match &outcome {
            Ok(_) => {
                if self.breaker.record_success(admission) == Some(CircuitState::Closed) {
                    self.reset_adaptive();
                }
            }
            Err(Error::BackendTransient(_)) | Err(Error::Timeout(_)) => {
                self.breaker.record_failure(admission);
            }
            Err(_) => self.breaker.record_neutral(admission),
        }
        outcome
    }

    async fn retry_loop<T, F, Fut>(&self, cancel: &Cancellation, op: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let mut retries = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = op() => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !self.detector.is_transient(&error) {
                debug!(pipeline = %self.name, error = %error, "Fatal backend error, not retrying");
                return Err(Error::BackendFatal(error));
            }

            self.note_transient_failure();
            let max_retries = self.effective_max_retries();
            if retries >= max_retries {
                warn!(pipeline = %self.name, attempts = retries + 1, error = %error, "Retries exhausted");
                return Err(Error::BackendTransient(error));
            }

            retries += 1;
            let delay = self.retry.delay_for(retries);
            debug!(
                pipeline = %self.name,
                retry = retries,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient backend error, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn note_transient_failure(&self) {
        let Some(adaptive) = &self.adaptive else {
            return;
        };
        let failures = adaptive.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures == adaptive.config.failure_watermark + 1 {
            self.breaker
                .set_failure_ratio(adaptive.config.tightened_failure_ratio);
            warn!(
                pipeline = %self.name,
                failures,
                failure_ratio = adaptive.config.tightened_failure_ratio,
                extra_retries = adaptive.config.extra_retries,
                "Sustained failures, tightening resilience policy"
            );
        }
    }

    fn reset_adaptive(&self) {
        if let Some(adaptive) = &self.adaptive {
            adaptive.failures.store(0, Ordering::Release);
            self.breaker.set_failure_ratio(adaptive.base_ratio);
            info!(pipeline = %self.name, "Circuit closed, adaptive policy reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffShape;
    use crate::resilience::cancel::CancellationSource;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            max_retries: 2,
            backoff: BackoffShape::Constant,
            base_delay_ms: 10,
            max_delay_ms: 10,
            use_jitter: false,
            failure_ratio: 0.5,
            minimum_throughput: 3,
            sampling_window_ms: 60_000,
            break_duration_ms: 5_000,
            half_open_probes: 1,
            timeout_ms: 1_000,
            adaptive: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let pipeline = ResiliencePipeline::new("meta", &config());
        let calls = Arc::new(AtomicU32::new(0));

        let result = pipeline
            .execute(&Cancellation::never(), || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BackendError::new(1205, "deadlock victim"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_retried() {
        let pipeline = ResiliencePipeline::new("meta", &config());
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = pipeline
            .execute(&Cancellation::never(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BackendError::new(208, "invalid object name"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::BackendFatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let pipeline = ResiliencePipeline::new("meta", &config());
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = pipeline
            .execute(&Cancellation::never(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BackendError::timeout("command timeout"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::BackendTransient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout() {
        let mut cfg = config();
        cfg.timeout_ms = 50;
        let pipeline = ResiliencePipeline::new("meta", &cfg);

        let result: Result<()> = pipeline
            .execute(&Cancellation::never(), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retrying() {
        let mut cfg = config();
        cfg.max_retries = 10;
        cfg.base_delay_ms = 100;
        cfg.max_delay_ms = 100;
        let pipeline = ResiliencePipeline::new("meta", &cfg);
        let source = CancellationSource::new();
        let token = source.token();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = pipeline
            .execute(&token, || {
                let calls = calls.clone();
                let source = &source;
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                        source.cancel();
                    }
                    Err(BackendError::new(40501, "service busy"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_never_calls_backend() {
        let pipeline = ResiliencePipeline::new("meta", &config());
        let source = CancellationSource::new();
        source.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<()> = pipeline
            .execute(&source.token(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_tightens_and_resets_on_close() {
        let mut cfg = config();
        cfg.max_retries = 0;
        cfg.minimum_throughput = 4;
        cfg.break_duration_ms = 1_000;
        cfg.adaptive = Some(AdaptiveConfig {
            failure_watermark: 2,
            extra_retries: 1,
            tightened_failure_ratio: 0.1,
        });
        let pipeline = ResiliencePipeline::new("meta", &cfg);
        let failing = || async { Err::<(), _>(BackendError::new(1205, "deadlock")) };

        assert_eq!(pipeline.effective_max_retries(), 0);
        for _ in 0..3 {
            let _ = pipeline.execute(&Cancellation::never(), failing).await;
        }
        assert_eq!(pipeline.adaptive_failures(), Some(3));
        assert_eq!(pipeline.effective_max_retries(), 1);
        assert_eq!(pipeline.breaker().failure_ratio(), 0.1);

        // One more failing sample reaches the minimum throughput and opens the circuit
        let _ = pipeline.execute(&Cancellation::never(), failing).await;
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        pipeline
            .execute(&Cancellation::never(), || async { Ok::<_, BackendError>(()) })
            .await
            .unwrap();

        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
        assert_eq!(pipeline.adaptive_failures(), Some(0));
        assert_eq!(pipeline.effective_max_retries(), 0);
        assert_eq!(pipeline.breaker().failure_ratio(), 0.5);
    }
}
