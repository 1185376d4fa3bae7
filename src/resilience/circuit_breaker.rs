//! Circuit breaker
//!
//! ```text
//!            failure ratio >= threshold
//!            (with minimum throughput)
//!   Closed ─────────────────────────────▶ Open
//!     ▲                                    │ break duration elapsed
//!     │ probe succeeded                    ▼
//!     └──────────────────────────────── HalfOpen
//!                probe failed → Open (break timer restarts)
//! ```
//!
//! Outcomes are kept in a sliding window of `sampling_window`. The window
//! is cleared when the circuit closes.

use crate::config::ResilienceConfig;
use crate::error::{Error, Result};
use crate::metrics::CIRCUIT_TRANSITIONS;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_pass`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

struct BreakerState {
    state: CircuitState,
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    failure_ratio: f64,
}

pub struct CircuitBreaker {
    name: String,
    minimum_throughput: u32,
    sampling_window: Duration,
    break_duration: Duration,
    half_open_probes: u32,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self {
            name: name.into(),
            minimum_throughput: config.minimum_throughput.max(1),
            sampling_window: config.sampling_window(),
            break_duration: config.break_duration(),
            half_open_probes: config.half_open_probes.max(1),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
                failure_ratio: config.failure_ratio,
            }),
        }
    }

    /// Current state; an open circuit whose break has elapsed reports half-open
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) if opened.elapsed() >= self.break_duration => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn failure_ratio(&self) -> f64 {
        self.inner.lock().failure_ratio
    }

    pub fn set_failure_ratio(&self, ratio: f64) {
        self.inner.lock().failure_ratio = ratio;
    }

    /// Ask to call the backend; fails fast while open
    pub fn try_pass(&self) -> Result<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let opened = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened.elapsed();
                if elapsed < self.break_duration {
                    return Err(Error::CircuitOpen {
                        retry_after: self.break_duration - elapsed,
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probes_in_flight = 1;
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.half_open_probes {
                    inner.probes_in_flight += 1;
                    Ok(Admission::Probe)
                } else {
                    Err(Error::CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                }
            }
        }
    }

    /// Record a successful call; returns the new state if it changed
    pub fn record_success(&self, admission: Admission) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Probe) => {
                inner.outcomes.clear();
                inner.probes_in_flight = 0;
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
                Some(CircuitState::Closed)
            }
            (CircuitState::Closed, _) => {
                self.push_outcome(&mut inner, true);
                None
            }
            _ => None,
        }
    }

    /// Record a failed call; returns the new state if it changed
    pub fn record_failure(&self, admission: Admission) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Probe) => {
                inner.probes_in_flight = 0;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
                Some(CircuitState::Open)
            }
            (CircuitState::Closed, _) => {
                self.push_outcome(&mut inner, false);
                let total = inner.outcomes.len() as u32;
                let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count() as u32;
                if total >= self.minimum_throughput
                    && f64::from(failures) / f64::from(total) >= inner.failure_ratio
                {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// A call ended without a verdict (fatal error, cancellation); frees its probe slot
    pub fn record_neutral(&self, admission: Admission) {
        if admission == Admission::Probe {
            let mut inner = self.inner.lock();
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    fn push_outcome(&self, inner: &mut BreakerState, success: bool) {
        let now = Instant::now();
        inner.outcomes.push_back((now, success));
        while let Some((at, _)) = inner.outcomes.front() {
            if now.duration_since(*at) > self.sampling_window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        CIRCUIT_TRANSITIONS.with_label_values(&[to.as_str()]).inc();
        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = from.as_str(),
                break_ms = self.break_duration.as_millis() as u64,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(breaker = %self.name, "Circuit half-open, probing"),
            CircuitState::Closed => info!(breaker = %self.name, "Circuit closed"),
        }
    }
}
