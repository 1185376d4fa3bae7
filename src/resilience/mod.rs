//! Resilience for backend metadata calls
//!
//! - [`TransientFailureDetector`]: table-driven transient/fatal split
//! - [`ResiliencePipeline`]: timeout around circuit breaker around retry
//! - [`Cancellation`]: cooperative cancellation checked between attempts

pub mod cancel;
pub mod circuit_breaker;
pub mod pipeline;
pub mod retry;
pub mod transient;

pub use cancel::{Cancellation, CancellationSource};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use pipeline::ResiliencePipeline;
pub use retry::RetryPolicy;
pub use transient::{BackendError, TransientCondition, TransientFailureDetector, TRANSIENT_ERRORS};
