//! Cross-process mutual exclusion
//!
//! Named locks carry all inter-process coordination; there is no message
//! passing between processes. [`StripedLockPool`] bounds the number of
//! locks needed for per-key exclusion.

pub mod named_lock;
pub mod striped;

pub use named_lock::{LockAcquired, LockNamespace, LockScope, NamedLock, NamedLockGuard};
pub use striped::StripedLockPool;
