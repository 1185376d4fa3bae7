//! Transient failure classification
//!
//! Backend errors carry an optional numeric condition code. Codes listed
//! in [`TRANSIENT_ERRORS`] are worth retrying; everything else is fatal.
//! A generic operation timeout is always transient.

use std::fmt;

/// Error reported by the metadata backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub code: Option<i32>,
    pub message: String,
    /// The operation gave up waiting (driver or command timeout)
    pub timed_out: bool,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            timed_out: false,
        }
    }

    /// Error without a backend condition code
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            timed_out: true,
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None if self.timed_out => write!(f, "{} (timeout)", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// Family of a retryable backend condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientCondition {
    DeadlockVictim,
    Timeout,
    NetworkPath,
    ServiceBusy,
    ServiceUnavailable,
}

/// Backend condition codes that are safe to retry
pub const TRANSIENT_ERRORS: &[(i32, TransientCondition)] = &[
    (1205, TransientCondition::DeadlockVictim),
    (-2, TransientCondition::Timeout),
    (1222, TransientCondition::Timeout),
    (53, TransientCondition::NetworkPath),
    (64, TransientCondition::NetworkPath),
    (121, TransientCondition::NetworkPath),
    (233, TransientCondition::NetworkPath),
    (10053, TransientCondition::NetworkPath),
    (10054, TransientCondition::NetworkPath),
    (10060, TransientCondition::NetworkPath),
    (10928, TransientCondition::ServiceBusy),
    (10929, TransientCondition::ServiceBusy),
    (40501, TransientCondition::ServiceBusy),
    (49918, TransientCondition::ServiceBusy),
    (49919, TransientCondition::ServiceBusy),
    (49920, TransientCondition::ServiceBusy),
    (4060, TransientCondition::ServiceUnavailable),
    (40197, TransientCondition::ServiceUnavailable),
    (40613, TransientCondition::ServiceUnavailable),
];

/// Table-driven transient/fatal classifier
#[derive(Debug, Clone, Default)]
pub struct TransientFailureDetector {
    extra: Vec<(i32, TransientCondition)>,
}

impl TransientFailureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat an additional code as transient
    pub fn with_code(mut self, code: i32, condition: TransientCondition) -> Self {
        self.extra.push((code, condition));
        self
    }

    pub fn classify(&self, error: &BackendError) -> Option<TransientCondition> {
        if error.timed_out {
            return Some(TransientCondition::Timeout);
        }
        let code = error.code?;
        TRANSIENT_ERRORS
            .iter()
            .chain(self.extra.iter())
            .find(|(known, _)| *known == code)
            .map(|(_, condition)| *condition)
    }

    pub fn is_transient(&self, error: &BackendError) -> bool {
        self.classify(error).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_entry_is_transient() {
        let detector = TransientFailureDetector::new();
        for (code, condition) in TRANSIENT_ERRORS {
            let error = BackendError::new(*code, "boom");
            assert_eq!(detector.classify(&error), Some(*condition), "code {}", code);
        }
    }

    #[test]
    fn test_unknown_codes_are_fatal() {
        let detector = TransientFailureDetector::new();
        for code in [0, 102, 207, 208, 2627, 18456] {
            assert!(!detector.is_transient(&BackendError::new(code, "nope")));
        }
        assert!(!detector.is_transient(&BackendError::other("parse failure")));
    }

    #[test]
    fn test_generic_timeout_is_transient() {
        let detector = TransientFailureDetector::new();
        assert_eq!(
            detector.classify(&BackendError::timeout("command timeout")),
            Some(TransientCondition::Timeout)
        );
    }

    #[test]
    fn test_extra_codes() {
        let detector =
            TransientFailureDetector::new().with_code(50000, TransientCondition::ServiceBusy);
        assert!(detector.is_transient(&BackendError::new(50000, "custom throttle")));
    }

    #[test]
    fn test_display_includes_code() {
        let error = BackendError::new(1205, "chosen as deadlock victim");
        assert_eq!(error.to_string(), "chosen as deadlock victim (code 1205)");
    }
}
