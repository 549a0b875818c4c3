use std::time::Duration;
use thiserror::Error;

/// Error returned by a guarded call
///
/// The breaker is transparent to the wrapped call's own error: a failure
/// comes back as [`Inner`](CircuitBreakerError::Inner) carrying the original
/// error unchanged.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The breaker refused the call because the circuit is open or the
    /// half-open probe quota is exhausted
    #[error("circuit breaker '{name}' is open, retry after {retry_after:?}")]
    Open {
        /// Name of the breaker that rejected the call
        name: String,
        /// The breaker's configured open-state cooldown
        retry_after: Duration,
    },

    /// The call was admitted and the wrapped function failed
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// True if the call was rejected without reaching the wrapped function
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// The wrapped function's own error, if the call was admitted
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

/// Invalid breaker or retry configuration
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error("max_backoff_ms must not be less than initial_backoff_ms")]
    BackoffRange,

    #[error("backoff_multiplier must be at least 1.0")]
    MultiplierBelowOne,
}
