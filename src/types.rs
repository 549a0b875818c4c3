use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, calls flow normally
    Closed,
    /// Circuit is open, calls are rejected
    Open,
    /// Circuit is half-open, allowing probe calls
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Number of consecutive successes in half-open state before closing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Duration to wait in open state before transitioning to half-open,
    /// in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Nominal tracking window in milliseconds. Accepted for forward
    /// compatibility; failure counting is consecutive-count based and this
    /// field is not enforced as a sliding window.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum number of calls admitted while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_timeout_ms(),
            window_ms: default_window_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    /// The open-state cooldown as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The nominal tracking window as a [`Duration`]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroValue {
                field: "failure_threshold",
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::ZeroValue {
                field: "success_threshold",
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroValue { field: "timeout_ms" });
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::ZeroValue {
                field: "half_open_max_calls",
            });
        }
        Ok(())
    }
}

/// Default number of retry attempts after the initial call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default ceiling on the backoff delay, in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Default factor applied to the delay after each failed attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for [`RetryExecutor`](crate::retry::RetryExecutor)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry attempts after the initial call; zero disables retries
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,
    /// Ceiling on the backoff delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Factor applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::ZeroValue {
                field: "initial_backoff_ms",
            });
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::BackoffRange);
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::MultiplierBelowOne);
        }
        Ok(())
    }
}

/// A single recorded state transition
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// State before the transition
    pub from: CircuitState,
    /// State after the transition
    pub to: CircuitState,
}

/// Cumulative circuit breaker statistics
///
/// Counters are monotonic; `reset()` on the breaker does not touch them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerStats {
    /// Number of calls admitted for execution
    pub total_calls: u64,
    /// Number of calls that completed successfully
    pub success_count: u64,
    /// Number of calls recorded as failures
    pub failure_count: u64,
    /// Number of calls rejected without reaching the wrapped function
    pub rejected_count: u64,
    /// Timestamp of the most recent success
    pub last_success_time: Option<DateTime<Utc>>,
    /// Timestamp of the most recent failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Append-only log of state transitions
    pub state_changes: Vec<StateChange>,
}

impl CircuitBreakerStats {
    /// Fraction of admitted calls that succeeded, floored at 1 call
    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / self.total_calls.max(1) as f64
    }

    /// Fraction of admitted calls that failed, floored at 1 call
    pub fn failure_rate(&self) -> f64 {
        self.failure_count as f64 / self.total_calls.max(1) as f64
    }
}

/// Point-in-time view of a breaker: live state merged with its stats
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub state_changes: Vec<StateChange>,
}
