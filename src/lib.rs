//! Circuit breaker library for guarding calls to unreliable dependencies.
//!
//! A breaker tracks consecutive failures and cycles through three states:
//!
//! ```text
//! ┌────────┐  failure threshold  ┌──────┐  cooldown elapsed  ┌──────────┐
//! │ Closed │ ───────reached────→ │ Open │ ──────────────────→│ HalfOpen │
//! └────────┘                     └──────┘ ←──probe fails──── └──────────┘
//!      ↑                                                          │
//!      └──────────────── success threshold met ───────────────────┘
//! ```
//!
//! Transitions are evaluated lazily when a call arrives; there is no
//! background timer. The wrapped function runs outside the breaker's lock,
//! so the protected dependency is never serialized.
//!
//! ```
//! use fusegate::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("payments", CircuitBreakerConfig::default());
//! let result = breaker.call(|| Ok::<_, String>("charged"));
//! assert_eq!(result.unwrap(), "charged");
//! ```

pub mod breaker;
pub mod error;
pub mod registry;
pub mod retry;
pub mod types;

pub use breaker::{fallback, CircuitBreaker, Fallback};
pub use error::{CircuitBreakerError, ConfigError};
pub use registry::{
    get_all_circuit_breakers, get_circuit_breaker, reset_all_circuit_breakers, Registry,
};
pub use retry::RetryExecutor;
pub use types::{
    BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, RetryConfig,
    StateChange,
};
