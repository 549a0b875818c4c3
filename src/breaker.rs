use crate::error::CircuitBreakerError;
use crate::types::{BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, StateChange};
use chrono::Utc;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Type-erased fallback producer, invoked instead of raising when the
/// breaker rejects a call while open
pub type Fallback = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Build a [`Fallback`] from a typed producer
pub fn fallback<T, F>(f: F) -> Fallback
where
    T: Send + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    Arc::new(move || Box::new(f()) as Box<dyn Any + Send>)
}

/// Circuit breaker guarding calls to a single unreliable dependency
///
/// The breaker is a three-state machine (Closed, Open, HalfOpen). State
/// transitions are evaluated lazily when a call arrives; there is no
/// background timer. The mutex covers admission and bookkeeping only — the
/// wrapped function always executes outside the lock, so concurrent calls
/// through the same breaker run in parallel.
pub struct CircuitBreaker {
    /// Breaker identity, used by the registry
    name: String,
    /// Configuration
    config: CircuitBreakerConfig,
    /// Optional substitute invoked on open-circuit rejection
    fallback: Option<Fallback>,
    /// Mutable state
    inner: Mutex<Inner>,
}

struct Inner {
    /// Current circuit state
    state: CircuitState,
    /// Number of consecutive failures in closed state
    consecutive_failures: u32,
    /// Number of consecutive successes in half-open state
    consecutive_successes: u32,
    /// Number of calls admitted during the current half-open period
    half_open_calls: u32,
    /// Time when the circuit was opened
    opened_at: Option<Instant>,
    /// Cumulative stats
    stats: CircuitBreakerStats,
}

/// Outcome of the admission check at call entry
enum Admission {
    Proceed,
    Rejected {
        retry_after: Duration,
        /// The half-open quota sub-case never consults the fallback
        fallback_allowed: bool,
    },
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_ms = config.timeout_ms,
            half_open_max_calls = config.half_open_max_calls,
            "Creating circuit breaker"
        );

        Self {
            name,
            config,
            fallback: None,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_calls: 0,
                opened_at: None,
                stats: CircuitBreakerStats::default(),
            }),
        }
    }

    /// Attach a fallback producer
    ///
    /// While the circuit is open, `call` returns the fallback's value instead
    /// of [`CircuitBreakerError::Open`]. The produced value must match the
    /// call site's return type; on a mismatch the rejection error is returned
    /// and a warning is logged.
    pub fn with_fallback<T, F>(self, f: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.with_fallback_producer(fallback(f))
    }

    /// Attach an already-erased fallback producer
    pub fn with_fallback_producer(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Execute a function through the breaker
    ///
    /// Every `Err` the function returns counts as a circuit failure and is
    /// handed back unchanged as [`CircuitBreakerError::Inner`]. Use
    /// [`call_with_predicate`](Self::call_with_predicate) to narrow which
    /// errors move the breaker toward open.
    pub fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        T: 'static,
    {
        self.call_with_predicate(f, |_| true)
    }

    /// Execute a function, counting only errors matching `is_failure`
    ///
    /// Errors the predicate rejects still propagate to the caller but do not
    /// move the breaker toward open.
    pub fn call_with_predicate<F, T, E, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        P: Fn(&E) -> bool,
        T: 'static,
    {
        match self.admit() {
            Admission::Rejected {
                retry_after,
                fallback_allowed,
            } => self.reject(retry_after, fallback_allowed),
            Admission::Proceed => {
                let started = Instant::now();
                let outcome = f();
                self.settle(outcome, started.elapsed(), is_failure)
            }
        }
    }

    /// Execute a future-producing function through the breaker
    ///
    /// Same gating and bookkeeping as [`call`](Self::call); the future is
    /// awaited outside the lock. Runtime-agnostic.
    pub async fn call_async<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: 'static,
    {
        match self.admit() {
            Admission::Rejected {
                retry_after,
                fallback_allowed,
            } => self.reject(retry_after, fallback_allowed),
            Admission::Proceed => {
                let started = Instant::now();
                let outcome = f().await;
                self.settle(outcome, started.elapsed(), |_| true)
            }
        }
    }

    /// Force the breaker back to closed, clearing all consecutive counters
    ///
    /// Cumulative stats are untouched. Intended for manual recovery.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_calls = 0;
        inner.opened_at = None;
        info!(breaker = %self.name, %from, "Circuit breaker reset");
    }

    /// Clear the cumulative stats counters and transition log
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.stats = CircuitBreakerStats::default();
    }

    /// Snapshot of live state merged with cumulative stats
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_calls: inner.half_open_calls,
            total_calls: inner.stats.total_calls,
            success_count: inner.stats.success_count,
            failure_count: inner.stats.failure_count,
            rejected_count: inner.stats.rejected_count,
            success_rate: inner.stats.success_rate(),
            failure_rate: inner.stats.failure_rate(),
            last_success_time: inner.stats.last_success_time,
            last_failure_time: inner.stats.last_failure_time,
            state_changes: inner.stats.state_changes.clone(),
        }
    }

    /// Cumulative stats
    pub fn stats(&self) -> CircuitBreakerStats {
        self.inner.lock().stats.clone()
    }

    /// Decide whether an arriving call may proceed, applying the lazy
    /// Open -> HalfOpen transition when the cooldown has elapsed
    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.stats.total_calls += 1;
                Admission::Proceed
            }
            CircuitState::Open => {
                if let Some(opened_at) = inner.opened_at {
                    let elapsed = opened_at.elapsed();
                    if elapsed >= self.config.timeout() {
                        self.transition(&mut inner, CircuitState::HalfOpen);
                        inner.stats.total_calls += 1;
                        inner.half_open_calls += 1;
                        Admission::Proceed
                    } else {
                        inner.stats.rejected_count += 1;
                        debug!(
                            breaker = %self.name,
                            time_remaining_ms = (self.config.timeout() - elapsed).as_millis() as u64,
                            "Circuit open, rejecting call"
                        );
                        // The rejection error always carries the configured
                        // cooldown, not the time remaining
                        Admission::Rejected {
                            retry_after: self.config.timeout(),
                            fallback_allowed: true,
                        }
                    }
                } else {
                    warn!(breaker = %self.name, "Circuit open but no opened_at timestamp");
                    inner.stats.rejected_count += 1;
                    Admission::Rejected {
                        retry_after: self.config.timeout(),
                        fallback_allowed: true,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.stats.total_calls += 1;
                    inner.half_open_calls += 1;
                    debug!(
                        breaker = %self.name,
                        half_open_calls = inner.half_open_calls,
                        max = self.config.half_open_max_calls,
                        "Admitting half-open probe call"
                    );
                    Admission::Proceed
                } else {
                    inner.stats.rejected_count += 1;
                    debug!(
                        breaker = %self.name,
                        "Half-open probe quota exhausted, rejecting"
                    );
                    Admission::Rejected {
                        retry_after: self.config.timeout(),
                        fallback_allowed: false,
                    }
                }
            }
        }
    }

    /// Produce the rejection result: the fallback's value when one is
    /// configured and permitted, otherwise the open-circuit error
    fn reject<T, E>(
        &self,
        retry_after: Duration,
        fallback_allowed: bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        T: 'static,
    {
        if fallback_allowed {
            if let Some(fallback) = &self.fallback {
                match fallback().downcast::<T>() {
                    Ok(value) => {
                        debug!(breaker = %self.name, "Returning fallback value");
                        return Ok(*value);
                    }
                    Err(_) => {
                        warn!(
                            breaker = %self.name,
                            "Fallback value type does not match call site, rejecting"
                        );
                    }
                }
            }
        }
        Err(CircuitBreakerError::Open {
            name: self.name.clone(),
            retry_after,
        })
    }

    /// Record the outcome of an admitted call
    fn settle<T, E, P>(
        &self,
        outcome: Result<T, E>,
        elapsed: Duration,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        P: Fn(&E) -> bool,
    {
        match outcome {
            Ok(value) => {
                self.on_success(elapsed);
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.on_failure(elapsed);
                } else {
                    debug!(
                        breaker = %self.name,
                        "Error did not match failure predicate, not counted"
                    );
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn on_success(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.stats.success_count += 1;
        inner.stats.last_success_time = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                // Consecutive failures do not accumulate across successes
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                debug!(
                    breaker = %self.name,
                    consecutive_successes = inner.consecutive_successes,
                    threshold = self.config.success_threshold,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Half-open probe call succeeded"
                );

                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                warn!(breaker = %self.name, "Recording success in open state");
            }
        }
    }

    fn on_failure(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.stats.failure_count += 1;
        inner.stats.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                debug!(
                    breaker = %self.name,
                    consecutive_failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Call failed in closed state"
                );

                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    breaker = %self.name,
                    "Half-open probe call failed, reopening circuit"
                );
                // Any failure while probing reopens the circuit
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Recording failure in open state");
            }
        }
    }

    /// Move to `to`, appending to the transition log and resetting the
    /// counters the new state owns. No-op when already in `to`.
    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.stats.state_changes.push(StateChange {
            timestamp: Utc::now(),
            from,
            to,
        });
        info!(breaker = %self.name, %from, %to, "Circuit breaker state change");

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.half_open_calls = 0;
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn failing() -> Result<(), String> {
        Err("boom".to_string())
    }

    fn succeeding() -> Result<u32, String> {
        Ok(42)
    }

    #[test]
    fn test_breaker_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert!(cb.is_closed());
        assert_eq!(cb.call(succeeding).unwrap(), 42);
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            assert!(cb.call(failing).is_err());
            assert!(cb.is_closed());
        }
        assert!(cb.call(failing).is_err());
        assert!(cb.is_open());

        // Next call is rejected without reaching the function
        let err = cb.call(succeeding).unwrap_err();
        assert!(err.is_open());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            let _ = cb.call(failing);
        }
        assert!(cb.call(succeeding).is_ok());

        // Counter was reset; one more failure must not open the circuit
        let _ = cb.call(failing);
        assert!(cb.is_closed());

        for _ in 0..2 {
            let _ = cb.call(failing);
        }
        assert!(cb.is_open());
    }

    #[test]
    fn test_cooldown_transitions_to_half_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            timeout_ms: 50,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            let _ = cb.call(failing);
        }
        assert!(cb.is_open());

        // Before the cooldown elapses, calls are rejected
        assert!(cb.call(succeeding).unwrap_err().is_open());

        sleep(Duration::from_millis(60));
        assert_eq!(cb.call(succeeding).unwrap(), 42);
        assert!(cb.is_half_open());
    }

    #[test]
    fn test_half_open_success_closes_circuit() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            half_open_max_calls: 3,
            timeout_ms: 10,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            let _ = cb.call(failing);
        }
        sleep(Duration::from_millis(20));

        assert!(cb.call(succeeding).is_ok());
        assert!(cb.is_half_open());
        assert!(cb.call(succeeding).is_ok());
        assert!(cb.is_closed());

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.consecutive_successes, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_circuit() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            timeout_ms: 10,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            let _ = cb.call(failing);
        }
        sleep(Duration::from_millis(20));

        let err = cb.call(failing).unwrap_err();
        assert!(!err.is_open());
        assert!(cb.is_open());

        // The cooldown clock restarted; an immediate call is rejected again
        assert!(cb.call(succeeding).unwrap_err().is_open());
    }

    #[test]
    fn test_half_open_call_quota() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 5,
            half_open_max_calls: 2,
            timeout_ms: 10,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            let _ = cb.call(failing);
        }
        sleep(Duration::from_millis(20));

        // Two probe calls are admitted, the third is rejected even though
        // no probe has failed
        assert!(cb.call(succeeding).is_ok());
        assert!(cb.call(succeeding).is_ok());
        assert!(cb.is_half_open());
        assert!(cb.call(succeeding).unwrap_err().is_open());
    }

    #[test]
    fn test_fallback_returns_value_when_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config).with_fallback(|| 7u32);

        let _ = cb.call(|| Err::<u32, _>("down".to_string()));
        assert!(cb.is_open());

        let value = cb
            .call(|| Ok::<u32, String>(42))
            .expect("fallback should produce a value");
        assert_eq!(value, 7);

        let stats = cb.stats();
        assert_eq!(stats.rejected_count, 1);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.failure_count, 1);
    }

    #[test]
    fn test_fallback_not_consulted_at_half_open_quota() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 5,
            half_open_max_calls: 1,
            timeout_ms: 10,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config).with_fallback(|| 7u32);

        let _ = cb.call(|| Err::<u32, _>("down".to_string()));
        sleep(Duration::from_millis(20));

        assert!(cb.call(|| Ok::<u32, String>(1)).is_ok());
        assert!(cb.is_half_open());

        // Quota exhausted: the error is returned even with a fallback present
        assert!(cb.call(|| Ok::<u32, String>(1)).unwrap_err().is_open());
    }

    #[test]
    fn test_fallback_type_mismatch_rejects() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config).with_fallback(|| "cached".to_string());

        let _ = cb.call(|| Err::<u32, _>("down".to_string()));
        assert!(cb.is_open());

        // Call site expects u32, fallback produces String
        assert!(cb.call(|| Ok::<u32, String>(1)).unwrap_err().is_open());
    }

    #[test]
    fn test_stats_additivity() {
        let config = CircuitBreakerConfig {
            failure_threshold: 10,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..3 {
            let _ = cb.call(succeeding);
        }
        for _ in 0..2 {
            let _ = cb.call(failing);
        }

        let stats = cb.stats();
        assert_eq!(stats.total_calls, 5);
        assert_eq!(stats.success_count + stats.failure_count, stats.total_calls);
        assert_eq!(stats.rejected_count, 0);
        assert_eq!(stats.success_rate(), 0.6);
    }

    #[test]
    fn test_reset_returns_to_ground_state() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            let _ = cb.call(failing);
        }
        assert!(cb.is_open());
        let failures_before = cb.stats().failure_count;

        cb.reset();
        assert!(cb.is_closed());

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.consecutive_successes, 0);
        assert_eq!(snapshot.half_open_calls, 0);
        // Cumulative stats survive a reset
        assert_eq!(snapshot.failure_count, failures_before);
    }

    #[test]
    fn test_predicate_filters_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        // "client" errors are not infrastructure failures
        let err = cb
            .call_with_predicate(|| Err::<(), _>("client".to_string()), |e| e != "client")
            .unwrap_err();
        assert_eq!(err.into_inner(), Some("client".to_string()));
        assert!(cb.is_closed());
        assert_eq!(cb.stats().failure_count, 0);

        let _ = cb.call_with_predicate(|| Err::<(), _>("io".to_string()), |e| e != "client");
        assert!(cb.is_open());
    }

    #[test]
    fn test_state_change_log_is_append_only() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout_ms: 10,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        let _ = cb.call(failing);
        sleep(Duration::from_millis(20));
        let _ = cb.call(succeeding);

        let changes = cb.stats().state_changes;
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].from, CircuitState::Closed);
        assert_eq!(changes[0].to, CircuitState::Open);
        assert_eq!(changes[1].from, CircuitState::Open);
        assert_eq!(changes[1].to, CircuitState::HalfOpen);
        assert_eq!(changes[2].from, CircuitState::HalfOpen);
        assert_eq!(changes[2].to, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_async_tracks_state() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        assert_eq!(
            cb.call_async(|| async { Ok::<_, String>("ok") }).await.unwrap(),
            "ok"
        );

        for _ in 0..2 {
            let _ = cb
                .call_async(|| async { Err::<(), _>("down".to_string()) })
                .await;
        }
        assert!(cb.is_open());

        let err = cb
            .call_async(|| async { Ok::<_, String>("ok") })
            .await
            .unwrap_err();
        assert!(err.is_open());
    }
}
