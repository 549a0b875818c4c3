use crate::types::RetryConfig;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

/// Retry executor with exponential backoff
///
/// Retry policy lives with the caller; the circuit breaker itself never
/// retries. Compose the two by running the breaker-guarded call inside the
/// executor.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute a function with retries
    pub fn execute<F, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        self.run(&mut f, |_| true)
    }

    /// Execute with retries, but only if the error matches the predicate
    pub fn execute_with_predicate<F, T, E, P>(&self, mut f: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        self.run(&mut f, should_retry)
    }

    fn run<F, T, E, P>(&self, f: &mut F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                attempt,
                max_retries = self.config.max_retries,
                "Executing call"
            );

            match f() {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Call succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(attempt, error = %e, "Error not retryable");
                        return Err(e);
                    }

                    if attempt > self.config.max_retries {
                        warn!(
                            attempt,
                            max_retries = self.config.max_retries,
                            error = %e,
                            "Call failed after max retries"
                        );
                        return Err(e);
                    }

                    if let Some(wait) = backoff.next_backoff() {
                        debug!(
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            error = %e,
                            "Call failed, retrying after backoff"
                        );
                        std::thread::sleep(wait);
                    } else {
                        warn!(attempt, error = %e, "Backoff exhausted");
                        return Err(e);
                    }
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff())
            .with_max_interval(self.config.max_backoff())
            .with_multiplier(self.config.backoff_multiplier)
            .with_max_elapsed_time(None) // Max retries are handled manually
            .build()
    }
}
