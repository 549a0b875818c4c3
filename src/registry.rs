use crate::breaker::{CircuitBreaker, Fallback};
use crate::types::{BreakerSnapshot, CircuitBreakerConfig};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Named pool of circuit breakers
///
/// Call sites normally hold a reference to a `Registry`; the free functions
/// below operate on a default process-wide instance for convenience. First
/// registration wins: later lookups with a different config return the
/// original breaker unchanged.
#[derive(Debug, Clone)]
pub struct Registry {
    /// Breakers by name
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    /// Configuration applied when a lookup does not supply one
    default_config: CircuitBreakerConfig,
}

impl Registry {
    /// Create a registry with the given default configuration
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            default_config,
        }
    }

    /// Get the breaker registered under `name`, creating it if absent
    ///
    /// A `config` is only used when the breaker does not exist yet.
    pub fn get_or_create(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, |name| {
            CircuitBreaker::new(name, config.unwrap_or_else(|| self.default_config.clone()))
        })
    }

    /// Get the breaker registered under `name`, building it with `build` if
    /// absent — used to attach a fallback at registration time
    pub fn get_or_create_with<F>(&self, name: &str, build: F) -> Arc<CircuitBreaker>
    where
        F: FnOnce(&str) -> CircuitBreaker,
    {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = name, "Registering circuit breaker");
                Arc::new(build(name))
            })
            .clone()
    }

    /// The breaker registered under `name`, if any
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.clone())
    }

    /// Shallow copy of the pool, safe to iterate without holding any lock
    pub fn all(&self) -> HashMap<String, Arc<CircuitBreaker>> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Registered breaker names
    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every registered breaker
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Reset every registered breaker to closed
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The default process-wide registry
pub fn global() -> &'static Registry {
    GLOBAL_REGISTRY.get_or_init(Registry::default)
}

/// Get or create a named breaker in the process-wide registry
///
/// Both `config` and `fallback` are only used when the breaker does not
/// exist yet; the first registration wins and is cached for the process
/// lifetime.
pub fn get_circuit_breaker(
    name: &str,
    config: Option<CircuitBreakerConfig>,
    fallback: Option<Fallback>,
) -> Arc<CircuitBreaker> {
    let registry = global();
    registry.get_or_create_with(name, |name| {
        let breaker = CircuitBreaker::new(
            name,
            config.unwrap_or_else(|| registry.default_config.clone()),
        );
        match fallback {
            Some(fallback) => breaker.with_fallback_producer(fallback),
            None => breaker,
        }
    })
}

/// Shallow copy of the process-wide registry
pub fn get_all_circuit_breakers() -> HashMap<String, Arc<CircuitBreaker>> {
    global().all()
}

/// Reset every breaker in the process-wide registry to closed
pub fn reset_all_circuit_breakers() {
    global().reset_all();
}
