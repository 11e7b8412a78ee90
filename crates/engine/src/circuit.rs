//! Circuit breaker over provider health.
//!
//! Closed -> Open after `failure_threshold` consecutive failures.
//! Open -> Half-Open once `recovery_timeout_ms` has passed since the last failure.
//! Half-Open -> Closed on the next success, back to Open on the next failure.
//!
//! The cache holds the fast projection; the persisted record is the fallback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use conductor_core::{CircuitBreakerState, Clock, ProviderHealth, ProviderId, ProviderRegistry};
use conductor_infra::{Cache, ProviderHealthStore, StoreError};

use crate::health::circuit_key;

/// Where a circuit state came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitLookup {
    /// Fresh projection from the cache.
    Cached(CircuitBreakerState),
    /// Derived from the persisted health record after a cache miss.
    Fallback(CircuitBreakerState),
    /// Nothing known about the provider; treated as closed.
    Unknown,
}

impl CircuitLookup {
    pub fn state(&self) -> Option<&CircuitBreakerState> {
        match self {
            CircuitLookup::Cached(state) | CircuitLookup::Fallback(state) => Some(state),
            CircuitLookup::Unknown => None,
        }
    }
}

pub struct CircuitBreaker {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn ProviderHealthStore>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
}

impl CircuitBreaker {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn ProviderHealthStore>,
        cache: Arc<dyn Cache>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            cache,
            clock,
            cache_ttl,
        }
    }

    /// Look up the circuit state without changing it.
    pub async fn inspect(&self, provider: &ProviderId) -> CircuitLookup {
        let key = circuit_key(provider);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<CircuitBreakerState>(&raw) {
                Ok(state) => return CircuitLookup::Cached(state),
                Err(e) => warn!(provider = %provider, error = %e, "discarding unreadable circuit state"),
            },
            Ok(None) => {}
            Err(e) => warn!(provider = %provider, error = %e, "circuit cache unavailable"),
        }

        match self.store.get(provider).await {
            Ok(Some(health)) => CircuitLookup::Fallback(health.circuit_state()),
            Ok(None) => CircuitLookup::Unknown,
            Err(e) => {
                warn!(provider = %provider, error = %e, "failed to read provider health");
                CircuitLookup::Unknown
            }
        }
    }

    /// Whether requests to `provider` should be held back.
    ///
    /// An open circuit whose recovery timeout has elapsed flips to half-open,
    /// is written back to the cache, and reports closed.
    pub async fn is_open(&self, provider: &ProviderId) -> bool {
        let Some(state) = self.inspect(provider).await.state().cloned() else {
            return false;
        };
        if !state.is_open {
            return false;
        }

        let now = self.clock.now();
        if state.recovery_elapsed(now) {
            let half_open = state.into_half_open(now);
            self.write_cache(&half_open).await;
            info!(provider = %provider, "circuit half-open");
            return false;
        }
        true
    }

    /// Current state of every configured provider's circuit. Read only: an open
    /// circuit past its recovery timeout is reported as stored, not flipped.
    /// Providers with no history report a closed circuit.
    pub async fn states(&self) -> BTreeMap<ProviderId, CircuitBreakerState> {
        let mut states = BTreeMap::new();
        for provider in self.registry.ids() {
            let state = match self.inspect(provider).await {
                CircuitLookup::Cached(state) | CircuitLookup::Fallback(state) => state,
                CircuitLookup::Unknown => ProviderHealth::new(provider.clone()).circuit_state(),
            };
            states.insert(provider.clone(), state);
        }
        states
    }

    /// Open flag per configured provider, as recorded on retry attempts.
    pub async fn open_flags(&self) -> BTreeMap<ProviderId, bool> {
        self.states()
            .await
            .into_iter()
            .map(|(provider, state)| (provider, state.is_open))
            .collect()
    }

    /// Force the breaker closed. Administrative only.
    pub async fn reset(&self, provider: &ProviderId) -> Result<Option<ProviderHealth>, StoreError> {
        let health = self.store.reset(provider).await?;
        if let Err(e) = self.cache.delete(&circuit_key(provider)).await {
            warn!(provider = %provider, error = %e, "failed to evict circuit state");
        }
        info!(provider = %provider, found = health.is_some(), "circuit reset");
        Ok(health)
    }

    async fn write_cache(&self, state: &CircuitBreakerState) {
        let Ok(value) = serde_json::to_string(state) else {
            return;
        };
        if let Err(e) = self
            .cache
            .set(&circuit_key(&state.provider_id), &value, self.cache_ttl)
            .await
        {
            warn!(provider = %state.provider_id, error = %e, "failed to cache circuit state");
        }
    }
}
