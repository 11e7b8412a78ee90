//! Provider health tracking.
//!
//! Every generation attempt is reported here. The tracker updates the persisted
//! record atomically through the store and refreshes the cached circuit state.
//! It is best-effort: infrastructure failures are logged, never returned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use conductor_core::{Clock, HealthOutcome, ProviderHealth, ProviderId};
use conductor_infra::config::CircuitSettings;
use conductor_infra::{Cache, HealthThresholds, ProviderHealthStore};

/// Cache key of a provider's circuit-breaker state.
pub fn circuit_key(provider: &ProviderId) -> String {
    format!("circuit_breaker:{provider}")
}

pub struct HealthTracker {
    store: Arc<dyn ProviderHealthStore>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    thresholds: HealthThresholds,
    cache_ttl: Duration,
}

impl HealthTracker {
    pub fn new(
        store: Arc<dyn ProviderHealthStore>,
        cache: Arc<dyn Cache>,
        clock: Arc<dyn Clock>,
        settings: &CircuitSettings,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            thresholds: HealthThresholds {
                failure_threshold: settings.failure_threshold,
                recovery_timeout_ms: settings.recovery_timeout_ms,
            },
            cache_ttl: settings.cache_ttl(),
        }
    }

    pub async fn record_success(&self, provider: &ProviderId, response_time: Duration) {
        let outcome = HealthOutcome::Success {
            response_time_ms: response_time.as_millis() as u64,
        };
        self.record(provider, &outcome).await;
    }

    pub async fn record_failure(&self, provider: &ProviderId, error: &str) {
        let outcome = HealthOutcome::Failure {
            error: error.to_string(),
        };
        self.record(provider, &outcome).await;
    }

    async fn record(&self, provider: &ProviderId, outcome: &HealthOutcome) -> Option<ProviderHealth> {
        let now = self.clock.now();
        let health = match self.store.record(provider, outcome, self.thresholds, now).await {
            Ok(health) => health,
            Err(e) => {
                warn!(provider = %provider, error = %e, "failed to record provider health");
                return None;
            }
        };

        debug!(
            provider = %provider,
            status = %health.status,
            consecutive_failures = health.consecutive_failures,
            success_rate = health.success_rate,
            "provider health updated"
        );

        self.refresh_cache(&health).await;
        Some(health)
    }

    async fn refresh_cache(&self, health: &ProviderHealth) {
        let state = health.circuit_state();
        let value = match serde_json::to_string(&state) {
            Ok(value) => value,
            Err(e) => {
                warn!(provider = %health.provider_id, error = %e, "failed to encode circuit state");
                return;
            }
        };
        if let Err(e) = self
            .cache
            .set(&circuit_key(&health.provider_id), &value, self.cache_ttl)
            .await
        {
            warn!(provider = %health.provider_id, error = %e, "failed to cache circuit state");
        }
    }

    /// Current record, `None` if missing or unreadable.
    pub async fn get(&self, provider: &ProviderId) -> Option<ProviderHealth> {
        match self.store.get(provider).await {
            Ok(health) => health,
            Err(e) => {
                warn!(provider = %provider, error = %e, "failed to read provider health");
                None
            }
        }
    }

    /// All records; empty on storage failure.
    pub async fn all(&self) -> Vec<ProviderHealth> {
        match self.store.list().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to list provider health");
                Vec::new()
            }
        }
    }
}
