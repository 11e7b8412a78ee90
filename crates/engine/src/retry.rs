//! Retry policy: whether to retry, how long to wait, and where to go next.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use conductor_core::{Clock, HealthStatus, JobType, ProviderId, ProviderRegistry, RetryAttempt};
use conductor_infra::config::RetrySettings;
use conductor_infra::{JobStore, ProviderHealthStore, RetryAttemptStore, StoreError};

use crate::circuit::CircuitBreaker;

/// Load assumed when the estimator fails.
pub const FALLBACK_LOAD: f64 = 0.5;

/// Estimated system load in `[0, 1]`.
#[async_trait]
pub trait LoadEstimator: Send + Sync {
    async fn estimate(&self) -> Result<f64, StoreError>;
}

/// Active jobs started within a trailing window, relative to a capacity.
pub struct RecentActivityLoad {
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    capacity: u64,
    window: chrono::Duration,
}

impl RecentActivityLoad {
    pub fn new(jobs: Arc<dyn JobStore>, clock: Arc<dyn Clock>, capacity: u64) -> Self {
        Self {
            jobs,
            clock,
            capacity: capacity.max(1),
            window: chrono::Duration::minutes(5),
        }
    }
}

#[async_trait]
impl LoadEstimator for RecentActivityLoad {
    async fn estimate(&self) -> Result<f64, StoreError> {
        let since = self.clock.now() - self.window;
        let active = self.jobs.count_active_started_since(since).await?;
        Ok((active as f64 / self.capacity as f64).min(1.0))
    }
}

/// Source of jitter samples in `[0, 1)`.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().r#gen::<f64>()
    }
}

/// Always returns the same sample.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Inputs for one retry decision.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    pub job_type: JobType,
    /// Attempts recorded so far, oldest first
    pub attempts: &'a [RetryAttempt],
    pub max_attempts: u32,
    pub last_error: Option<&'a str>,
    pub last_provider: Option<&'a ProviderId>,
}

pub struct RetryStrategy {
    settings: RetrySettings,
    registry: Arc<ProviderRegistry>,
    circuit: Arc<CircuitBreaker>,
    health: Arc<dyn ProviderHealthStore>,
    attempts: Arc<dyn RetryAttemptStore>,
    load: Arc<dyn LoadEstimator>,
    jitter: Arc<dyn JitterSource>,
    clock: Arc<dyn Clock>,
}

impl RetryStrategy {
    pub fn new(
        settings: RetrySettings,
        registry: Arc<ProviderRegistry>,
        circuit: Arc<CircuitBreaker>,
        health: Arc<dyn ProviderHealthStore>,
        attempts: Arc<dyn RetryAttemptStore>,
        load: Arc<dyn LoadEstimator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            registry,
            circuit,
            health,
            attempts,
            load,
            jitter: Arc::new(ThreadRngJitter),
            clock,
        }
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    pub fn is_non_retryable(&self, error: &str) -> bool {
        let error = error.to_lowercase();
        self.settings
            .non_retryable
            .iter()
            .any(|marker| error.contains(&marker.to_lowercase()))
    }

    /// Current load estimate; estimator failures assume [`FALLBACK_LOAD`].
    pub async fn system_load(&self) -> f64 {
        match self.load.estimate().await {
            Ok(load) => load.clamp(0.0, 1.0),
            Err(e) => {
                warn!(error = %e, "load estimation failed, assuming moderate load");
                FALLBACK_LOAD
            }
        }
    }

    pub async fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        if ctx.attempts.len() as u64 >= u64::from(ctx.max_attempts) {
            return false;
        }

        if ctx.last_error.is_some_and(|e| self.is_non_retryable(e)) {
            debug!(error = ?ctx.last_error, "non-retryable error");
            return false;
        }

        let window = chrono::Duration::milliseconds(self.settings.recent_attempt_window_ms as i64);
        let since = self.clock.now() - window;
        let recent = ctx.attempts.iter().filter(|a| a.executed_at >= since).count();
        if recent >= self.settings.recent_attempt_limit {
            debug!(recent, "too many recent attempts");
            return false;
        }

        let load = self.system_load().await;
        if load > self.settings.load_threshold {
            debug!(load, "system overloaded, not retrying");
            return false;
        }

        true
    }

    /// Delay before the next attempt, never above `max_delay_ms`.
    pub async fn calculate_delay(&self, ctx: &RetryContext<'_>) -> Duration {
        let base = self.base_delay_ms(ctx.attempts.len() as u32);
        let mut delay = base + base * 0.1 * self.jitter.sample().clamp(0.0, 1.0);

        let window = chrono::Duration::milliseconds(self.settings.job_type_failure_window_ms as i64);
        let since = self.clock.now() - window;
        match self.attempts.count_failures_since(ctx.job_type, since).await {
            Ok(failures) if failures > self.settings.job_type_failure_threshold => delay *= 1.5,
            Ok(_) => {}
            Err(e) => warn!(job_type = %ctx.job_type, error = %e, "failed to count recent failures"),
        }

        if let Some(provider) = ctx.last_provider {
            match self.health.get(provider).await {
                Ok(Some(health)) => match health.status {
                    HealthStatus::Degraded => delay *= 2.0,
                    HealthStatus::Unhealthy => delay *= 3.0,
                    _ => {}
                },
                Ok(None) => {}
                Err(e) => warn!(provider = %provider, error = %e, "failed to read provider health"),
            }
        }

        let max = self.settings.max_delay_ms as f64;
        Duration::from_millis(delay.floor().min(max) as u64)
    }

    /// `min(base * 2^attempt, max)` without jitter or adjustments.
    pub fn base_delay_ms(&self, attempt: u32) -> f64 {
        let exp = 2_f64.powi(attempt.min(62) as i32);
        (self.settings.base_delay_ms as f64 * exp).min(self.settings.max_delay_ms as f64)
    }

    /// Best provider other than `failed` whose circuit is closed.
    ///
    /// Ranked by `success_rate - avg_response_ms / 1000`; providers without a
    /// record score 100. Ties keep configured order.
    pub async fn select_next_provider(&self, failed: Option<&ProviderId>) -> Option<ProviderId> {
        let records = match self.health.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "provider selection failed, using first configured provider");
                return self.registry.first_except(failed).cloned();
            }
        };

        let mut candidates = Vec::new();
        for provider in self.registry.ids() {
            if Some(provider) == failed || self.circuit.is_open(provider).await {
                continue;
            }
            let score = records
                .iter()
                .find(|h| &h.provider_id == provider)
                .map_or(100.0, |h| h.score());
            candidates.push((provider.clone(), score));
        }

        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        candidates.into_iter().next().map(|(provider, _)| provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;
    use conductor_core::{AttemptId, HealthOutcome, JobId, ManualClock, RetryReason};
    use conductor_infra::config::CircuitSettings;
    use conductor_infra::{HealthThresholds, InMemoryCache, InMemoryStore};
    use proptest::prelude::*;

    struct FixedLoad(f64);

    #[async_trait]
    impl LoadEstimator for FixedLoad {
        async fn estimate(&self) -> Result<f64, StoreError> {
            Ok(self.0)
        }
    }

    struct BrokenLoad;

    #[async_trait]
    impl LoadEstimator for BrokenLoad {
        async fn estimate(&self) -> Result<f64, StoreError> {
            Err(StoreError::Storage("down".to_string()))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        strategy: RetryStrategy,
    }

    fn fixture_with(load: Arc<dyn LoadEstimator>, providers: &[&str]) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::with_clock(clock.clone()));
        let registry = Arc::new(ProviderRegistry::from_ids(providers.iter().copied()).unwrap());
        let circuit = Arc::new(CircuitBreaker::new(
            registry.clone(),
            store.clone(),
            cache,
            clock.clone(),
            CircuitSettings::default().cache_ttl(),
        ));
        let strategy = RetryStrategy::new(
            RetrySettings::default(),
            registry,
            circuit,
            store.clone(),
            store.clone(),
            load,
            clock.clone(),
        )
        .with_jitter(Arc::new(FixedJitter(0.0)));

        Fixture {
            clock,
            store,
            strategy,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(FixedLoad(0.1)), &["alpha", "beta", "gamma"])
    }

    fn attempt(number: u32, at: chrono::DateTime<Utc>) -> RetryAttempt {
        RetryAttempt {
            id: AttemptId::new(),
            job_id: JobId::new(),
            job_type: JobType::Generation,
            attempt_number: number,
            provider: Some(ProviderId::new("alpha")),
            reason: RetryReason::Timeout,
            error: Some("timeout".to_string()),
            delay_ms: 0,
            scheduled_at: at,
            executed_at: at,
            was_successful: false,
            circuit_states: BTreeMap::new(),
            system_load: 0.1,
        }
    }

    fn ctx<'a>(attempts: &'a [RetryAttempt], error: Option<&'a str>) -> RetryContext<'a> {
        RetryContext {
            job_type: JobType::Generation,
            attempts,
            max_attempts: 3,
            last_error: error,
            last_provider: None,
        }
    }

    async fn fail(store: &InMemoryStore, provider: &str, times: usize) {
        for _ in 0..times {
            store
                .record(
                    &ProviderId::new(provider),
                    &HealthOutcome::Failure {
                        error: "boom".to_string(),
                    },
                    HealthThresholds::default(),
                    Utc::now(),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn stops_when_attempts_are_exhausted() {
        let f = fixture();
        let long_ago = f.clock.now() - chrono::Duration::hours(1);
        let attempts: Vec<_> = (1..=3).map(|n| attempt(n, long_ago)).collect();

        assert!(f.strategy.should_retry(&ctx(&attempts[..2], Some("timeout"))).await);
        assert!(!f.strategy.should_retry(&ctx(&attempts, Some("timeout"))).await);
    }

    #[tokio::test]
    async fn non_retryable_markers_stop_retries() {
        let f = fixture();
        assert!(!f.strategy.should_retry(&ctx(&[], Some("Authentication FAILED for key"))).await);
        assert!(!f.strategy.should_retry(&ctx(&[], Some("malformed request body"))).await);
        assert!(f.strategy.should_retry(&ctx(&[], Some("network reset"))).await);
    }

    #[tokio::test]
    async fn recent_attempt_burst_stops_retries() {
        let f = fixture();
        let now = f.clock.now();
        let attempts: Vec<_> = (1..=3).map(|n| attempt(n, now)).collect();
        let mut context = ctx(&attempts, Some("timeout"));
        context.max_attempts = 10;

        assert!(!f.strategy.should_retry(&context).await);

        f.clock.advance(chrono::Duration::minutes(6));
        assert!(f.strategy.should_retry(&context).await);
    }

    #[tokio::test]
    async fn overload_stops_retries_and_estimator_errors_assume_moderate_load() {
        let busy = fixture_with(Arc::new(FixedLoad(0.95)), &["alpha"]);
        assert!(!busy.strategy.should_retry(&ctx(&[], Some("timeout"))).await);

        let broken = fixture_with(Arc::new(BrokenLoad), &["alpha"]);
        assert_eq!(broken.strategy.system_load().await, FALLBACK_LOAD);
        assert!(broken.strategy.should_retry(&ctx(&[], Some("timeout"))).await);
    }

    #[tokio::test]
    async fn delay_doubles_and_caps() {
        let f = fixture();
        let now = f.clock.now();
        let attempts: Vec<_> = (1..=20).map(|n| attempt(n, now)).collect();

        assert_eq!(f.strategy.calculate_delay(&ctx(&[], None)).await, Duration::from_millis(2000));
        assert_eq!(
            f.strategy.calculate_delay(&ctx(&attempts[..1], None)).await,
            Duration::from_millis(4000)
        );
        assert_eq!(
            f.strategy.calculate_delay(&ctx(&attempts, None)).await,
            Duration::from_millis(60_000)
        );
    }

    #[tokio::test]
    async fn unhealthy_last_provider_stretches_delay() {
        let f = fixture();
        // 0 of 3 succeeded: unhealthy, below the breaker threshold
        fail(&f.store, "alpha", 3).await;
        let alpha = ProviderId::new("alpha");

        let mut context = ctx(&[], None);
        context.last_provider = Some(&alpha);
        assert_eq!(f.strategy.calculate_delay(&context).await, Duration::from_millis(6000));
    }

    #[tokio::test]
    async fn selection_skips_failed_and_open_providers() {
        let f = fixture();
        fail(&f.store, "beta", 5).await;
        let alpha = ProviderId::new("alpha");

        let next = f.strategy.select_next_provider(Some(&alpha)).await;
        assert_eq!(next, Some(ProviderId::new("gamma")));
    }

    #[tokio::test]
    async fn selection_ranks_by_score_and_keeps_order_on_ties() {
        let f = fixture();
        let beta = ProviderId::new("beta");
        for _ in 0..3 {
            f.store
                .record(
                    &beta,
                    &HealthOutcome::Success {
                        response_time_ms: 2000,
                    },
                    HealthThresholds::default(),
                    Utc::now(),
                )
                .await
                .unwrap();
        }

        // alpha and gamma unscored (100), beta 98
        assert_eq!(f.strategy.select_next_provider(None).await, Some(ProviderId::new("alpha")));

        f.store
            .record(
                &ProviderId::new("alpha"),
                &HealthOutcome::Failure {
                    error: "boom".to_string(),
                },
                HealthThresholds::default(),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(f.strategy.select_next_provider(None).await, Some(ProviderId::new("gamma")));
    }

    #[tokio::test]
    async fn no_provider_left_is_none() {
        let f = fixture_with(Arc::new(FixedLoad(0.0)), &["alpha", "beta"]);
        fail(&f.store, "beta", 5).await;
        assert_eq!(f.strategy.select_next_provider(Some(&ProviderId::new("alpha"))).await, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the base delay never decreases with the attempt number and never exceeds the cap.
        #[test]
        fn base_delay_is_monotonic_and_bounded(attempt in 0u32..64) {
            let f = fixture();
            let current = f.strategy.base_delay_ms(attempt);
            let next = f.strategy.base_delay_ms(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= RetrySettings::default().max_delay_ms as f64);
        }

        /// Property: with any jitter sample the final delay stays within the cap.
        #[test]
        fn delay_with_jitter_never_exceeds_cap(attempts in 0usize..25, sample in 0.0f64..1.0) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let mut f = fixture();
                f.strategy = f.strategy.with_jitter(Arc::new(FixedJitter(sample)));
                let now = f.clock.now();
                let list: Vec<_> = (1..=attempts as u32).map(|n| attempt(n, now)).collect();
                let delay = f.strategy.calculate_delay(&ctx(&list, None)).await;
                assert!(delay <= Duration::from_millis(60_000));
            });
        }
    }
}
