//! Provider health records and the circuit-breaker projection derived from them.
//!
//! All arithmetic lives here so every store applies the exact same update inside
//! its own atomic section (a write lock in memory, a versioned update in SQL).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ProviderId;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 60_000;
pub const RECENT_ERRORS_CAP: usize = 10;
pub const ERROR_TEXT_LIMIT: usize = 500;

/// Derived provider status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    CircuitOpen,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::CircuitOpen => "circuit_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(HealthStatus::Healthy),
            "degraded" => Some(HealthStatus::Degraded),
            "unhealthy" => Some(HealthStatus::Unhealthy),
            "circuit_open" => Some(HealthStatus::CircuitOpen),
            _ => None,
        }
    }
}

impl core::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single generation attempt, as seen by health tracking.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthOutcome {
    Success { response_time_ms: u64 },
    Failure { error: String },
}

/// One entry of the recent-errors ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Rolling reliability record for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: ProviderId,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// successful / total * 100; 100 while no request has been recorded
    pub success_rate: f64,
    /// Mean over successful requests
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: Option<u64>,
    pub max_response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub status: HealthStatus,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Newest first, at most [`RECENT_ERRORS_CAP`]
    pub recent_errors: VecDeque<RecentError>,
    /// Bumped on every write; used for compare-and-swap updates
    pub version: u64,
}

impl ProviderHealth {
    /// A fresh record with default threshold and recovery timeout.
    pub fn new(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            success_rate: 100.0,
            avg_response_time_ms: 0.0,
            min_response_time_ms: None,
            max_response_time_ms: None,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            circuit_opened_at: None,
            status: HealthStatus::Healthy,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_ms: DEFAULT_RECOVERY_TIMEOUT_MS,
            recent_errors: VecDeque::new(),
            version: 0,
        }
    }

    pub fn with_thresholds(mut self, failure_threshold: u32, recovery_timeout_ms: u64) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self.recovery_timeout_ms = recovery_timeout_ms;
        self
    }

    /// Apply one attempt outcome.
    pub fn apply(&mut self, outcome: &HealthOutcome, now: DateTime<Utc>) {
        match outcome {
            HealthOutcome::Success { response_time_ms } => {
                self.record_success(*response_time_ms, now)
            }
            HealthOutcome::Failure { error } => self.record_failure(error, now),
        }
        self.version += 1;
    }

    fn record_success(&mut self, response_time_ms: u64, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(now);
        self.recompute_success_rate();

        let n = self.successful_requests as f64;
        self.avg_response_time_ms += (response_time_ms as f64 - self.avg_response_time_ms) / n;
        self.min_response_time_ms = Some(
            self.min_response_time_ms
                .map_or(response_time_ms, |min| min.min(response_time_ms)),
        );
        self.max_response_time_ms = Some(
            self.max_response_time_ms
                .map_or(response_time_ms, |max| max.max(response_time_ms)),
        );

        self.status = if self.success_rate >= 95.0 {
            HealthStatus::Healthy
        } else if self.success_rate >= 80.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        if self.status != HealthStatus::Unhealthy {
            self.circuit_opened_at = None;
        }
    }

    fn record_failure(&mut self, error: &str, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.last_failure_at = Some(now);

        self.recent_errors.push_front(RecentError {
            message: truncate_chars(error, ERROR_TEXT_LIMIT),
            at: now,
        });
        self.recent_errors.truncate(RECENT_ERRORS_CAP);

        self.recompute_success_rate();

        if self.consecutive_failures >= self.failure_threshold {
            self.status = HealthStatus::CircuitOpen;
            self.circuit_opened_at = Some(now);
        } else if self.success_rate < 50.0 {
            self.status = HealthStatus::Unhealthy;
        } else if self.success_rate < 80.0 {
            self.status = HealthStatus::Degraded;
        }
    }

    fn recompute_success_rate(&mut self) {
        self.success_rate = if self.total_requests == 0 {
            100.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64 * 100.0
        };
    }

    /// Administrative override back to a closed breaker.
    pub fn reset(&mut self) {
        self.status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.circuit_opened_at = None;
        self.version += 1;
    }

    /// Ranking score for provider selection (higher is better).
    pub fn score(&self) -> f64 {
        self.success_rate - self.avg_response_time_ms / 1000.0
    }

    pub fn is_circuit_open(&self) -> bool {
        self.status == HealthStatus::CircuitOpen
    }

    /// Cache projection of this record.
    pub fn circuit_state(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            provider_id: self.provider_id.clone(),
            failure_count: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            is_open: self.is_circuit_open(),
            half_open_since: None,
            recovery_timeout_ms: self.recovery_timeout_ms,
        }
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Cached circuit-breaker view of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub provider_id: ProviderId,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub is_open: bool,
    pub half_open_since: Option<DateTime<Utc>>,
    pub recovery_timeout_ms: u64,
}

impl CircuitBreakerState {
    /// Whether an open breaker has waited out its recovery timeout at `now`.
    pub fn recovery_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_failure_at {
            Some(at) => (now - at).num_milliseconds() > self.recovery_timeout_ms as i64,
            None => true,
        }
    }

    /// Flip an open breaker to half-open.
    pub fn into_half_open(mut self, now: DateTime<Utc>) -> Self {
        self.is_open = false;
        self.half_open_since = Some(now);
        self
    }

    pub fn is_half_open(&self) -> bool {
        !self.is_open && self.half_open_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn failure(msg: &str) -> HealthOutcome {
        HealthOutcome::Failure {
            error: msg.to_string(),
        }
    }

    fn success(ms: u64) -> HealthOutcome {
        HealthOutcome::Success {
            response_time_ms: ms,
        }
    }

    #[test]
    fn five_consecutive_failures_open_the_circuit() {
        let mut health = ProviderHealth::new(ProviderId::new("alpha"));
        let now = Utc::now();

        for i in 0..4 {
            health.apply(&failure("upstream 502"), now + Duration::seconds(i));
            assert_ne!(health.status, HealthStatus::CircuitOpen);
        }
        health.apply(&failure("upstream 502"), now + Duration::seconds(4));

        assert_eq!(health.status, HealthStatus::CircuitOpen);
        assert_eq!(health.consecutive_failures, 5);
        assert_eq!(health.circuit_opened_at, Some(now + Duration::seconds(4)));
        assert!(health.circuit_state().is_open);
    }

    #[test]
    fn success_after_open_circuit_resets_streak() {
        let mut health = ProviderHealth::new(ProviderId::new("alpha"));
        let now = Utc::now();
        for _ in 0..5 {
            health.apply(&failure("boom"), now);
        }

        health.apply(&success(120), now);

        assert_eq!(health.consecutive_failures, 0);
        // 1 of 6 succeeded
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.circuit_opened_at.is_some());
        assert!(!health.is_circuit_open());
    }

    #[test]
    fn success_status_thresholds() {
        let mut health = ProviderHealth::new(ProviderId::new("beta"));
        let now = Utc::now();
        for _ in 0..9 {
            health.apply(&success(100), now);
        }
        health.apply(&failure("boom"), now);
        health.apply(&success(100), now);

        // 10 / 11 = 90.9%
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.circuit_opened_at.is_none());
    }

    #[test]
    fn response_time_statistics() {
        let mut health = ProviderHealth::new(ProviderId::new("gamma"));
        let now = Utc::now();
        health.apply(&success(100), now);
        health.apply(&success(300), now);

        assert_eq!(health.avg_response_time_ms, 200.0);
        assert_eq!(health.min_response_time_ms, Some(100));
        assert_eq!(health.max_response_time_ms, Some(300));
        assert_eq!(health.score(), 100.0 - 0.2);
    }

    #[test]
    fn recent_errors_are_bounded_and_truncated() {
        let mut health = ProviderHealth::new(ProviderId::new("alpha")).with_thresholds(100, 1000);
        let now = Utc::now();
        for i in 0..15 {
            health.apply(&failure(&format!("error {i}")), now);
        }
        health.apply(&failure(&"x".repeat(800)), now);

        assert_eq!(health.recent_errors.len(), RECENT_ERRORS_CAP);
        assert_eq!(health.recent_errors[0].message.len(), ERROR_TEXT_LIMIT);
        assert_eq!(health.recent_errors[1].message, "error 14");
    }

    #[test]
    fn reset_closes_the_breaker() {
        let mut health = ProviderHealth::new(ProviderId::new("alpha"));
        for _ in 0..5 {
            health.apply(&failure("boom"), Utc::now());
        }
        health.reset();

        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.circuit_opened_at.is_none());
    }

    #[test]
    fn half_open_after_recovery_timeout() {
        let now = Utc::now();
        let state = CircuitBreakerState {
            provider_id: ProviderId::new("alpha"),
            failure_count: 5,
            last_failure_at: Some(now),
            is_open: true,
            half_open_since: None,
            recovery_timeout_ms: 60_000,
        };

        assert!(!state.recovery_elapsed(now + Duration::seconds(60)));
        assert!(state.recovery_elapsed(now + Duration::milliseconds(60_001)));

        let half_open = state.into_half_open(now + Duration::seconds(61));
        assert!(half_open.is_half_open());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the success rate is always recomputed from the counters.
        #[test]
        fn success_rate_matches_counters(outcomes in prop::collection::vec(any::<bool>(), 1..60)) {
            let mut health = ProviderHealth::new(ProviderId::new("alpha"));
            let now = Utc::now();

            for ok in outcomes {
                let outcome = if ok { success(50) } else { failure("boom") };
                health.apply(&outcome, now);

                let expected = health.successful_requests as f64 / health.total_requests as f64 * 100.0;
                prop_assert!((health.success_rate - expected).abs() < 1e-9);
                prop_assert_eq!(health.total_requests, health.successful_requests + health.failed_requests);
            }
        }

        /// Property: any success resets the failure streak to exactly zero.
        #[test]
        fn success_resets_consecutive_failures(streak in 0usize..50) {
            let mut health = ProviderHealth::new(ProviderId::new("alpha"));
            let now = Utc::now();
            for _ in 0..streak {
                health.apply(&failure("boom"), now);
            }
            health.apply(&success(10), now);
            prop_assert_eq!(health.consecutive_failures, 0);
            prop_assert!(health.status != HealthStatus::CircuitOpen);
        }

        /// Property: the breaker is open iff the streak reached the threshold.
        #[test]
        fn circuit_open_iff_streak_reaches_threshold(
            outcomes in prop::collection::vec(any::<bool>(), 1..40),
            threshold in 1u32..8,
        ) {
            let mut health = ProviderHealth::new(ProviderId::new("alpha")).with_thresholds(threshold, 1000);
            let now = Utc::now();
            for ok in outcomes {
                let outcome = if ok { success(10) } else { failure("boom") };
                health.apply(&outcome, now);
                prop_assert_eq!(
                    health.is_circuit_open(),
                    health.consecutive_failures >= health.failure_threshold
                );
            }
        }
    }
}
