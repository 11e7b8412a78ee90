//! Retry-attempt audit records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AttemptId, JobId, ProviderId};
use crate::job::JobType;

/// Failure category of an attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    ProviderError,
    Timeout,
    RateLimit,
    NetworkError,
    ValidationError,
    CircuitBreakerOpen,
    Unknown,
}

impl RetryReason {
    /// Classify an error message by case-insensitive substring.
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        if message.contains("timeout") {
            RetryReason::Timeout
        } else if message.contains("rate limit") {
            RetryReason::RateLimit
        } else if message.contains("network") {
            RetryReason::NetworkError
        } else if message.contains("validation") {
            RetryReason::ValidationError
        } else if message.contains("circuit") {
            RetryReason::CircuitBreakerOpen
        } else {
            RetryReason::ProviderError
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::ProviderError => "provider_error",
            RetryReason::Timeout => "timeout",
            RetryReason::RateLimit => "rate_limit",
            RetryReason::NetworkError => "network_error",
            RetryReason::ValidationError => "validation_error",
            RetryReason::CircuitBreakerOpen => "circuit_breaker_open",
            RetryReason::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "provider_error" => RetryReason::ProviderError,
            "timeout" => RetryReason::Timeout,
            "rate_limit" => RetryReason::RateLimit,
            "network_error" => RetryReason::NetworkError,
            "validation_error" => RetryReason::ValidationError,
            "circuit_breaker_open" => RetryReason::CircuitBreakerOpen,
            _ => RetryReason::Unknown,
        }
    }
}

/// One attempt of a job, written once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: AttemptId,
    pub job_id: JobId,
    pub job_type: JobType,
    /// 1-based, ordered per job
    pub attempt_number: u32,
    pub provider: Option<ProviderId>,
    pub reason: RetryReason,
    pub error: Option<String>,
    /// Delay computed for the next attempt, in milliseconds
    pub delay_ms: u64,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub was_successful: bool,
    /// Open flag per provider at decision time
    pub circuit_states: BTreeMap<ProviderId, bool>,
    pub system_load: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_substring() {
        assert_eq!(RetryReason::classify("Request TIMEOUT after 30s"), RetryReason::Timeout);
        assert_eq!(RetryReason::classify("rate limit hit"), RetryReason::RateLimit);
        assert_eq!(RetryReason::classify("network unreachable"), RetryReason::NetworkError);
        assert_eq!(
            RetryReason::classify("validation failed: prompt"),
            RetryReason::ValidationError
        );
        assert_eq!(
            RetryReason::classify("circuit open for alpha"),
            RetryReason::CircuitBreakerOpen
        );
        assert_eq!(RetryReason::classify("500 upstream"), RetryReason::ProviderError);
    }

    #[test]
    fn reason_names_parse_back() {
        for reason in [
            RetryReason::ProviderError,
            RetryReason::Timeout,
            RetryReason::RateLimit,
            RetryReason::NetworkError,
            RetryReason::ValidationError,
            RetryReason::CircuitBreakerOpen,
            RetryReason::Unknown,
        ] {
            assert_eq!(RetryReason::parse(reason.as_str()), reason);
        }
    }
}
