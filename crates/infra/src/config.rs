//! Configuration loading and representation.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. a JSON file named by `CONDUCTOR_CONFIG`
//! 3. individual environment overrides (`CONDUCTOR_PROVIDERS`, `DATABASE_URL`, ...)

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use conductor_core::{
    BackoffPolicy, JobType, ProviderDescriptor, ProviderRegistry, QueueDefaults,
};

pub const CONFIG_PATH_ENV: &str = "CONDUCTOR_CONFIG";
pub const PROVIDERS_ENV: &str = "CONDUCTOR_PROVIDERS";
pub const GENERATION_TIMEOUT_ENV: &str = "CONDUCTOR_GENERATION_TIMEOUT_MS";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const REDIS_URL_ENV: &str = "REDIS_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid environment variable {name}: {reason}")]
    Env { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry-strategy tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retries stop above this estimated load
    pub load_threshold: f64,
    /// Recently started jobs that count as full load
    pub capacity: u64,
    /// Attempts inside `recent_attempt_window_ms` that stop further retries
    pub recent_attempt_limit: usize,
    pub recent_attempt_window_ms: u64,
    /// Job-type failures inside the window that stretch the delay
    pub job_type_failure_threshold: u64,
    pub job_type_failure_window_ms: u64,
    /// Case-insensitive markers of errors that are never retried
    pub non_retryable: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            load_threshold: 0.9,
            capacity: 100,
            recent_attempt_limit: 3,
            recent_attempt_window_ms: 5 * 60 * 1000,
            job_type_failure_threshold: 10,
            job_type_failure_window_ms: 15 * 60 * 1000,
            non_retryable: [
                "validation error",
                "authentication failed",
                "insufficient permissions",
                "rate limit exceeded permanently",
                "invalid credentials",
                "malformed request",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Circuit-breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub cache_ttl_ms: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5 * 60 * 1000,
            failure_threshold: conductor_core::health::DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_ms: conductor_core::health::DEFAULT_RECOVERY_TIMEOUT_MS,
        }
    }
}

impl CircuitSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Worker-pool polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub poll_interval_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            jitter_ms: 100,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub providers: Vec<ProviderDescriptor>,
    pub queues: BTreeMap<JobType, QueueDefaults>,
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
    pub generation_timeout_ms: u64,
    pub runner: RunnerSettings,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            providers: ["openai", "anthropic", "google"]
                .into_iter()
                .map(ProviderDescriptor::new)
                .collect(),
            queues: default_queues(),
            retry: RetrySettings::default(),
            circuit: CircuitSettings::default(),
            generation_timeout_ms: 30_000,
            runner: RunnerSettings::default(),
            database_url: None,
            redis_url: None,
        }
    }
}

/// Built-in queue table.
pub fn default_queues() -> BTreeMap<JobType, QueueDefaults> {
    let queue = |name: &str, attempts, backoff, priority, keep_completed, keep_failed, concurrency| {
        QueueDefaults {
            name: name.to_string(),
            attempts,
            backoff,
            priority,
            remove_on_complete: keep_completed,
            remove_on_fail: keep_failed,
            concurrency,
        }
    };

    BTreeMap::from([
        (
            JobType::Generation,
            queue(
                "content-generation",
                3,
                BackoffPolicy::exponential(Duration::from_secs(2)),
                1,
                100,
                50,
                4,
            ),
        ),
        (
            JobType::Notification,
            queue(
                "notifications",
                5,
                BackoffPolicy::exponential(Duration::from_secs(1)),
                5,
                50,
                25,
                2,
            ),
        ),
        (
            JobType::Analytics,
            queue(
                "analytics",
                3,
                BackoffPolicy::exponential(Duration::from_secs(5)),
                10,
                20,
                10,
                1,
            ),
        ),
        (
            JobType::Cleanup,
            queue(
                "cleanup",
                1,
                BackoffPolicy::fixed(Duration::from_secs(10)),
                20,
                10,
                5,
                1,
            ),
        ),
        (
            JobType::HealthCheck,
            queue(
                "health-checks",
                2,
                BackoffPolicy::fixed(Duration::from_secs(5)),
                1,
                10,
                10,
                1,
            ),
        ),
        (
            JobType::RetryFailed,
            queue(
                "retry-failed",
                1,
                BackoffPolicy::fixed(Duration::from_secs(30)),
                15,
                20,
                20,
                1,
            ),
        ),
    ])
}

impl OrchestratorConfig {
    /// Load configuration from defaults, the optional config file, and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_json_str(&raw)
    }

    /// Parse JSON; missing sections fall back to defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(PROVIDERS_ENV) {
            let providers: Vec<ProviderDescriptor> = raw
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ProviderDescriptor::new)
                .collect();
            if providers.is_empty() {
                return Err(ConfigError::Env {
                    name: PROVIDERS_ENV.to_string(),
                    reason: "no provider ids".to_string(),
                });
            }
            self.providers = providers;
        }

        if let Some(raw) = lookup(GENERATION_TIMEOUT_ENV) {
            self.generation_timeout_ms = raw.trim().parse().map_err(|e| ConfigError::Env {
                name: GENERATION_TIMEOUT_ENV.to_string(),
                reason: format!("{e}"),
            })?;
        }

        if let Some(url) = lookup(DATABASE_URL_ENV) {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup(REDIS_URL_ENV) {
            self.redis_url = Some(url);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ProviderRegistry::new(self.providers.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut names = HashSet::new();
        for (job_type, queue) in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("queue for {job_type} has no name")));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "queue name {} is used by more than one job type",
                    queue.name
                )));
            }
            if queue.attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "queue {} must allow at least one attempt",
                    queue.name
                )));
            }
            if queue.concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "queue {} must have at least one worker",
                    queue.name
                )));
            }
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        if self.generation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "generation_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn provider_registry(&self) -> Result<ProviderRegistry, ConfigError> {
        ProviderRegistry::new(self.providers.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::BackoffKind;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();

        let generation = &config.queues[&JobType::Generation];
        assert_eq!(generation.attempts, 3);
        assert_eq!(generation.backoff.kind, BackoffKind::Exponential);
        assert_eq!(generation.backoff.delay_ms, 2_000);

        let cleanup = &config.queues[&JobType::Cleanup];
        assert_eq!(cleanup.attempts, 1);
        assert_eq!(cleanup.backoff.kind, BackoffKind::Fixed);
        assert_eq!(cleanup.backoff.delay_ms, 10_000);
    }

    #[test]
    fn json_overrides_only_what_it_names() {
        let raw = r#"{
            "providers": [{"id": "alpha"}, {"id": "beta", "endpoint": "http://beta.local"}],
            "queues": {
                "generation": {
                    "name": "gen",
                    "attempts": 4,
                    "backoff": {"type": "fixed", "delay": 500},
                    "priority": 2,
                    "remove_on_complete": 10,
                    "remove_on_fail": 10
                }
            },
            "retry": {"capacity": 20}
        }"#;

        let config = OrchestratorConfig::from_json_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[&JobType::Generation].concurrency, 1);
        assert_eq!(config.queues[&JobType::Generation].backoff.max_delay_ms, 60_000);
        assert_eq!(config.retry.capacity, 20);
        assert_eq!(config.retry.base_delay_ms, 2_000);
    }

    #[test]
    fn env_overrides_providers_and_timeout() {
        let mut config = OrchestratorConfig::default();
        config
            .apply_env(|name| match name {
                PROVIDERS_ENV => Some("alpha, beta".to_string()),
                GENERATION_TIMEOUT_ENV => Some("1500".to_string()),
                _ => None,
            })
            .unwrap();

        let ids: Vec<_> = config.providers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["alpha", "beta"]);
        assert_eq!(config.generation_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn bad_timeout_env_is_rejected() {
        let mut config = OrchestratorConfig::default();
        let err = config
            .apply_env(|name| (name == GENERATION_TIMEOUT_ENV).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn duplicate_queue_names_are_rejected() {
        let mut config = OrchestratorConfig::default();
        let name = config.queues[&JobType::Generation].name.clone();
        if let Some(q) = config.queues.get_mut(&JobType::Analytics) {
            q.name = name;
        }
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
