//! Wiring: builds the service graph from configuration and a set of backends.

use std::sync::Arc;

use conductor_core::{Clock, JobType, ProviderRegistry};
use conductor_infra::{
    Cache, ConfigError, InMemoryCache, InMemoryStore, InMemoryTaskQueue, JobStore,
    OrchestratorConfig, ProviderHealthStore, RetryAttemptStore, TaskQueue,
};

use crate::circuit::CircuitBreaker;
use crate::handlers::{CleanupHandler, HealthCheckHandler, RetryFailedHandler};
use crate::health::HealthTracker;
use crate::orchestrator::Orchestrator;
use crate::processor::{ContentGenerator, GenerationProcessor};
use crate::retry::{RecentActivityLoad, RetryStrategy};
use crate::runner::Runner;

/// Storage, cache and queue adapters the services run on.
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub attempts: Arc<dyn RetryAttemptStore>,
    pub health: Arc<dyn ProviderHealthStore>,
    pub cache: Arc<dyn Cache>,
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Single-process backends (dev/test).
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            jobs: store.clone(),
            attempts: store.clone(),
            health: store,
            cache: Arc::new(InMemoryCache::with_clock(clock.clone())),
            queue: Arc::new(InMemoryTaskQueue::with_clock(clock.clone())),
            clock,
        }
    }
}

pub struct Services {
    pub registry: Arc<ProviderRegistry>,
    pub health: Arc<HealthTracker>,
    pub circuit: Arc<CircuitBreaker>,
    pub retry: Arc<RetryStrategy>,
    pub processor: Arc<GenerationProcessor>,
    pub orchestrator: Arc<Orchestrator>,
    /// Handlers registered for generation, cleanup, health-check and retry-failed.
    pub runner: Runner,
}

impl Services {
    pub fn build(
        config: &OrchestratorConfig,
        backends: Backends,
        generator: Arc<dyn ContentGenerator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(config.provider_registry()?);
        let Backends {
            jobs,
            attempts,
            health: health_store,
            cache,
            queue,
            clock,
        } = backends;

        let health = Arc::new(HealthTracker::new(
            health_store.clone(),
            cache.clone(),
            clock.clone(),
            &config.circuit,
        ));
        let circuit = Arc::new(CircuitBreaker::new(
            registry.clone(),
            health_store.clone(),
            cache,
            clock.clone(),
            config.circuit.cache_ttl(),
        ));
        let load = Arc::new(RecentActivityLoad::new(
            jobs.clone(),
            clock.clone(),
            config.retry.capacity,
        ));
        let retry = Arc::new(RetryStrategy::new(
            config.retry.clone(),
            registry.clone(),
            circuit.clone(),
            health_store,
            attempts.clone(),
            load,
            clock.clone(),
        ));
        let processor = Arc::new(GenerationProcessor::new(
            generator,
            registry.clone(),
            circuit.clone(),
            health.clone(),
            retry.clone(),
            attempts,
            clock.clone(),
            config.generation_timeout(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            config.queues.clone(),
            jobs.clone(),
            queue.clone(),
            health.clone(),
            circuit.clone(),
            clock.clone(),
        ));

        let mut runner = Runner::new(jobs.clone(), queue, config.queues.clone(), clock.clone(), &config.runner);
        runner.register_handler(JobType::Generation, processor.clone());
        runner.register_handler(JobType::Cleanup, Arc::new(CleanupHandler::new(jobs, clock)));
        runner.register_handler(
            JobType::HealthCheck,
            Arc::new(HealthCheckHandler::new(circuit.clone(), health.clone())),
        );
        runner.register_handler(
            JobType::RetryFailed,
            Arc::new(RetryFailedHandler::new(orchestrator.clone())),
        );

        Ok(Self {
            registry,
            health,
            circuit,
            retry,
            processor,
            orchestrator,
            runner,
        })
    }
}
