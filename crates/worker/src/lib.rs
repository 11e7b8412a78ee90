//! Worker process wiring: picks storage and cache backends from configuration.

pub mod http;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use conductor_core::SystemClock;
use conductor_engine::Backends;
use conductor_infra::{Cache, InMemoryCache, InMemoryTaskQueue, OrchestratorConfig, PostgresStore};

pub use http::HttpGenerator;

/// Postgres when `database_url` is set, in-memory otherwise. The cache is Redis
/// when `redis_url` is set and the `redis` feature is enabled.
pub async fn backends(config: &OrchestratorConfig) -> anyhow::Result<Backends> {
    let clock = Arc::new(SystemClock);
    let cache = cache(config, clock.clone()).await?;
    let queue = Arc::new(InMemoryTaskQueue::with_clock(clock.clone()));

    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; job state is kept in memory");
        return Ok(Backends {
            cache,
            ..Backends::in_memory(clock)
        });
    };

    let store = Arc::new(
        PostgresStore::connect(url)
            .await
            .context("connecting to postgres")?,
    );
    store.ensure_schema().await.context("creating schema")?;
    info!("using postgres stores");

    Ok(Backends {
        jobs: store.clone(),
        attempts: store.clone(),
        health: store,
        cache,
        queue,
        clock,
    })
}

#[cfg(feature = "redis")]
async fn cache(config: &OrchestratorConfig, clock: Arc<SystemClock>) -> anyhow::Result<Arc<dyn Cache>> {
    match config.redis_url.as_deref() {
        Some(url) => {
            let cache = conductor_infra::cache::RedisCache::connect(url, None)
                .await
                .context("connecting to redis")?;
            info!("using redis cache");
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(InMemoryCache::with_clock(clock))),
    }
}

#[cfg(not(feature = "redis"))]
async fn cache(config: &OrchestratorConfig, clock: Arc<SystemClock>) -> anyhow::Result<Arc<dyn Cache>> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL set but the redis feature is disabled; using in-memory cache");
    }
    Ok(Arc::new(InMemoryCache::with_clock(clock)))
}
