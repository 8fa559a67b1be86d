use std::sync::Arc;
use std::time::Instant;

use sqlx::SqlitePool;

use crate::cache::MemoryCache;

#[derive(Clone)]
pub struct AppState {
    started_at: Instant,
    pool: SqlitePool,
    cache: Arc<MemoryCache>,
}

impl AppState {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            started_at: Instant::now(),
            pool,
            cache: Arc::new(MemoryCache::new()),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn cache(&self) -> &MemoryCache {
        &self.cache
    }
}
