use chrono::{DateTime, Utc};
use trawl_core::error::AppError;
use trawl_core::rate_limit::{
    InMemoryRateLimitStore, RateLimitConfig, RateLimitDecision, RateLimitStore,
};
use trawl_db::PgRateLimitStore;

/// Admission store chosen at startup: process-local unless `DATABASE_URL`
/// points at a shared PostgreSQL.
#[derive(Clone)]
pub enum LimiterStore {
    Memory(InMemoryRateLimitStore),
    Shared(PgRateLimitStore),
}

impl LimiterStore {
    pub fn name(&self) -> &'static str {
        match self {
            LimiterStore::Memory(_) => "memory",
            LimiterStore::Shared(_) => "postgres",
        }
    }
}

impl Default for LimiterStore {
    fn default() -> Self {
        LimiterStore::Memory(InMemoryRateLimitStore::new())
    }
}

impl RateLimitStore for LimiterStore {
    async fn check_and_record(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        match self {
            LimiterStore::Memory(store) => store.check_and_record(key, config, now).await,
            LimiterStore::Shared(store) => store.check_and_record(key, config, now).await,
        }
    }
}
