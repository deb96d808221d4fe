use serde::{Deserialize, Serialize};
use trawl_core::circuit_breaker::CircuitBreakerStats;
use trawl_core::models::{JobDescriptor, ScrapeOptions};
use trawl_core::pool::PoolStats;

// ---------------------------------------------------------------------------
// Scrape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeRequest {
    /// Registered plugin id, e.g. `page-content`.
    pub plugin_ref: String,
    /// `url` plus engine, evasion, proxy, viewport and plugin-specific fields.
    #[schema(value_type = Object)]
    pub options: ScrapeOptions,
    /// Wall-clock budget in milliseconds; 0 or absent uses the server default.
    #[serde(default)]
    pub timeout_ms: u64,
    pub webhook_url: Option<String>,
}

impl From<ScrapeRequest> for JobDescriptor {
    fn from(req: ScrapeRequest) -> Self {
        let descriptor = JobDescriptor::new(req.plugin_ref, req.options, req.timeout_ms);
        match req.webhook_url {
            Some(url) => descriptor.with_webhook(url),
            None => descriptor,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BreakerListResponse {
    #[schema(value_type = Vec<Object>)]
    pub breakers: Vec<CircuitBreakerStats>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PoolResponse {
    #[schema(value_type = Object)]
    pub pool: PoolStats,
    pub plugins: Vec<String>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pool: &'static str,
    pub rate_limit_store: &'static str,
    pub instances: usize,
    pub pages_in_use: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
