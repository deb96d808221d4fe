pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod plugin;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod traits;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState, TripPolicy,
};
pub use config::{RateLimitSettings, TrawlConfig};
pub use context::AppContext;
pub use error::AppError;
pub use models::{
    EngineKind, FailureKind, JobDescriptor, PageOptions, ResultMetadata, ScrapeOptions,
    ScrapeResult, Viewport,
};
pub use plugin::{PluginCache, PluginContext, PluginFactory, PluginRegistry, ScraperPlugin};
pub use pool::{BrowserPool, PageLease, PoolConfig, PoolStats};
pub use rate_limit::{
    InMemoryRateLimitStore, RateLimitConfig, RateLimitDecision, RateLimitStore,
    RateLimitStrategy, RateLimitTier, RateLimiter,
};
pub use retry::RetryPolicy;
pub use traits::{
    BrowserEngine, BrowserInstance, BrowserPage, Cleaner, Extractor, ExtractorFactory, PageRef,
    ResultNotifier,
};
pub use worker::{JobEvent, JobOrchestrator, JobReporter, OrchestratorConfig, TracingJobReporter};
