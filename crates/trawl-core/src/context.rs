use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::TrawlConfig;
use crate::error::AppError;
use crate::models::EngineKind;
use crate::plugin::PluginRegistry;
use crate::pool::BrowserPool;
use crate::rate_limit::{InMemoryRateLimitStore, RateLimitStore, RateLimiter};
use crate::traits::{BrowserEngine, ResultNotifier};
use crate::worker::{JobOrchestrator, JobReporter};

/// Process-wide services, built once at startup and shared by reference.
///
/// Lifecycle is explicit: [`start`](Self::start) warms the pool and spawns
/// the idle reaper, [`shutdown`](Self::shutdown) stops it and drains the pool.
pub struct AppContext<S = InMemoryRateLimitStore> {
    pub config: TrawlConfig,
    pub pool: BrowserPool,
    pub breakers: CircuitBreakerRegistry,
    pub limiter: RateLimiter<S>,
    pub orchestrator: JobOrchestrator,
    background: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<S: RateLimitStore> AppContext<S> {
    pub fn new(
        config: TrawlConfig,
        engines: Vec<Arc<dyn BrowserEngine>>,
        plugins: PluginRegistry,
        store: S,
    ) -> Self {
        let pool = BrowserPool::new(config.pool.clone(), engines);
        let breakers =
            CircuitBreakerRegistry::new(config.breaker_default.clone(), config.breakers.clone());
        let orchestrator = JobOrchestrator::new(
            pool.clone(),
            plugins,
            breakers.clone(),
            config.orchestrator.clone(),
        );

        Self {
            config,
            pool,
            breakers,
            limiter: RateLimiter::new(store),
            orchestrator,
            background: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ResultNotifier>) -> Self {
        self.orchestrator = self.orchestrator.with_notifier(notifier);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.orchestrator = self.orchestrator.with_reporter(reporter);
        self
    }

    /// Warm the pool on `engine` and start background maintenance.
    pub async fn start(&self, engine: EngineKind) -> Result<(), AppError> {
        if self.config.warm_instances > 0 {
            self.pool.warm_up(engine, self.config.warm_instances).await?;
        }

        let mut reaper = self.reaper.lock().unwrap_or_else(|p| p.into_inner());
        if reaper.is_none() {
            *reaper = Some(self.pool.spawn_reaper(self.background.child_token()));
        }
        tracing::info!(
            max_instances = self.config.pool.max_instances,
            max_pages_per_instance = self.config.pool.max_pages_per_instance,
            "Trawl context started"
        );
        Ok(())
    }

    /// Stop background tasks and close every browser instance.
    pub async fn shutdown(&self) {
        self.background.cancel();
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }
        self.pool.shutdown().await;
        tracing::info!("Trawl context shut down");
    }
}
