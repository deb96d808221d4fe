//! Scraper plugin contract and the typed registry that resolves plugins by id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::AppError;
use crate::models::ScrapeOptions;
use crate::traits::PageRef;

/// A unit that turns a page plus options into extracted data.
#[async_trait]
pub trait ScraperPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn scrape(
        &self,
        options: &ScrapeOptions,
        page: PageRef,
        ctx: &PluginContext,
    ) -> Result<serde_json::Value, AppError>;
}

/// Builds a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Result<Box<dyn ScraperPlugin>, AppError> + Send + Sync>;

/// What a running plugin may use besides its page.
#[derive(Clone)]
pub struct PluginContext {
    pub job_id: Uuid,
    pub breakers: CircuitBreakerRegistry,
    /// Cancelled when the job's deadline passes. Checking it is optional;
    /// the orchestrator terminates the job regardless.
    pub cancel: CancellationToken,
}

impl PluginContext {
    pub fn new(job_id: Uuid, breakers: CircuitBreakerRegistry) -> Self {
        Self {
            job_id,
            breakers,
            cancel: CancellationToken::new(),
        }
    }

    /// Call an external dependency through its named circuit breaker.
    pub async fn call_dependency<F, T, Fut>(&self, dependency: &str, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.breakers.execute(dependency, operation).await
    }
}

/// Maps stable plugin ids to factories. Populated once at startup.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> Result<(), AppError>
    where
        F: Fn() -> Result<Box<dyn ScraperPlugin>, AppError> + Send + Sync + 'static,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AppError::ConfigError("Plugin id must not be empty".into()));
        }
        if self.factories.contains_key(&id) {
            return Err(AppError::ConfigError(format!(
                "Plugin '{id}' is already registered"
            )));
        }
        tracing::debug!(plugin = %id, "Registered plugin");
        self.factories.insert(id, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build a new instance of the plugin `id`.
    pub fn instantiate(&self, id: &str) -> Result<Box<dyn ScraperPlugin>, AppError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| AppError::PluginLoad(format!("Unknown plugin '{id}'")))?;
        factory().map_err(|e| match e {
            AppError::PluginLoad(_) => e,
            other => AppError::PluginLoad(format!("Plugin '{id}' failed to initialise: {other}")),
        })
    }
}

/// Plugins resolved by one execution unit. Never shared between units.
pub struct PluginCache {
    registry: PluginRegistry,
    loaded: HashMap<String, Arc<dyn ScraperPlugin>>,
}

impl PluginCache {
    pub fn new(registry: PluginRegistry) -> Self {
        Self {
            registry,
            loaded: HashMap::new(),
        }
    }

    /// Resolve `id`, instantiating it on first use.
    pub fn resolve(&mut self, id: &str) -> Result<Arc<dyn ScraperPlugin>, AppError> {
        if let Some(plugin) = self.loaded.get(id) {
            return Ok(Arc::clone(plugin));
        }
        let plugin: Arc<dyn ScraperPlugin> = Arc::from(self.registry.instantiate(id)?);
        self.loaded.insert(id.to_string(), Arc::clone(&plugin));
        Ok(plugin)
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}
