use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::AppError;
use crate::models::{FailureKind, JobDescriptor, ResultMetadata, ScrapeOptions, ScrapeResult};
use crate::plugin::{PluginCache, PluginContext, PluginRegistry};
use crate::pool::{BrowserPool, PageLease};
use crate::retry::RetryPolicy;
use crate::traits::ResultNotifier;

/// Breaker guarding webhook delivery.
pub const WEBHOOK_BREAKER: &str = "webhook";

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    Started {
        job_id: Uuid,
        plugin_ref: &'a str,
        url: &'a str,
        timeout_ms: u64,
    },
    Completed {
        job_id: Uuid,
        execution_time_ms: u64,
    },
    Failed {
        job_id: Uuid,
        kind: FailureKind,
        error: &'a str,
    },
    TimedOut {
        job_id: Uuid,
        timeout_ms: u64,
    },
    PageReleased {
        job_id: Uuid,
        instance_id: &'a str,
    },
    WebhookDelivered {
        job_id: Uuid,
        endpoint: &'a str,
    },
    WebhookFailed {
        job_id: Uuid,
        endpoint: &'a str,
        error: &'a str,
    },
}

/// Trait for receiving job events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::Started {
                job_id,
                plugin_ref,
                url,
                timeout_ms,
            } => {
                tracing::info!(%job_id, plugin = %plugin_ref, %url, timeout_ms, "Job started");
            }
            JobEvent::Completed {
                job_id,
                execution_time_ms,
            } => {
                tracing::info!(%job_id, execution_time_ms, "Job completed");
            }
            JobEvent::Failed {
                job_id,
                kind,
                error,
            } => {
                tracing::warn!(%job_id, ?kind, %error, "Job failed");
            }
            JobEvent::TimedOut { job_id, timeout_ms } => {
                tracing::warn!(%job_id, timeout_ms, "Job timed out, execution unit terminated");
            }
            JobEvent::PageReleased {
                job_id,
                instance_id,
            } => {
                tracing::debug!(%job_id, %instance_id, "Page released");
            }
            JobEvent::WebhookDelivered { job_id, endpoint } => {
                tracing::info!(%job_id, %endpoint, "Result delivered to webhook");
            }
            JobEvent::WebhookFailed {
                job_id,
                endpoint,
                error,
            } => {
                tracing::warn!(%job_id, %endpoint, %error, "Webhook delivery failed");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Used when a descriptor carries `timeoutMs = 0`.
    pub default_timeout: Duration,
    /// Upper bound applied to every job.
    pub max_timeout: Duration,
    /// How long to wait for an aborted unit to unwind.
    pub termination_grace: Duration,
    pub webhook_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(300),
            termination_grace: Duration::from_millis(50),
            webhook_retry: RetryPolicy::default(),
        }
    }
}

/// Runs jobs in isolated execution units bounded by a hard timeout.
#[derive(Clone)]
pub struct JobOrchestrator {
    pool: BrowserPool,
    plugins: PluginRegistry,
    breakers: CircuitBreakerRegistry,
    notifier: Option<Arc<dyn ResultNotifier>>,
    reporter: Arc<dyn JobReporter>,
    config: OrchestratorConfig,
}

type LeaseSlot = Arc<Mutex<Option<PageLease>>>;

/// Everything one execution unit owns.
struct ExecutionUnit {
    pool: BrowserPool,
    plugins: PluginRegistry,
    plugin_ref: String,
    options: ScrapeOptions,
    ctx: PluginContext,
    lease: LeaseSlot,
}

impl ExecutionUnit {
    async fn run(self) -> Result<serde_json::Value, AppError> {
        let mut cache = PluginCache::new(self.plugins);
        let plugin = cache.resolve(&self.plugin_ref)?;

        let lease = self.pool.acquire_page(&self.options.page_options()).await?;
        let page = lease.page().clone();
        *lock_slot(&self.lease) = Some(lease);

        plugin.scrape(&self.options, page, &self.ctx).await
    }
}

fn lock_slot(slot: &LeaseSlot) -> std::sync::MutexGuard<'_, Option<PageLease>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn validate_http_url(field: &str, raw: &str) -> Result<(), AppError> {
    let url = Url::parse(raw).map_err(|e| AppError::InvalidJob(format!("{field} '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(AppError::InvalidJob(format!(
            "{field} must be http or https, got '{other}'"
        ))),
    }
}

impl JobOrchestrator {
    pub fn new(
        pool: BrowserPool,
        plugins: PluginRegistry,
        breakers: CircuitBreakerRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            plugins,
            breakers,
            notifier: None,
            reporter: Arc::new(TracingJobReporter),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ResultNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Check the descriptor and return the effective timeout.
    pub fn validate(&self, descriptor: &JobDescriptor) -> Result<Duration, AppError> {
        if descriptor.plugin_ref.trim().is_empty() {
            return Err(AppError::InvalidJob("pluginRef must not be empty".into()));
        }
        validate_http_url("url", &descriptor.options.url)?;
        let engine = descriptor.options.engine;
        if !self.pool.engines().contains(&engine) {
            return Err(AppError::InvalidJob(format!(
                "No browser engine '{engine}' is available"
            )));
        }
        if let Some(webhook) = descriptor.webhook_url.as_deref() {
            validate_http_url("webhookUrl", webhook)?;
        }

        let requested = if descriptor.timeout_ms == 0 {
            self.config.default_timeout
        } else {
            Duration::from_millis(descriptor.timeout_ms)
        };
        Ok(requested.min(self.config.max_timeout))
    }

    /// Run one job to completion. Always yields exactly one result.
    pub async fn run_job(&self, descriptor: JobDescriptor) -> ScrapeResult {
        let job_id = Uuid::new_v4();
        let result = self.execute(job_id, &descriptor).await;

        if let Some(endpoint) = descriptor.webhook_url.clone() {
            self.spawn_delivery(endpoint, result.clone());
        }
        result
    }

    /// Run many jobs with at most `concurrency` in flight. Results keep input order.
    pub async fn run_batch(
        &self,
        descriptors: Vec<JobDescriptor>,
        concurrency: usize,
    ) -> Vec<ScrapeResult> {
        futures::stream::iter(descriptors)
            .map(|descriptor| self.run_job(descriptor))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    async fn execute(&self, job_id: Uuid, descriptor: &JobDescriptor) -> ScrapeResult {
        let started = Instant::now();
        let timestamp = Utc::now();
        let engine = descriptor.options.engine.as_str();

        let timeout = match self.validate(descriptor) {
            Ok(timeout) => timeout,
            Err(e) => {
                return self.fail(job_id, &e, descriptor, timestamp, started);
            }
        };
        let timeout_ms = timeout.as_millis() as u64;

        self.reporter.report(JobEvent::Started {
            job_id,
            plugin_ref: &descriptor.plugin_ref,
            url: &descriptor.options.url,
            timeout_ms,
        });

        let lease: LeaseSlot = Arc::new(Mutex::new(None));
        let ctx = PluginContext::new(job_id, self.breakers.clone());
        let cancel = ctx.cancel.clone();
        let unit = ExecutionUnit {
            pool: self.pool.clone(),
            plugins: self.plugins.clone(),
            plugin_ref: descriptor.plugin_ref.clone(),
            options: descriptor.options.clone(),
            ctx,
            lease: Arc::clone(&lease),
        };
        let mut handle: JoinHandle<Result<serde_json::Value, AppError>> = tokio::spawn(unit.run());

        let outcome = tokio::time::timeout(timeout, &mut handle).await;
        if outcome.is_err() {
            cancel.cancel();
            handle.abort();
            // Let the aborted unit unwind so it no longer touches its lease.
            let _ = tokio::time::timeout(self.config.termination_grace, &mut handle).await;
        }

        let held = lock_slot(&lease).take();
        if let Some(held) = held {
            let instance_id = held.instance_id().to_string();
            self.pool.release_page(held).await;
            self.reporter.report(JobEvent::PageReleased {
                job_id,
                instance_id: &instance_id,
            });
        }

        let metadata = ResultMetadata {
            url: descriptor.options.url.clone(),
            timestamp_iso: timestamp,
            execution_time_ms: started.elapsed().as_millis() as u64,
            engine: engine.to_string(),
        };

        match outcome {
            Ok(Ok(Ok(data))) => {
                self.reporter.report(JobEvent::Completed {
                    job_id,
                    execution_time_ms: metadata.execution_time_ms,
                });
                ScrapeResult::succeeded(job_id, data, metadata)
            }
            Ok(Ok(Err(e))) => {
                let error = e.to_string();
                self.reporter.report(JobEvent::Failed {
                    job_id,
                    kind: e.kind(),
                    error: &error,
                });
                ScrapeResult::failed(job_id, &e, metadata)
            }
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    format!(
                        "Execution unit panicked: {}",
                        panic_message(join_error.into_panic().as_ref())
                    )
                } else {
                    "Execution unit was cancelled".to_string()
                };
                self.reporter.report(JobEvent::Failed {
                    job_id,
                    kind: FailureKind::Internal,
                    error: &message,
                });
                ScrapeResult::crashed(job_id, message, metadata)
            }
            Err(_) => {
                self.reporter.report(JobEvent::TimedOut { job_id, timeout_ms });
                ScrapeResult::failed(job_id, &AppError::WorkerTimeout(timeout_ms), metadata)
            }
        }
    }

    fn fail(
        &self,
        job_id: Uuid,
        error: &AppError,
        descriptor: &JobDescriptor,
        timestamp: DateTime<Utc>,
        started: Instant,
    ) -> ScrapeResult {
        let message = error.to_string();
        self.reporter.report(JobEvent::Failed {
            job_id,
            kind: error.kind(),
            error: &message,
        });
        let metadata = ResultMetadata {
            url: descriptor.options.url.clone(),
            timestamp_iso: timestamp,
            execution_time_ms: started.elapsed().as_millis() as u64,
            engine: descriptor.options.engine.as_str().to_string(),
        };
        ScrapeResult::failed(job_id, error, metadata)
    }

    /// Deliver `result` in the background. Failures are only reported.
    fn spawn_delivery(&self, endpoint: String, result: ScrapeResult) -> Option<JoinHandle<()>> {
        let Some(notifier) = self.notifier.clone() else {
            tracing::warn!(job_id = %result.job_id, %endpoint, "Webhook requested but no notifier configured");
            return None;
        };
        let breakers = self.breakers.clone();
        let policy = self.config.webhook_retry.clone();
        let reporter = Arc::clone(&self.reporter);

        Some(tokio::spawn(async move {
            let (breakers, notifier) = (&breakers, &notifier);
            let (endpoint_ref, result_ref) = (&endpoint, &result);
            let outcome = policy
                .run(WEBHOOK_BREAKER, move |_attempt| {
                    breakers.execute(WEBHOOK_BREAKER, move || {
                        notifier.notify(endpoint_ref, result_ref)
                    })
                })
                .await;
            match outcome {
                Ok(()) => reporter.report(JobEvent::WebhookDelivered {
                    job_id: result.job_id,
                    endpoint: &endpoint,
                }),
                Err(e) => {
                    let error = e.to_string();
                    reporter.report(JobEvent::WebhookFailed {
                        job_id: result.job_id,
                        endpoint: &endpoint,
                        error: &error,
                    });
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::models::{EngineKind, ORCHESTRATOR_ENGINE};
    use crate::plugin::ScraperPlugin;
    use crate::pool::PoolConfig;
    use crate::testutil::{MockEngine, MockPlugin, RecordingNotifier, RecordingReporter};
    use crate::traits::BrowserEngine;

    struct Harness {
        orchestrator: JobOrchestrator,
        pool: BrowserPool,
        engine: Arc<MockEngine>,
        reporter: Arc<RecordingReporter>,
    }

    fn harness(pool_config: PoolConfig) -> Harness {
        let engine = MockEngine::new(EngineKind::Chromium);
        let pool = BrowserPool::new(pool_config, [engine.clone() as Arc<dyn BrowserEngine>]);

        let mut plugins = PluginRegistry::new();
        plugins
            .register("ok", || Ok(Box::new(MockPlugin::ok(serde_json::json!({"title": "Example"}))) as Box<dyn ScraperPlugin>))
            .unwrap();
        plugins
            .register("fails", || Ok(Box::new(MockPlugin::err("selector not found")) as Box<dyn ScraperPlugin>))
            .unwrap();
        plugins
            .register("sleepy", || Ok(Box::new(MockPlugin::sleep(Duration::from_secs(10))) as Box<dyn ScraperPlugin>))
            .unwrap();
        plugins
            .register("panics", || Ok(Box::new(MockPlugin::panic("boom")) as Box<dyn ScraperPlugin>))
            .unwrap();
        plugins
            .register("visits", || Ok(Box::new(MockPlugin::visit()) as Box<dyn ScraperPlugin>))
            .unwrap();

        let reporter = Arc::new(RecordingReporter::default());
        let orchestrator = JobOrchestrator::new(
            pool.clone(),
            plugins,
            CircuitBreakerRegistry::default(),
            OrchestratorConfig::default(),
        )
        .with_reporter(reporter.clone());

        Harness {
            orchestrator,
            pool,
            engine,
            reporter,
        }
    }

    fn job(plugin: &str, timeout_ms: u64) -> JobDescriptor {
        JobDescriptor::new(plugin, ScrapeOptions::new("https://example.com/page"), timeout_ms)
    }

    #[tokio::test]
    async fn test_successful_job_returns_data_and_releases_page() {
        let h = harness(PoolConfig::default());

        let result = h.orchestrator.run_job(job("ok", 5_000)).await;

        assert!(result.success);
        assert_eq!(result.data.unwrap()["title"], "Example");
        assert_eq!(result.metadata.engine, "chromium");
        assert_eq!(result.metadata.url, "https://example.com/page");

        let stats = h.pool.stats();
        assert_eq!(stats.pages_in_use, 0);
        assert_eq!(stats.pages_released_total, 1);
        assert_eq!(h.engine.pages_closed(), 1);
        assert_eq!(h.reporter.count("completed"), 1);
    }

    #[tokio::test]
    async fn test_plugin_receives_isolated_page() {
        let h = harness(PoolConfig::default());

        let result = h.orchestrator.run_job(job("visits", 5_000)).await;

        let data = result.data.unwrap();
        assert_eq!(data["url"], "https://example.com/page");
        assert!(data["contextId"].as_str().unwrap().starts_with("ctx-"));
    }

    #[tokio::test]
    async fn test_hung_plugin_is_terminated_at_timeout() {
        let h = harness(PoolConfig::default());

        let started = Instant::now();
        let result = h.orchestrator.run_job(job("sleepy", 100)).await;
        let elapsed = started.elapsed();

        assert!(!result.success);
        assert!(result.is_timeout());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");

        let stats = h.pool.stats();
        assert_eq!(stats.pages_in_use, 0);
        assert_eq!(stats.pages_released_total, 1);
        assert_eq!(h.engine.pages_closed(), 1);
        assert_eq!(h.engine.double_closes(), 0);
        assert_eq!(h.reporter.count("timed_out"), 1);
        assert_eq!(h.reporter.count("page_released"), 1);
    }

    #[tokio::test]
    async fn test_plugin_error_is_execution_failure() {
        let h = harness(PoolConfig::default());

        let result = h.orchestrator.run_job(job("fails", 5_000)).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(FailureKind::PluginExecution));
        assert!(result.error.unwrap().contains("selector not found"));
        assert_eq!(h.pool.stats().pages_in_use, 0);
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_load_error_and_takes_no_page() {
        let h = harness(PoolConfig::default());

        let result = h.orchestrator.run_job(job("nope", 5_000)).await;

        assert_eq!(result.error_kind, Some(FailureKind::PluginLoad));
        assert_eq!(h.engine.launched(), 0);
    }

    #[tokio::test]
    async fn test_panicking_plugin_yields_orchestrator_failure() {
        let h = harness(PoolConfig::default());

        let result = h.orchestrator.run_job(job("panics", 5_000)).await;

        assert!(!result.success);
        assert_eq!(result.metadata.engine, ORCHESTRATOR_ENGINE);
        assert_eq!(result.error_kind, Some(FailureKind::Internal));
        assert!(result.error.unwrap().contains("boom"));
        assert_eq!(h.pool.stats().pages_in_use, 0);
        assert_eq!(h.engine.pages_closed(), 1);
    }

    #[tokio::test]
    async fn test_invalid_descriptors_are_rejected_before_dispatch() {
        let h = harness(PoolConfig::default());

        let empty_plugin = h.orchestrator.run_job(job("  ", 1_000)).await;
        assert_eq!(empty_plugin.error_kind, Some(FailureKind::InvalidJob));

        let mut bad_url = job("ok", 1_000);
        bad_url.options.url = "file:///etc/passwd".into();
        let result = h.orchestrator.run_job(bad_url).await;
        assert_eq!(result.error_kind, Some(FailureKind::InvalidJob));

        assert_eq!(h.engine.launched(), 0);
        assert_eq!(h.reporter.count("started"), 0);
    }

    #[test]
    fn test_timeout_defaults_and_clamps() {
        let h = harness(PoolConfig::default());
        let config = h.orchestrator.config().clone();

        assert_eq!(
            h.orchestrator.validate(&job("ok", 0)).unwrap(),
            config.default_timeout
        );
        assert_eq!(
            h.orchestrator.validate(&job("ok", u64::MAX)).unwrap(),
            config.max_timeout
        );
        assert_eq!(
            h.orchestrator.validate(&job("ok", 250)).unwrap(),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_reported_in_result() {
        let h = harness(PoolConfig {
            max_instances: 1,
            max_pages_per_instance: 1,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let held = h
            .pool
            .acquire_page(&Default::default())
            .await
            .unwrap();

        let result = h.orchestrator.run_job(job("ok", 5_000)).await;
        assert_eq!(result.error_kind, Some(FailureKind::PoolExhausted));

        h.pool.release_page(held).await;
    }

    #[tokio::test]
    async fn test_pool_side_failures_are_not_plugin_failures() {
        let h = harness(PoolConfig::default());

        let mut remote = job("ok", 1_000);
        remote.options = remote.options.with_engine(EngineKind::RemoteCdp);
        let result = h.orchestrator.run_job(remote).await;
        assert_eq!(result.error_kind, Some(FailureKind::InvalidJob));
        assert!(result.error.unwrap().contains("remote-cdp"));

        h.pool.shutdown().await;
        let result = h.orchestrator.run_job(job("ok", 1_000)).await;
        assert_eq!(result.error_kind, Some(FailureKind::PoolExhausted));
        assert!(result.error.unwrap().contains("shut down"));

        assert_eq!(h.engine.launched(), 0);
        assert_eq!(h.reporter.count("completed"), 0);
    }

    #[tokio::test]
    async fn test_batch_respects_pool_capacity_and_order() {
        let h = harness(PoolConfig {
            max_instances: 1,
            max_pages_per_instance: 2,
            ..Default::default()
        });

        let jobs = vec![job("ok", 5_000), job("fails", 5_000), job("ok", 5_000), job("ok", 5_000)];
        let results = h.orchestrator.run_batch(jobs, 4).await;

        let outcomes: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(outcomes, vec![true, false, true, true]);
        assert!(h.engine.instances()[0].max_open_pages() <= 2);
        assert_eq!(h.pool.stats().pages_in_use, 0);
    }

    #[tokio::test]
    async fn test_webhook_receives_result() {
        let h = harness(PoolConfig::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = h.orchestrator.clone().with_notifier(notifier.clone());

        let result = orchestrator
            .run_job(job("ok", 5_000).with_webhook("https://hooks.example.com/done"))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "https://hooks.example.com/done");
        assert_eq!(delivered[0].1.job_id, result.job_id);
        assert_eq!(h.reporter.count("webhook_delivered"), 1);
    }

    #[tokio::test]
    async fn test_webhook_failures_are_retried_then_reported() {
        let h = harness(PoolConfig::default());
        let notifier = Arc::new(RecordingNotifier::failing(2));
        let mut config = OrchestratorConfig::default();
        config.webhook_retry = RetryPolicy::new(3, Duration::from_millis(5));
        let orchestrator = JobOrchestrator::new(
            h.pool.clone(),
            h.orchestrator.plugins().clone(),
            CircuitBreakerRegistry::new(
                CircuitBreakerConfig::new(10, 1, Duration::from_secs(1)),
                Default::default(),
            ),
            config,
        )
        .with_notifier(notifier.clone())
        .with_reporter(h.reporter.clone());

        let result = orchestrator
            .run_job(job("ok", 5_000).with_webhook("https://hooks.example.com/done"))
            .await;
        assert!(result.success);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(notifier.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(notifier.delivered().len(), 1);
    }
}
