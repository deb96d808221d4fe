//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. Counters are
//! atomics or `Mutex`-guarded so tests can assert on what happened.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{EngineKind, PageOptions, ScrapeOptions, ScrapeResult};
use crate::plugin::{PluginContext, ScraperPlugin};
use crate::rate_limit::{RateLimitConfig, RateLimitDecision, RateLimitStore};
use crate::traits::{
    BrowserEngine, BrowserInstance, BrowserPage, Cleaner, Extractor, ExtractorFactory, PageRef,
    ResultNotifier,
};
use crate::worker::{JobEvent, JobReporter};

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// FailingRateLimitStore
// ---------------------------------------------------------------------------

/// Store whose every lookup fails, for exercising fail-open admission.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingRateLimitStore;

impl RateLimitStore for FailingRateLimitStore {
    async fn check_and_record(
        &self,
        _key: &str,
        _config: &RateLimitConfig,
        _now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        Err(AppError::DatabaseError("connection refused".into()))
    }
}

// ---------------------------------------------------------------------------
// MockEngine / MockInstance / MockPage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockEngineShared {
    crash_next_pages: AtomicUsize,
    fail_next_pages: AtomicUsize,
    fail_next_launches: AtomicUsize,
    pages_closed: AtomicUsize,
    double_closes: AtomicUsize,
    instances_closed: AtomicUsize,
    context_seq: AtomicUsize,
}

/// Observable state of one mock browser instance.
#[derive(Debug)]
pub struct MockInstanceState {
    alive: AtomicBool,
    open_pages: AtomicUsize,
    max_open_pages: AtomicUsize,
}

impl MockInstanceState {
    pub fn open_pages(&self) -> usize {
        self.open_pages.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open pages ever seen.
    pub fn max_open_pages(&self) -> usize {
        self.max_open_pages.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Simulate the browser process dying.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// In-memory browser engine with crash injection.
pub struct MockEngine {
    kind: EngineKind,
    shared: Arc<MockEngineShared>,
    instances: Mutex<Vec<Arc<MockInstanceState>>>,
}

impl MockEngine {
    pub fn new(kind: EngineKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            shared: Arc::new(MockEngineShared::default()),
            instances: Mutex::new(Vec::new()),
        })
    }

    /// The next `n` page creations fail and kill their instance.
    pub fn crash_next_pages(&self, n: usize) {
        self.shared.crash_next_pages.store(n, Ordering::SeqCst);
    }

    /// The next `n` page creations fail but leave their instance running.
    pub fn fail_next_pages(&self, n: usize) {
        self.shared.fail_next_pages.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_launches(&self, n: usize) {
        self.shared.fail_next_launches.store(n, Ordering::SeqCst);
    }

    pub fn launched(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn instances(&self) -> Vec<Arc<MockInstanceState>> {
        self.instances.lock().unwrap().clone()
    }

    pub fn pages_closed(&self) -> usize {
        self.shared.pages_closed.load(Ordering::SeqCst)
    }

    /// Pages closed more than once. Should always be zero.
    pub fn double_closes(&self) -> usize {
        self.shared.double_closes.load(Ordering::SeqCst)
    }

    pub fn instances_closed(&self) -> usize {
        self.shared.instances_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserEngine for MockEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn launch(&self) -> Result<Arc<dyn BrowserInstance>, AppError> {
        if take_one(&self.shared.fail_next_launches) {
            return Err(AppError::BrowserError("Failed to launch browser".into()));
        }
        let state = Arc::new(MockInstanceState {
            alive: AtomicBool::new(true),
            open_pages: AtomicUsize::new(0),
            max_open_pages: AtomicUsize::new(0),
        });
        self.instances.lock().unwrap().push(state.clone());
        Ok(Arc::new(MockInstance {
            state,
            shared: self.shared.clone(),
        }))
    }
}

struct MockInstance {
    state: Arc<MockInstanceState>,
    shared: Arc<MockEngineShared>,
}

#[async_trait]
impl BrowserInstance for MockInstance {
    async fn new_isolated_page(&self, _options: &PageOptions) -> Result<PageRef, AppError> {
        if !self.state.is_alive() {
            return Err(AppError::BrowserError("Browser connection closed".into()));
        }
        if take_one(&self.shared.crash_next_pages) {
            self.state.kill();
            return Err(AppError::BrowserError("Target crashed".into()));
        }
        if take_one(&self.shared.fail_next_pages) {
            return Err(AppError::BrowserError("Failed to create browser context".into()));
        }

        let open = self.state.open_pages.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open_pages.fetch_max(open, Ordering::SeqCst);
        let seq = self.shared.context_seq.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Arc::new(MockPage {
            context_id: format!("ctx-{seq}"),
            instance: self.state.clone(),
            shared: self.shared.clone(),
            url: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    async fn close(&self) -> Result<(), AppError> {
        self.state.kill();
        self.shared.instances_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Page that records navigation and refuses use after close.
pub struct MockPage {
    context_id: String,
    instance: Arc<MockInstanceState>,
    shared: Arc<MockEngineShared>,
    url: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl MockPage {
    fn ensure_open(&self) -> Result<(), AppError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(AppError::BrowserError("Page is closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrowserPage for MockPage {
    fn context_id(&self) -> &str {
        &self.context_id
    }

    async fn goto(&self, url: &str) -> Result<(), AppError> {
        self.ensure_open()?;
        *self.url.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    async fn content(&self) -> Result<String, AppError> {
        self.ensure_open()?;
        let url = self.url.lock().unwrap().clone().unwrap_or_default();
        Ok(format!(
            "<html><head><title>Mock page</title></head><body><h1>Hello</h1><p>{url}</p></body></html>"
        ))
    }

    async fn title(&self) -> Result<Option<String>, AppError> {
        self.ensure_open()?;
        Ok(Some("Mock page".to_string()))
    }

    async fn current_url(&self) -> Result<Option<String>, AppError> {
        self.ensure_open()?;
        Ok(self.url.lock().unwrap().clone())
    }

    async fn evaluate(&self, _expression: &str) -> Result<serde_json::Value, AppError> {
        self.ensure_open()?;
        Ok(serde_json::Value::Null)
    }

    async fn close(&self) -> Result<(), AppError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.shared.double_closes.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.instance.open_pages.fetch_sub(1, Ordering::SeqCst);
        self.shared.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockPlugin
// ---------------------------------------------------------------------------

enum Behaviour {
    Ok(serde_json::Value),
    Err(String),
    Sleep(Duration),
    Panic(String),
    Visit,
}

/// Plugin with scripted behaviour.
pub struct MockPlugin {
    behaviour: Behaviour,
}

impl MockPlugin {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            behaviour: Behaviour::Ok(data),
        }
    }

    pub fn err(message: &str) -> Self {
        Self {
            behaviour: Behaviour::Err(message.to_string()),
        }
    }

    /// Never finishes within any reasonable job timeout.
    pub fn sleep(duration: Duration) -> Self {
        Self {
            behaviour: Behaviour::Sleep(duration),
        }
    }

    pub fn panic(message: &str) -> Self {
        Self {
            behaviour: Behaviour::Panic(message.to_string()),
        }
    }

    /// Navigates to `options.url` and reports what the page saw.
    pub fn visit() -> Self {
        Self {
            behaviour: Behaviour::Visit,
        }
    }
}

#[async_trait]
impl ScraperPlugin for MockPlugin {
    fn name(&self) -> &str {
        "mock"
    }

    async fn scrape(
        &self,
        options: &ScrapeOptions,
        page: PageRef,
        _ctx: &PluginContext,
    ) -> Result<serde_json::Value, AppError> {
        match &self.behaviour {
            Behaviour::Ok(data) => Ok(data.clone()),
            Behaviour::Err(message) => Err(AppError::PluginExecution(message.clone())),
            Behaviour::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(serde_json::Value::Null)
            }
            Behaviour::Panic(message) => panic!("{message}"),
            Behaviour::Visit => {
                page.goto(&options.url).await?;
                Ok(serde_json::json!({
                    "url": page.current_url().await?,
                    "contextId": page.context_id(),
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter / RecordingNotifier
// ---------------------------------------------------------------------------

/// Reporter that records event names.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == name)
            .count()
    }
}

impl JobReporter for RecordingReporter {
    fn report(&self, event: JobEvent<'_>) {
        let name = match event {
            JobEvent::Started { .. } => "started",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
            JobEvent::TimedOut { .. } => "timed_out",
            JobEvent::PageReleased { .. } => "page_released",
            JobEvent::WebhookDelivered { .. } => "webhook_delivered",
            JobEvent::WebhookFailed { .. } => "webhook_failed",
        };
        self.events.lock().unwrap().push(name);
    }
}

/// Notifier that records deliveries and can fail the first N attempts.
#[derive(Default)]
pub struct RecordingNotifier {
    pub attempts: AtomicUsize,
    failures_left: AtomicUsize,
    delivered: Mutex<Vec<(String, ScrapeResult)>>,
}

impl RecordingNotifier {
    pub fn failing(first_n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(first_n),
            ..Default::default()
        }
    }

    pub fn delivered(&self) -> Vec<(String, ScrapeResult)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultNotifier for RecordingNotifier {
    async fn notify(&self, endpoint: &str, result: &ScrapeResult) -> Result<(), AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures_left) {
            return Err(AppError::NetworkError("connection reset".into()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((endpoint.to_string(), result.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockCleaner / MockExtractor
// ---------------------------------------------------------------------------

/// Mock cleaner that returns its input unchanged, or a scripted error.
#[derive(Clone)]
pub struct MockCleaner {
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockCleaner {
    pub fn passthrough() -> Self {
        Self {
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl Cleaner for MockCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(html.to_string())
    }
}

/// Mock extractor that pops scripted responses and records its inputs.
#[derive(Clone)]
pub struct MockExtractor {
    responses: Arc<Mutex<Vec<Result<serde_json::Value, AppError>>>>,
    pub seen_content: Arc<Mutex<Vec<String>>>,
}

impl MockExtractor {
    pub fn new(data: serde_json::Value) -> Self {
        Self::with_responses(vec![Ok(data)])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            seen_content: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Extractor for MockExtractor {
    async fn extract(
        &self,
        content: &str,
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        self.seen_content.lock().unwrap().push(content.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(serde_json::json!({"default": true}))
        } else {
            responses.remove(0)
        }
    }
}

/// Factory handing out clones of one [`MockExtractor`], or a scripted error.
#[derive(Clone)]
pub struct MockExtractorFactory {
    extractor: MockExtractor,
    create_error: Arc<Mutex<Option<AppError>>>,
    pub requested_models: Arc<Mutex<Vec<String>>>,
    pub requested_base_urls: Arc<Mutex<Vec<String>>>,
}

impl MockExtractorFactory {
    pub fn new(extractor: MockExtractor) -> Self {
        Self {
            extractor,
            create_error: Arc::new(Mutex::new(None)),
            requested_models: Arc::new(Mutex::new(Vec::new())),
            requested_base_urls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_create_error(error: AppError) -> Self {
        Self {
            extractor: MockExtractor::new(serde_json::Value::Null),
            create_error: Arc::new(Mutex::new(Some(error))),
            requested_models: Arc::new(Mutex::new(Vec::new())),
            requested_base_urls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ExtractorFactory for MockExtractorFactory {
    type Extractor = MockExtractor;

    fn create(&self, model: &str, base_url: &str) -> Result<MockExtractor, AppError> {
        if let Some(e) = self.create_error.lock().unwrap().take() {
            return Err(e);
        }
        self.requested_models.lock().unwrap().push(model.to_string());
        self.requested_base_urls.lock().unwrap().push(base_url.to_string());
        Ok(self.extractor.clone())
    }
}
