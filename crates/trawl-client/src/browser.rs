//! Chromium engines speaking the Chrome DevTools Protocol via chromiumoxide.
//!
//! Every page lives in its own CDP browser context (incognito-style: separate
//! cookies, storage and cache), created on demand and disposed when the page
//! closes. Contexts can carry their own proxy server.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::{BrowserContextId, CloseParams};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::handler::Handler;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use trawl_core::error::AppError;
use trawl_core::models::{EngineKind, PageOptions, Viewport};
use trawl_core::traits::{BrowserEngine, BrowserInstance, BrowserPage, PageRef};
use uuid::Uuid;

const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn cdp_error(action: &str, e: impl std::fmt::Display) -> AppError {
    AppError::BrowserError(format!("{action}: {e}"))
}

/// Launches a local headless Chromium per pooled instance.
#[derive(Debug, Clone)]
pub struct ChromiumEngine {
    executable: Option<PathBuf>,
    navigation_timeout: Duration,
    extra_args: Vec<String>,
}

impl ChromiumEngine {
    /// Uses `CHROME_BIN` or the first well-known Chrome/Chromium binary found.
    pub fn new() -> Self {
        Self {
            executable: find_chrome_binary(),
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            extra_args: Vec::new(),
        }
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

impl Default for ChromiumEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Chromium
    }

    async fn launch(&self) -> Result<Arc<dyn BrowserInstance>, AppError> {
        // Concurrent Chromium processes must not share a profile directory.
        let user_data_dir = std::env::temp_dir().join(format!("trawl-chromium-{}", Uuid::new_v4()));

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .disable_default_args()
            .user_data_dir(&user_data_dir)
            .request_timeout(self.navigation_timeout);
        if let Some(bin) = &self.executable {
            tracing::debug!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let mut builder = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run");
        for arg in &self.extra_args {
            builder = builder.arg(arg);
        }
        let config = builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|e| cdp_error("Failed to launch browser", e))?;

        Ok(Arc::new(ChromiumInstance::start(
            browser,
            handler,
            true,
            Some(user_data_dir),
            self.navigation_timeout,
        )))
    }
}

/// Connects to an externally managed browser over its CDP websocket.
///
/// Closing an instance only drops the connection; the remote browser keeps
/// running.
#[derive(Debug, Clone)]
pub struct RemoteCdpEngine {
    ws_url: String,
    navigation_timeout: Duration,
}

impl RemoteCdpEngine {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
        }
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }
}

#[async_trait]
impl BrowserEngine for RemoteCdpEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::RemoteCdp
    }

    async fn launch(&self) -> Result<Arc<dyn BrowserInstance>, AppError> {
        let (browser, handler) = Browser::connect(&self.ws_url)
            .await
            .map_err(|e| cdp_error(&format!("Failed to connect to {}", self.ws_url), e))?;

        Ok(Arc::new(ChromiumInstance::start(
            browser,
            handler,
            false,
            None,
            self.navigation_timeout,
        )))
    }
}

/// Browser connection shared by an instance and the pages it carved.
struct Connection {
    id: String,
    browser: Browser,
    alive: Arc<AtomicBool>,
}

struct ChromiumInstance {
    conn: Arc<Connection>,
    handler: JoinHandle<()>,
    owns_process: bool,
    user_data_dir: Option<PathBuf>,
    navigation_timeout: Duration,
}

impl ChromiumInstance {
    fn start(
        browser: Browser,
        mut handler: Handler,
        owns_process: bool,
        user_data_dir: Option<PathBuf>,
        navigation_timeout: Duration,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let alive = Arc::new(AtomicBool::new(true));

        // The CDP handler must be polled continuously for the connection to work.
        let handler = {
            let (id, alive) = (id.clone(), Arc::clone(&alive));
            tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        tracing::debug!(instance_id = %id, error = %e, "CDP handler error");
                    }
                }
                alive.store(false, Ordering::SeqCst);
                tracing::debug!(instance_id = %id, "CDP connection closed");
            })
        };
        let conn = Arc::new(Connection { id, browser, alive });

        Self {
            conn,
            handler,
            owns_process,
            user_data_dir,
            navigation_timeout,
        }
    }

    async fn create_context(&self, proxy: Option<&str>) -> Result<BrowserContextId, AppError> {
        let mut params = CreateBrowserContextParams::default();
        params.proxy_server = proxy.map(str::to_string);
        let response = self
            .conn
            .browser
            .execute(params)
            .await
            .map_err(|e| cdp_error("Failed to create browser context", e))?;
        Ok(response.result.browser_context_id)
    }

    async fn open_page(&self, context: &BrowserContextId, options: &PageOptions) -> Result<Page, AppError> {
        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context.clone())
            .build()
            .map_err(|e| cdp_error("Invalid target params", e))?;
        let page = self
            .conn
            .browser
            .new_page(target)
            .await
            .map_err(|e| cdp_error("Failed to open page", e))?;

        if options.evasion {
            page.enable_stealth_mode()
                .await
                .map_err(|e| cdp_error("Failed to enable stealth mode", e))?;
        }
        if let Some(viewport) = options.viewport {
            page.execute(viewport_override(viewport)?)
                .await
                .map_err(|e| cdp_error("Failed to set viewport", e))?;
        }
        Ok(page)
    }

    async fn dispose_context(&self, context: BrowserContextId) {
        if let Err(e) = self
            .conn
            .browser
            .execute(DisposeBrowserContextParams::new(context))
            .await
        {
            tracing::debug!(instance_id = %self.conn.id, error = %e, "Failed to dispose context");
        }
    }
}

fn viewport_override(viewport: Viewport) -> Result<SetDeviceMetricsOverrideParams, AppError> {
    SetDeviceMetricsOverrideParams::builder()
        .width(i64::from(viewport.width))
        .height(i64::from(viewport.height))
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(|e| cdp_error("Invalid viewport", e))
}

#[async_trait]
impl BrowserInstance for ChromiumInstance {
    async fn new_isolated_page(&self, options: &PageOptions) -> Result<PageRef, AppError> {
        if !self.is_alive() {
            return Err(AppError::InstanceCrashed(format!(
                "Browser connection {} is closed",
                self.conn.id
            )));
        }

        let context = self.create_context(options.proxy.as_deref()).await?;
        match self.open_page(&context, options).await {
            Ok(page) => Ok(Arc::new(ChromiumPage {
                label: context.inner().clone(),
                context: Some(context),
                page,
                conn: Arc::clone(&self.conn),
                closed: AtomicBool::new(false),
                navigation_timeout: self.navigation_timeout,
            })),
            Err(e) => {
                self.dispose_context(context).await;
                Err(e)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.conn.alive.load(Ordering::SeqCst) && !self.handler.is_finished()
    }

    async fn close(&self) -> Result<(), AppError> {
        if self.owns_process && self.is_alive() {
            match tokio::time::timeout(CLOSE_TIMEOUT, self.conn.browser.execute(CloseParams::default())).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(instance_id = %self.conn.id, error = %e, "Browser close command failed"),
                Err(_) => tracing::warn!(instance_id = %self.conn.id, "Browser close timed out"),
            }
        }
        self.conn.alive.store(false, Ordering::SeqCst);
        self.handler.abort();

        if let Some(dir) = &self.user_data_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                tracing::debug!(path = %dir.display(), error = %e, "Could not remove profile directory");
            }
        }
        Ok(())
    }
}

struct ChromiumPage {
    label: String,
    context: Option<BrowserContextId>,
    page: Page,
    conn: Arc<Connection>,
    closed: AtomicBool,
    navigation_timeout: Duration,
}

impl ChromiumPage {
    fn ensure_open(&self) -> Result<(), AppError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::BrowserError("Page is closed".into()));
        }
        if !self.conn.alive.load(Ordering::SeqCst) {
            return Err(AppError::InstanceCrashed("Browser connection lost".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    fn context_id(&self) -> &str {
        &self.label
    }

    async fn goto(&self, url: &str) -> Result<(), AppError> {
        self.ensure_open()?;
        match tokio::time::timeout(self.navigation_timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(cdp_error(&format!("Failed to navigate to {url}"), e)),
            Err(_) => Err(AppError::Timeout(self.navigation_timeout.as_secs())),
        }
    }

    async fn content(&self) -> Result<String, AppError> {
        self.ensure_open()?;
        self.page
            .content()
            .await
            .map_err(|e| cdp_error("Failed to read page content", e))
    }

    async fn title(&self) -> Result<Option<String>, AppError> {
        self.ensure_open()?;
        self.page
            .get_title()
            .await
            .map_err(|e| cdp_error("Failed to read title", e))
    }

    async fn current_url(&self) -> Result<Option<String>, AppError> {
        self.ensure_open()?;
        self.page
            .url()
            .await
            .map_err(|e| cdp_error("Failed to read URL", e))
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, AppError> {
        self.ensure_open()?;
        let result = self
            .page
            .evaluate(expression)
            .await
            .map_err(|e| cdp_error("Script evaluation failed", e))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn close(&self) -> Result<(), AppError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.conn.alive.load(Ordering::SeqCst) {
            return Ok(());
        }

        let page_closed = self.page.clone().close().await;
        if let Some(context) = self.context.clone() {
            self.conn
                .browser
                .execute(DisposeBrowserContextParams::new(context))
                .await
                .map_err(|e| cdp_error("Failed to dispose browser context", e))?;
        }
        page_closed.map_err(|e| cdp_error("Failed to close page", e))
    }
}

/// Local Chromium, plus a remote CDP engine when `cdp_url` is given.
pub fn default_engines(cdp_url: Option<&str>) -> Vec<Arc<dyn BrowserEngine>> {
    let mut engines: Vec<Arc<dyn BrowserEngine>> = vec![Arc::new(ChromiumEngine::new())];
    if let Some(url) = cdp_url.filter(|u| !u.trim().is_empty()) {
        engines.push(Arc::new(RemoteCdpEngine::new(url)));
    }
    engines
}

/// Tries to locate the real Chrome/Chromium binary.
///
/// Snap-packaged Chromium exposes a wrapper that strips unknown flags, so the
/// binary inside the snap is preferred. `None` lets chromiumoxide search.
pub fn find_chrome_binary() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    CANDIDATES.iter().map(PathBuf::from).find(|p| p.exists())
}
