use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;
use crate::models::{EngineKind, PageOptions, ScrapeResult};

/// Shared handle to an isolated browsing context.
pub type PageRef = Arc<dyn BrowserPage>;

/// A single isolated browsing context (its own cookies and storage).
///
/// Plugins drive pages through this interface; the pool owns their lifecycle.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Identifier of the isolated context backing this page.
    fn context_id(&self) -> &str;

    async fn goto(&self, url: &str) -> Result<(), AppError>;

    /// Fully rendered DOM as HTML.
    async fn content(&self) -> Result<String, AppError>;

    async fn title(&self) -> Result<Option<String>, AppError>;

    async fn current_url(&self) -> Result<Option<String>, AppError>;

    /// Evaluate a JavaScript expression and return its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, AppError>;

    /// Close the page and dispose its isolated context.
    async fn close(&self) -> Result<(), AppError>;
}

/// A live browser process or connection owned by the pool.
#[async_trait]
pub trait BrowserInstance: Send + Sync {
    /// Carve a fresh isolated context and open a page in it.
    async fn new_isolated_page(&self, options: &PageOptions) -> Result<PageRef, AppError>;

    /// False once the underlying process or connection is gone.
    fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<(), AppError>;
}

/// Factory for browser instances of one backend.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn launch(&self) -> Result<Arc<dyn BrowserInstance>, AppError>;
}

/// Delivers finished job results to an external endpoint.
#[async_trait]
pub trait ResultNotifier: Send + Sync {
    async fn notify(&self, endpoint: &str, result: &ScrapeResult) -> Result<(), AppError>;
}

/// Converts raw HTML into clean Markdown text.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;
}

/// Extracts structured JSON data from text content using an LLM.
pub trait Extractor: Send + Sync + Clone {
    /// Sends the content and JSON schema to the LLM and returns extracted JSON.
    fn extract(
        &self,
        content: &str,
        schema: &serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Creates an [`Extractor`] for a given model and API endpoint.
pub trait ExtractorFactory: Send + Sync + Clone {
    type Extractor: Extractor;

    fn create(&self, model: &str, base_url: &str) -> Result<Self::Extractor, AppError>;
}
