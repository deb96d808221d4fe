//! Built-in scraper plugins.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use trawl_core::error::AppError;
use trawl_core::models::ScrapeOptions;
use trawl_core::plugin::{PluginContext, PluginRegistry, ScraperPlugin};
use trawl_core::traits::{Cleaner, Extractor, ExtractorFactory, PageRef};
use url::Url;

use crate::cleaner::HtmdCleaner;
use crate::guard::UrlGuard;
use crate::llm::{DEFAULT_BASE_URL, DEFAULT_MODEL, OpenAiExtractorFactory};

pub const PAGE_CONTENT: &str = "page-content";
pub const MARKDOWN: &str = "markdown";
pub const LLM_EXTRACT: &str = "llm-extract";

/// Breaker name guarding calls to the LLM provider.
pub const LLM_BREAKER: &str = "llm";

/// Check the target, navigate, and return the URL the page ended up on.
async fn navigate(guard: &UrlGuard, page: &PageRef, url: &str) -> Result<String, AppError> {
    guard.check(url).await?;
    page.goto(url).await?;
    Ok(page.current_url().await?.unwrap_or_else(|| url.to_string()))
}

/// `{ title, url, description, links, html }` of the rendered page.
pub struct PageContentPlugin {
    guard: UrlGuard,
}

impl PageContentPlugin {
    pub fn new(guard: UrlGuard) -> Self {
        Self { guard }
    }
}

struct PageSummary {
    title: Option<String>,
    description: Option<String>,
    links: Vec<String>,
}

fn summarize(html: &str, base: &str) -> PageSummary {
    let document = Html::parse_document(html);
    let base = Url::parse(base).ok();

    let first_text = |selector: &str| {
        Selector::parse(selector).ok().and_then(|sel| {
            document
                .select(&sel)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .filter(|s| !s.is_empty())
        })
    };
    let title = first_text("title");

    let description = Selector::parse(r#"meta[name="description"]"#)
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut links: Vec<String> = Vec::new();
    if let Ok(sel) = Selector::parse("a[href]") {
        for href in document.select(&sel).filter_map(|el| el.value().attr("href")) {
            let resolved = match &base {
                Some(base) => base.join(href),
                None => Url::parse(href),
            };
            let Ok(mut link) = resolved else { continue };
            if !matches!(link.scheme(), "http" | "https") {
                continue;
            }
            link.set_fragment(None);
            let link = link.to_string();
            if !links.contains(&link) {
                links.push(link);
            }
        }
    }

    PageSummary {
        title,
        description,
        links,
    }
}

#[async_trait]
impl ScraperPlugin for PageContentPlugin {
    fn name(&self) -> &str {
        PAGE_CONTENT
    }

    async fn scrape(
        &self,
        options: &ScrapeOptions,
        page: PageRef,
        _ctx: &PluginContext,
    ) -> Result<Value, AppError> {
        let url = navigate(&self.guard, &page, &options.url).await?;
        let html = page.content().await?;
        let summary = summarize(&html, &url);
        let title = page.title().await?.filter(|t| !t.is_empty()).or(summary.title);

        Ok(json!({
            "title": title,
            "url": url,
            "description": summary.description,
            "links": summary.links,
            "html": html,
        }))
    }
}

/// `{ title, url, markdown }` of the rendered page.
pub struct MarkdownPlugin<C> {
    guard: UrlGuard,
    cleaner: C,
}

impl<C: Cleaner> MarkdownPlugin<C> {
    pub fn new(guard: UrlGuard, cleaner: C) -> Self {
        Self { guard, cleaner }
    }
}

#[async_trait]
impl<C: Cleaner + 'static> ScraperPlugin for MarkdownPlugin<C> {
    fn name(&self) -> &str {
        MARKDOWN
    }

    async fn scrape(
        &self,
        options: &ScrapeOptions,
        page: PageRef,
        _ctx: &PluginContext,
    ) -> Result<Value, AppError> {
        let url = navigate(&self.guard, &page, &options.url).await?;
        let html = page.content().await?;
        let markdown = self.cleaner.clean(&html)?;
        let title = page.title().await?;

        Ok(json!({
            "title": title,
            "url": url,
            "markdown": markdown,
        }))
    }
}

/// Model and endpoint used when a job does not name its own.
#[derive(Debug, Clone)]
pub struct LlmDefaults {
    pub model: String,
    pub base_url: String,
    /// Other endpoints a job may pick with `baseUrl`. They receive the
    /// configured API key, so only list providers you trust with it.
    pub allowed_base_urls: Vec<String>,
}

impl Default for LlmDefaults {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            allowed_base_urls: Vec::new(),
        }
    }
}

fn same_endpoint(a: &str, b: &str) -> bool {
    a.trim_end_matches('/').eq_ignore_ascii_case(b.trim_end_matches('/'))
}

impl LlmDefaults {
    /// Endpoint for a job: the default, or a requested one from the allowlist.
    pub fn resolve_base_url<'a>(
        &'a self,
        requested: Option<&'a str>,
    ) -> Result<&'a str, AppError> {
        match requested {
            None => Ok(&self.base_url),
            Some(url) if same_endpoint(url, &self.base_url) => Ok(&self.base_url),
            Some(url) if self.allowed_base_urls.iter().any(|a| same_endpoint(url, a)) => Ok(url),
            Some(url) => Err(AppError::InvalidJob(format!(
                "baseUrl '{url}' is not an allowed LLM endpoint"
            ))),
        }
    }
}

/// Structured extraction: page → Markdown → LLM → schema-checked JSON.
///
/// Options read from the job: `schema` (required JSON Schema), and optional
/// `model` and `baseUrl` overriding [`LlmDefaults`]. A `baseUrl` must be on
/// the configured allowlist and pass the URL guard. The LLM call runs through
/// the [`LLM_BREAKER`] circuit breaker.
pub struct LlmExtractPlugin<EF, C> {
    guard: UrlGuard,
    factory: EF,
    cleaner: C,
    defaults: LlmDefaults,
}

impl<EF: ExtractorFactory, C: Cleaner> LlmExtractPlugin<EF, C> {
    pub fn new(guard: UrlGuard, factory: EF, cleaner: C, defaults: LlmDefaults) -> Self {
        Self {
            guard,
            factory,
            cleaner,
            defaults,
        }
    }
}

fn str_option<'a>(options: &'a ScrapeOptions, key: &str) -> Option<&'a str> {
    options.extra.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[async_trait]
impl<EF, C> ScraperPlugin for LlmExtractPlugin<EF, C>
where
    EF: ExtractorFactory + 'static,
    C: Cleaner + 'static,
{
    fn name(&self) -> &str {
        LLM_EXTRACT
    }

    async fn scrape(
        &self,
        options: &ScrapeOptions,
        page: PageRef,
        ctx: &PluginContext,
    ) -> Result<Value, AppError> {
        let schema = options
            .extra
            .get("schema")
            .filter(|s| s.is_object())
            .ok_or_else(|| {
                AppError::PluginExecution(format!("{LLM_EXTRACT} requires a `schema` object option"))
            })?;
        let validator = jsonschema::validator_for(schema).map_err(|e| {
            AppError::PluginExecution(format!("Invalid extraction schema: {e}"))
        })?;

        let model = str_option(options, "model").unwrap_or(self.defaults.model.as_str());
        let base_url = self.defaults.resolve_base_url(str_option(options, "baseUrl"))?;
        if !same_endpoint(base_url, &self.defaults.base_url) {
            self.guard.check(base_url).await?;
        }
        let extractor = self.factory.create(model, base_url)?;

        navigate(&self.guard, &page, &options.url).await?;
        let html = page.content().await?;
        let markdown = self.cleaner.clean(&html)?;

        tracing::debug!(job_id = %ctx.job_id, %model, chars = markdown.len(), "Extracting with LLM");
        let data = ctx
            .call_dependency(LLM_BREAKER, || extractor.extract(&markdown, schema))
            .await?;

        let violations: Vec<String> = validator.iter_errors(&data).map(|e| e.to_string()).collect();
        if !violations.is_empty() {
            return Err(AppError::SchemaValidationError(violations.join("; ")));
        }
        Ok(data)
    }
}

/// Register `page-content` and `markdown`.
pub fn register_builtin_plugins(
    registry: &mut PluginRegistry,
    guard: UrlGuard,
) -> Result<(), AppError> {
    registry.register(PAGE_CONTENT, move || {
        Ok(Box::new(PageContentPlugin::new(guard)) as Box<dyn ScraperPlugin>)
    })?;

    let cleaner = HtmdCleaner::new();
    registry.register(MARKDOWN, move || {
        Ok(Box::new(MarkdownPlugin::new(guard, cleaner.clone())) as Box<dyn ScraperPlugin>)
    })?;
    Ok(())
}

/// Register `llm-extract` backed by `factory`.
pub fn register_llm_plugin<EF>(
    registry: &mut PluginRegistry,
    guard: UrlGuard,
    factory: EF,
    defaults: LlmDefaults,
) -> Result<(), AppError>
where
    EF: ExtractorFactory + 'static,
{
    let cleaner = HtmdCleaner::new().with_max_chars(100_000);
    registry.register(LLM_EXTRACT, move || {
        Ok(Box::new(LlmExtractPlugin::new(
            guard,
            factory.clone(),
            cleaner.clone(),
            defaults.clone(),
        )) as Box<dyn ScraperPlugin>)
    })
}

/// LLM provider settings for `llm-extract`, from `TRAWL_LLM_API_KEY`,
/// `TRAWL_LLM_MODEL`, `TRAWL_LLM_BASE_URL` and `TRAWL_LLM_ALLOWED_BASE_URLS`.
#[derive(Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub defaults: LlmDefaults,
}

impl LlmSettings {
    /// `None` when no API key is configured.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("TRAWL_LLM_API_KEY").filter(|k| !k.trim().is_empty())?;
        let fallback = LlmDefaults::default();
        Some(Self {
            api_key,
            defaults: LlmDefaults {
                model: lookup("TRAWL_LLM_MODEL").unwrap_or(fallback.model),
                base_url: lookup("TRAWL_LLM_BASE_URL").unwrap_or(fallback.base_url),
                allowed_base_urls: lookup("TRAWL_LLM_ALLOWED_BASE_URLS")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
        })
    }
}

/// Registry with every built-in plugin; `llm-extract` only when `llm` is set.
pub fn builtin_registry(guard: UrlGuard, llm: Option<&LlmSettings>) -> Result<PluginRegistry, AppError> {
    let mut registry = PluginRegistry::new();
    register_builtin_plugins(&mut registry, guard)?;
    if let Some(llm) = llm {
        register_llm_plugin(
            &mut registry,
            guard,
            OpenAiExtractorFactory::new(llm.api_key.clone()),
            llm.defaults.clone(),
        )?;
    }
    Ok(registry)
}
