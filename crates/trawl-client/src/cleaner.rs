use std::sync::Arc;

use htmd::HtmlToMarkdown;
use trawl_core::error::AppError;
use trawl_core::traits::Cleaner;

/// Tags that never carry page content worth extracting.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg", "form",
];

/// HTML-to-Markdown cleaner using htmd.
///
/// Rendered pages are converted to Markdown with chrome (navigation, scripts,
/// forms) removed. An optional character cap keeps LLM prompts bounded.
#[derive(Clone)]
pub struct HtmdCleaner {
    converter: Arc<HtmlToMarkdown>,
    max_chars: Option<usize>,
}

impl HtmdCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(SKIPPED_TAGS.to_vec())
            .build();

        Self {
            converter: Arc::new(converter),
            max_chars: None,
        }
    }

    /// Truncate output to at most `max_chars` characters.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = Some(max_chars);
        self
    }
}

impl Default for HtmdCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for HtmdCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        let markdown = self
            .converter
            .convert(html)
            .map_err(|e| AppError::CleanerError(e.to_string()))?;
        let markdown = markdown.trim();

        Ok(match self.max_chars {
            Some(max) if markdown.chars().count() > max => markdown.chars().take(max).collect(),
            _ => markdown.to_string(),
        })
    }
}
