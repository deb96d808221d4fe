#[cfg(feature = "browser")]
pub mod browser;
pub mod cleaner;
pub mod guard;
pub mod llm;
pub mod plugins;
pub mod webhook;

#[cfg(feature = "browser")]
pub use browser::{ChromiumEngine, RemoteCdpEngine, default_engines};
pub use cleaner::HtmdCleaner;
pub use guard::UrlGuard;
pub use llm::{OpenAiExtractor, OpenAiExtractorFactory};
pub use plugins::{
    LlmDefaults, LlmExtractPlugin, LlmSettings, MarkdownPlugin, PageContentPlugin,
    builtin_registry, register_builtin_plugins, register_llm_plugin,
};
pub use webhook::HttpWebhookNotifier;
