use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use trawl_client::{LlmSettings, UrlGuard, builtin_registry};
use trawl_core::context::AppContext;
use trawl_core::models::{EngineKind, JobDescriptor, ScrapeOptions};
use trawl_core::rate_limit::{InMemoryRateLimitStore, RateLimitConfig};
use trawl_core::traits::BrowserEngine;
use trawl_core::{CircuitBreakerConfig, TrawlConfig};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Browser-pool crawling orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scrape job locally and print its result as JSON
    Scrape {
        /// Target URL
        #[arg(short, long)]
        url: String,

        /// Plugin to run (see `trawl plugins`)
        #[arg(short, long, default_value = "page-content")]
        plugin: String,

        /// Browser engine: chromium or remote-cdp
        #[arg(short, long, default_value = "chromium")]
        engine: EngineKind,

        /// Job timeout in milliseconds (0 uses TRAWL_JOB_DEFAULT_TIMEOUT_MS)
        #[arg(short, long, default_value_t = 0)]
        timeout_ms: u64,

        /// Apply stealth patches to the page
        #[arg(long, default_value_t = false)]
        evasion: bool,

        /// Proxy server for the page's browser context
        #[arg(long)]
        proxy: Option<String>,

        /// JSON Schema file, passed to the plugin as `schema`
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// Extra plugin option as key=value; the value is parsed as JSON when possible
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,

        /// Let plugins visit loopback and private network addresses
        #[arg(long, default_value_t = false)]
        allow_private: bool,

        /// CDP websocket endpoint for the remote-cdp engine
        #[arg(long, env = "TRAWL_CDP_URL")]
        cdp_url: Option<String>,
    },

    /// List registered plugin ids
    Plugins,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape {
            url,
            plugin,
            engine,
            timeout_ms,
            evasion,
            proxy,
            schema,
            options,
            allow_private,
            cdp_url,
        } => {
            let mut scrape_options = ScrapeOptions::new(url).with_engine(engine);
            scrape_options.evasion = evasion;
            scrape_options.proxy = proxy;
            if let Some(path) = schema {
                scrape_options = scrape_options.with_extra("schema", read_schema(&path)?);
            }
            for raw in &options {
                let (key, value) = parse_option(raw)?;
                scrape_options = scrape_options.with_extra(key, value);
            }

            let guard = if allow_private {
                UrlGuard::allow_private_urls()
            } else {
                UrlGuard::new()
            };
            let descriptor = JobDescriptor::new(plugin, scrape_options, timeout_ms);
            let success = cmd_scrape(descriptor, guard, cdp_url.as_deref()).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Plugins => {
            let llm = LlmSettings::from_env();
            let registry = builtin_registry(UrlGuard::new(), llm.as_ref())?;
            for id in registry.ids() {
                println!("{id}");
            }
            if llm.is_none() {
                tracing::info!("Set TRAWL_LLM_API_KEY to enable llm-extract");
            }
        }
        Commands::Config => {
            let config = TrawlConfig::from_env().context("Invalid TRAWL_* configuration")?;
            let view = config_view(&config, LlmSettings::from_env().as_ref());
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    Ok(())
}

/// Run the job through a short-lived pool. Returns whether it succeeded.
async fn cmd_scrape(descriptor: JobDescriptor, guard: UrlGuard, cdp_url: Option<&str>) -> Result<bool> {
    let config = TrawlConfig::from_env().context("Invalid TRAWL_* configuration")?;
    let registry = builtin_registry(guard, LlmSettings::from_env().as_ref())?;
    anyhow::ensure!(
        registry.contains(&descriptor.plugin_ref),
        "Unknown plugin '{}' (available: {})",
        descriptor.plugin_ref,
        registry.ids().join(", ")
    );

    let ctx = AppContext::new(config, engines(cdp_url), registry, InMemoryRateLimitStore::new());
    ctx.orchestrator
        .validate(&descriptor)
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        plugin = %descriptor.plugin_ref,
        url = %descriptor.options.url,
        engine = %descriptor.options.engine,
        "Running job"
    );
    let result = ctx.orchestrator.run_job(descriptor).await;
    ctx.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

#[cfg(feature = "browser")]
fn engines(cdp_url: Option<&str>) -> Vec<Arc<dyn BrowserEngine>> {
    trawl_client::default_engines(cdp_url)
}

#[cfg(not(feature = "browser"))]
fn engines(_cdp_url: Option<&str>) -> Vec<Arc<dyn BrowserEngine>> {
    tracing::warn!("Built without the `browser` feature: no engine can serve pages");
    Vec::new()
}

fn read_schema(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
    serde_json::from_str(&raw).context("Invalid JSON in schema file")
}

/// Split `key=value`. Values that are not valid JSON are kept as strings.
fn parse_option(raw: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    anyhow::ensure!(!key.is_empty(), "Option key must not be empty in '{raw}'");

    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn rate_limit_view(config: &RateLimitConfig) -> serde_json::Value {
    json!({
        "maxRequests": config.max_requests,
        "windowSeconds": config.window.as_secs(),
        "strategy": config.strategy,
    })
}

fn breaker_view(config: &CircuitBreakerConfig) -> serde_json::Value {
    json!({
        "failureThreshold": config.failure_threshold,
        "successThreshold": config.success_threshold,
        "cooldownMs": config.cooldown.as_millis() as u64,
        "halfOpenMaxCalls": config.half_open_max_calls,
    })
}

fn config_view(config: &TrawlConfig, llm: Option<&LlmSettings>) -> serde_json::Value {
    let mut breakers: Vec<_> = config.breakers.iter().collect();
    breakers.sort_by(|a, b| a.0.cmp(b.0));
    let overrides: serde_json::Map<_, _> = breakers
        .into_iter()
        .map(|(name, cfg)| (name.clone(), breaker_view(cfg)))
        .collect();

    json!({
        "pool": {
            "maxInstances": config.pool.max_instances,
            "maxPagesPerInstance": config.pool.max_pages_per_instance,
            "instanceIdleTtlSecs": config.pool.instance_idle_ttl.as_secs(),
            "acquireTimeoutMs": config.pool.acquire_timeout.as_millis() as u64,
            "warmInstances": config.warm_instances,
        },
        "jobs": {
            "defaultTimeoutMs": config.orchestrator.default_timeout.as_millis() as u64,
            "maxTimeoutMs": config.orchestrator.max_timeout.as_millis() as u64,
            "webhookMaxAttempts": config.orchestrator.webhook_retry.max_attempts,
        },
        "rateLimits": {
            "free": rate_limit_view(&config.rate_limits.free),
            "pro": rate_limit_view(&config.rate_limits.pro),
            "enterprise": rate_limit_view(&config.rate_limits.enterprise),
            "domain": rate_limit_view(&config.rate_limits.domain),
        },
        "breakers": {
            "default": breaker_view(&config.breaker_default),
            "overrides": overrides,
        },
        "llm": llm.map(|settings| json!({
            "model": settings.defaults.model,
            "baseUrl": settings.defaults.base_url,
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_values_parse_as_json_or_string() {
        let (key, value) = parse_option("maxItems=5").unwrap();
        assert_eq!(key, "maxItems");
        assert_eq!(value, json!(5));

        let (_, value) = parse_option("model=gpt-4o").unwrap();
        assert_eq!(value, json!("gpt-4o"));

        let (_, value) = parse_option(r#"selectors={"a":"h1"}"#).unwrap();
        assert_eq!(value["a"], "h1");
    }

    #[test]
    fn malformed_options_are_rejected() {
        assert!(parse_option("no-separator").is_err());
        assert!(parse_option("=value").is_err());
    }

    #[test]
    fn config_view_lists_overrides_and_hides_llm_key() {
        let config = TrawlConfig::from_lookup(|key| match key {
            "TRAWL_BREAKERS" => Some("llm=2:1:60000".to_string()),
            _ => None,
        })
        .unwrap();
        let llm = LlmSettings::from_lookup(|key| match key {
            "TRAWL_LLM_API_KEY" => Some("sk-secret".to_string()),
            _ => None,
        });

        let view = config_view(&config, llm.as_ref());
        assert_eq!(view["pool"]["maxInstances"], 4);
        assert_eq!(view["rateLimits"]["free"]["maxRequests"], 10);
        assert_eq!(view["breakers"]["overrides"]["llm"]["failureThreshold"], 2);
        assert!(!view.to_string().contains("sk-secret"));
    }

    #[test]
    fn cli_parses_scrape_flags() {
        let cli = Cli::try_parse_from([
            "trawl", "scrape", "--url", "https://example.com", "--engine", "remote-cdp",
            "-o", "limit=3", "--evasion",
        ])
        .unwrap();
        match cli.command {
            Commands::Scrape { engine, evasion, options, plugin, .. } => {
                assert_eq!(engine, EngineKind::RemoteCdp);
                assert!(evasion);
                assert_eq!(options, vec!["limit=3".to_string()]);
                assert_eq!(plugin, "page-content");
            }
            _ => panic!("expected scrape"),
        }
    }
}
