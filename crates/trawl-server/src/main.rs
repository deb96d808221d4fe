use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use trawl_client::{HttpWebhookNotifier, LlmSettings, UrlGuard, builtin_registry};
use trawl_core::context::AppContext;
use trawl_core::rate_limit::InMemoryRateLimitStore;
use trawl_core::traits::BrowserEngine;
use trawl_core::{EngineKind, TrawlConfig};
use trawl_db::{Database, DatabaseConfig};
use trawl_server::auth::ApiKeys;
use trawl_server::limiter::LimiterStore;
use trawl_server::routes;
use trawl_server::state::AppState;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .init();

    let config = TrawlConfig::from_env().context("Invalid TRAWL_* configuration")?;
    let api_keys = ApiKeys::parse(&std::env::var("TRAWL_API_KEYS").unwrap_or_default())?;
    if api_keys.is_empty() {
        tracing::warn!("TRAWL_API_KEYS is empty: /v1 endpoints will answer 403");
    }
    let port = std::env::var("TRAWL_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let store = match DatabaseConfig::from_env_optional()? {
        Some(db_config) => {
            let db = Database::connect(&db_config).await?;
            db.migrate().await?;
            tracing::info!("Using shared PostgreSQL rate-limit store");
            LimiterStore::Shared(db.rate_limit_store())
        }
        None => {
            tracing::info!("DATABASE_URL not set, rate limits are process-local");
            LimiterStore::Memory(InMemoryRateLimitStore::new())
        }
    };

    let guard = UrlGuard::new();
    let llm = LlmSettings::from_env();
    if llm.is_none() {
        tracing::info!("TRAWL_LLM_API_KEY not set, llm-extract plugin disabled");
    }
    let plugins = builtin_registry(guard, llm.as_ref())?;

    let engines = engines();
    let warm_engine = engines.first().map_or(EngineKind::default(), |e| e.kind());

    let ctx = AppContext::new(config, engines, plugins, store)
        .with_notifier(Arc::new(HttpWebhookNotifier::new()?.with_guard(guard)));
    ctx.start(warm_engine).await?;

    let state = Arc::new(AppState { ctx, api_keys });

    let app = routes::router(state.clone())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.ctx.shutdown().await;
    Ok(())
}

#[cfg(feature = "browser")]
fn engines() -> Vec<Arc<dyn BrowserEngine>> {
    trawl_client::default_engines(std::env::var("TRAWL_CDP_URL").ok().as_deref())
}

#[cfg(not(feature = "browser"))]
fn engines() -> Vec<Arc<dyn BrowserEngine>> {
    tracing::warn!("Built without the `browser` feature: no engine can serve pages");
    Vec::new()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install CTRL+C handler: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining browser pool");
}
