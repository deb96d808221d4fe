/// Smoke-test for the Chromium-backed browser pool.
///
/// Launches a headless Chromium through `BrowserPool`, opens an isolated page,
/// navigates to <https://example.com> and checks the rendered `<h1>`.
///
/// Run with:
///   cargo run -p trawl-client --example pool_smoke --features browser
use std::sync::Arc;

use trawl_client::ChromiumEngine;
use trawl_core::models::{EngineKind, PageOptions};
use trawl_core::pool::{BrowserPool, PoolConfig};
use trawl_core::traits::BrowserEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let engine: Arc<dyn BrowserEngine> = Arc::new(ChromiumEngine::new());
    let pool = BrowserPool::new(PoolConfig::default(), [engine]);

    println!("Acquiring page…");
    let lease = pool
        .acquire_page(&PageOptions {
            engine: EngineKind::Chromium,
            ..PageOptions::default()
        })
        .await?;

    let url = "https://example.com";
    println!("Navigating to {url} in context {} …", lease.page().context_id());
    lease.page().goto(url).await?;
    let html = lease.page().content().await?;

    assert!(
        html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );

    pool.release_page(lease).await;
    let stats = pool.stats();
    println!(
        "OK: {} bytes rendered, {} page(s) released, {} instance(s) live",
        html.len(),
        stats.pages_released_total,
        stats.instance_count
    );

    pool.shutdown().await;
    Ok(())
}
