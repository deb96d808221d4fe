use axum::http::StatusCode;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use trawl_core::TrawlConfig;
use trawl_core::rate_limit::RateLimitConfig;
use trawl_db::{Database, PgRateLimitStore};
use trawl_server::limiter::LimiterStore;

use crate::integration::common::{FREE_KEY, build_app, json_body, scrape_request, send, test_keys};

async fn shared_store() -> (PgRateLimitStore, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "trawl_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");
    let url = format!("postgresql://postgres:postgres@{host}:{port}/trawl_test");

    let mut attempts = 0;
    let pool = loop {
        match PgPoolOptions::new().max_connections(5).connect(&url).await {
            Ok(pool) => break pool,
            Err(e) if attempts < 30 => {
                attempts += 1;
                tracing::debug!("Postgres not ready yet: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            Err(e) => panic!("Failed to connect to database: {e}"),
        }
    };

    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");
    (db.rate_limit_store(), container)
}

#[tokio::test]
async fn key_budget_is_shared_between_processes() {
    let (store, _container) = shared_store().await;

    let mut config = TrawlConfig::default();
    config.rate_limits.free = RateLimitConfig::new(3, 60);

    // Two independent apps stand in for two server processes.
    let first = build_app(config.clone(), LimiterStore::Shared(store.clone()), test_keys());
    let second = build_app(config, LimiterStore::Shared(store), test_keys());

    let health = send(
        &first,
        axum::http::Request::get("/health")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(json_body(health).await["rate_limit_store"], "postgres");

    let job = |n: u32| json!({"pluginRef": "ok", "options": {"url": format!("https://s{n}.example/")}});

    assert_eq!(send(&first, scrape_request(FREE_KEY, job(1))).await.status(), StatusCode::OK);
    assert_eq!(send(&second, scrape_request(FREE_KEY, job(2))).await.status(), StatusCode::OK);
    assert_eq!(send(&first, scrape_request(FREE_KEY, job(3))).await.status(), StatusCode::OK);

    let rejected = send(&second, scrape_request(FREE_KEY, job(4))).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(rejected.headers().contains_key("retry-after"));

    assert_eq!(second.state.ctx.pool.stats().pages_opened_total, 1);
}
