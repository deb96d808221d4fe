use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;

use trawl_core::TrawlConfig;
use trawl_core::rate_limit::RateLimitConfig;
use trawl_server::auth::ApiKeys;
use trawl_server::limiter::LimiterStore;

use crate::integration::common::{
    FREE_KEY, PRO_KEY, build_app, json_body, scrape_request, send, setup_test_app, test_keys,
};

fn job(plugin: &str, url: &str) -> serde_json::Value {
    json!({"pluginRef": plugin, "options": {"url": url}})
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app();

    let response = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["rate_limit_store"], "memory");
}

#[tokio::test]
async fn health_reports_drained_pool() {
    let app = setup_test_app();
    app.state.ctx.shutdown().await;

    let response = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["pool"], "closed");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app();

    let response = send(
        &app,
        Request::post("/v1/scrape")
            .header("content-type", "application/json")
            .body(Body::from(job("ok", "https://example.com").to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app();

    let response = send(&app, scrape_request("wrong-key", job("ok", "https://example.com"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.engine.launched(), 0);
}

#[tokio::test]
async fn no_keys_configured_returns_403() {
    let app = build_app(TrawlConfig::default(), LimiterStore::default(), ApiKeys::default());

    let response = send(&app, scrape_request(FREE_KEY, job("ok", "https://example.com"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "forbidden");
}

#[tokio::test]
async fn scrape_returns_result_and_rate_limit_headers() {
    let app = setup_test_app();

    let response = send(&app, scrape_request(FREE_KEY, job("ok", "https://example.com/a"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "10");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
    assert!(response.headers().contains_key("x-ratelimit-reset"));

    let json = json_body(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["title"], "Example Domain");
    assert_eq!(json["metadata"]["url"], "https://example.com/a");
    assert!(json["jobId"].is_string());

    let stats = app.state.ctx.pool.stats();
    assert_eq!(stats.pages_opened_total, 1);
    assert_eq!(stats.pages_released_total, 1);
    assert_eq!(stats.pages_in_use, 0);
}

#[tokio::test]
async fn api_key_budget_is_enforced_per_key() {
    let mut config = TrawlConfig::default();
    config.rate_limits.free = RateLimitConfig::new(2, 60);
    let app = build_app(config, LimiterStore::default(), test_keys());

    for i in 0..2 {
        let url = format!("https://site{i}.example/");
        let response = send(&app, scrape_request(FREE_KEY, job("ok", &url))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let rejected = send(&app, scrape_request(FREE_KEY, job("ok", "https://site9.example/"))).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = rejected.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(rejected.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(json_body(rejected).await["error"], "rate_limit_exceeded");

    // The other key has its own budget, and rejected calls never reached the pool.
    let other = send(&app, scrape_request(PRO_KEY, job("ok", "https://site9.example/"))).await;
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(app.state.ctx.pool.stats().pages_opened_total, 3);
}

#[tokio::test]
async fn domain_budget_is_shared_across_keys() {
    let mut config = TrawlConfig::default();
    config.rate_limits.domain = RateLimitConfig::new(1, 60);
    let app = build_app(config, LimiterStore::default(), test_keys());

    let first = send(&app, scrape_request(FREE_KEY, job("ok", "https://shop.example/p/1"))).await;
    assert_eq!(first.status(), StatusCode::OK);

    let same_domain = send(&app, scrape_request(PRO_KEY, job("ok", "https://shop.example/p/2"))).await;
    assert_eq!(same_domain.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(json_body(same_domain).await["message"].as_str().unwrap().contains("domain:shop.example:443"));

    let other_domain = send(&app, scrape_request(PRO_KEY, job("ok", "https://news.example/"))).await;
    assert_eq!(other_domain.status(), StatusCode::OK);
}

#[tokio::test]
async fn key_budget_is_checked_before_domain_budget() {
    let mut config = TrawlConfig::default();
    config.rate_limits.free = RateLimitConfig::new(2, 60);
    config.rate_limits.domain = RateLimitConfig::new(1, 60);
    let app = build_app(config, LimiterStore::default(), test_keys());

    let first = send(&app, scrape_request(FREE_KEY, job("ok", "https://shop.example/1"))).await;
    assert_eq!(first.status(), StatusCode::OK);

    // Rejected by the domain, but the key paid for the attempt.
    let blocked = send(&app, scrape_request(FREE_KEY, job("ok", "https://shop.example/2"))).await;
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(json_body(blocked).await["message"].as_str().unwrap().contains("domain:"));

    // Key budget now spent: rejected before the fresh domain is charged.
    let over_key = send(&app, scrape_request(FREE_KEY, job("ok", "https://news.example/"))).await;
    assert_eq!(over_key.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(json_body(over_key).await["message"].as_str().unwrap().contains("API key budget"));

    let other_key = send(&app, scrape_request(PRO_KEY, job("ok", "https://news.example/"))).await;
    assert_eq!(other_key.status(), StatusCode::OK);
    assert_eq!(app.state.ctx.pool.stats().pages_opened_total, 2);
}

#[tokio::test]
async fn invalid_job_returns_400() {
    let app = setup_test_app();

    let response = send(&app, scrape_request(FREE_KEY, job("ok", "ftp://example.com/file"))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_job");
    assert_eq!(app.engine.launched(), 0);
}

#[tokio::test]
async fn unregistered_engine_returns_400() {
    let app = setup_test_app();

    let body = json!({"pluginRef": "ok", "options": {"url": "https://example.com", "engine": "remote-cdp"}});
    let response = send(&app, scrape_request(FREE_KEY, body)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"], "invalid_job");
    assert!(json["message"].as_str().unwrap().contains("remote-cdp"));
    assert_eq!(app.engine.launched(), 0);
}

#[tokio::test]
async fn unknown_plugin_is_a_failed_result() {
    let app = setup_test_app();

    let response = send(&app, scrape_request(FREE_KEY, job("nope", "https://example.com"))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["errorKind"], "plugin_load");
}

#[tokio::test]
async fn plugin_failure_returns_502_with_result() {
    let app = setup_test_app();

    let response = send(&app, scrape_request(FREE_KEY, job("fails", "https://example.com"))).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let json = json_body(response).await;
    assert_eq!(json["errorKind"], "plugin_execution");
    assert!(json["error"].as_str().unwrap().contains("selector not found"));
    assert_eq!(app.state.ctx.pool.stats().pages_in_use, 0);
}

#[tokio::test]
async fn job_timeout_returns_504_and_frees_page() {
    let app = setup_test_app();

    let body = json!({
        "pluginRef": "sleepy",
        "options": {"url": "https://slow.example"},
        "timeoutMs": 100
    });
    let response = send(&app, scrape_request(FREE_KEY, body)).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await["errorKind"], "timeout");

    let stats = app.state.ctx.pool.stats();
    assert_eq!(stats.pages_in_use, 0);
    assert_eq!(stats.pages_released_total, 1);
}

#[tokio::test]
async fn plugin_options_reach_the_page() {
    let app = setup_test_app();

    let response = send(&app, scrape_request(FREE_KEY, job("visit", "https://example.com/deep"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["data"]["url"], "https://example.com/deep");
    assert!(json["data"]["contextId"].as_str().unwrap().starts_with("ctx-"));
}

#[tokio::test]
async fn pool_and_breaker_endpoints() {
    let app = setup_test_app();
    send(&app, scrape_request(FREE_KEY, job("ok", "https://example.com"))).await;

    let pool = send(
        &app,
        Request::get("/v1/pool")
            .header("authorization", format!("Bearer {PRO_KEY}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(pool.status(), StatusCode::OK);
    let json = json_body(pool).await;
    assert_eq!(json["pool"]["pages_released_total"], 1);
    assert_eq!(json["plugins"], json!(["fails", "ok", "sleepy", "visit"]));

    let _ = app.state.ctx.breakers.get("llm");
    let breakers = send(
        &app,
        Request::get("/v1/breakers")
            .header("authorization", format!("Bearer {PRO_KEY}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(breakers.status(), StatusCode::OK);
    let json = json_body(breakers).await;
    assert_eq!(json["breakers"][0]["name"], "llm");
    assert_eq!(json["breakers"][0]["state"], "closed");
}
