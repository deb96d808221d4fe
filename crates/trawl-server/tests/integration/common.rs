use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use tower::ServiceExt;

use trawl_core::context::AppContext;
use trawl_core::models::EngineKind;
use trawl_core::plugin::{PluginRegistry, ScraperPlugin};
use trawl_core::testutil::{MockEngine, MockPlugin};
use trawl_core::traits::BrowserEngine;
use trawl_core::TrawlConfig;
use trawl_server::auth::{ApiKey, ApiKeys};
use trawl_server::limiter::LimiterStore;
use trawl_server::routes;
use trawl_server::state::AppState;

pub const FREE_KEY: &str = "free-secret";
pub const PRO_KEY: &str = "pro-secret";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub engine: Arc<MockEngine>,
}

fn plugins() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register("ok", || {
            Ok(Box::new(MockPlugin::ok(serde_json::json!({"title": "Example Domain"}))) as Box<dyn ScraperPlugin>)
        })
        .unwrap();
    registry
        .register("visit", || Ok(Box::new(MockPlugin::visit()) as Box<dyn ScraperPlugin>))
        .unwrap();
    registry
        .register("fails", || Ok(Box::new(MockPlugin::err("selector not found")) as Box<dyn ScraperPlugin>))
        .unwrap();
    registry
        .register("sleepy", || {
            Ok(Box::new(MockPlugin::sleep(Duration::from_secs(30))) as Box<dyn ScraperPlugin>)
        })
        .unwrap();
    registry
}

pub fn test_keys() -> ApiKeys {
    ApiKeys::new(vec![
        ApiKey::new("free-client", FREE_KEY, "free".parse().unwrap()),
        ApiKey::new("pro-client", PRO_KEY, "pro".parse().unwrap()),
    ])
}

/// App over mock browsers with the given config, store and keys.
pub fn build_app(config: TrawlConfig, store: LimiterStore, api_keys: ApiKeys) -> TestApp {
    let engine = MockEngine::new(EngineKind::Chromium);
    let ctx = AppContext::new(
        config,
        vec![engine.clone() as Arc<dyn BrowserEngine>],
        plugins(),
        store,
    );
    let state = Arc::new(AppState { ctx, api_keys });

    TestApp {
        router: routes::router(state.clone()),
        state,
        engine,
    }
}

pub fn setup_test_app() -> TestApp {
    build_app(TrawlConfig::default(), LimiterStore::default(), test_keys())
}

pub fn scrape_request(key: &str, body: serde_json::Value) -> Request<Body> {
    Request::post("/v1/scrape")
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(app: &TestApp, request: Request<Body>) -> Response<Body> {
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}
