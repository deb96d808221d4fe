use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use trawl_core::error::AppError;
use trawl_core::models::JobDescriptor;
use trawl_core::rate_limit::{RateLimitDecision, api_key_bucket, domain_bucket};

use crate::auth::{AuthenticatedKey, require_api_key};
use crate::dto::{BreakerListResponse, ErrorResponse, HealthResponse, PoolResponse, ScrapeRequest};
use crate::error::{ApiError, failure_status};
use crate::openapi::ApiDoc;
use crate::state::AppState;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/scrape", post(scrape))
        .route("/v1/breakers", get(list_breakers))
        .route("/v1/pool", get(pool_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

fn rate_limit_headers(decision: &RateLimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp().max(0)),
    );
    headers
}

fn rejection(bucket: &str, decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs(Utc::now());
    let mut headers = rate_limit_headers(decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));

    let body = ErrorResponse {
        error: "rate_limit_exceeded".to_string(),
        message: format!(
            "{}, retry after {retry_after} seconds ({bucket})",
            if bucket.starts_with("domain:") {
                "Target domain budget exhausted"
            } else {
                "API key budget exhausted"
            }
        ),
    };
    (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Scrape
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/scrape",
    request_body = ScrapeRequest,
    responses(
        (status = 200, description = "Job succeeded; body is the ScrapeResult"),
        (status = 400, description = "Invalid job or unknown plugin", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 429, description = "API key or target domain over budget", body = ErrorResponse),
        (status = 502, description = "Plugin failed; body is the failed ScrapeResult"),
        (status = 503, description = "No browser capacity or dependency circuit open"),
        (status = 504, description = "Job timed out; body is the failed ScrapeResult"),
    ),
    security(("bearer" = [])),
    tag = "scrape"
)]
/// Admission runs the API key budget first, then the target domain budget.
/// Each check records on success, so a call the domain budget rejects has
/// already spent one unit of the key budget, while a call the key budget
/// rejects never touches the shared domain budget.
pub async fn scrape(
    State(state): State<Arc<AppState>>,
    Extension(key): Extension<AuthenticatedKey>,
    Json(body): Json<ScrapeRequest>,
) -> Result<Response, ApiError> {
    let descriptor = JobDescriptor::from(body);
    state.ctx.orchestrator.validate(&descriptor)?;

    let limits = &state.ctx.config.rate_limits;
    let key_bucket = api_key_bucket(&key.id);
    let key_decision = state
        .ctx
        .limiter
        .check_limit(&key_bucket, limits.for_tier(key.tier))
        .await;
    if !key_decision.allowed {
        tracing::info!(key = %key.id, "Rejected: API key over budget");
        return Ok(rejection(&key_bucket, &key_decision));
    }

    let domain = domain_bucket(&descriptor.options.url)
        .ok_or_else(|| AppError::InvalidJob(format!("URL has no host: {}", descriptor.options.url)))?;
    let domain_decision = state.ctx.limiter.check_limit(&domain, &limits.domain).await;
    if !domain_decision.allowed {
        tracing::info!(key = %key.id, %domain, "Rejected: domain over budget");
        return Ok(rejection(&domain, &domain_decision));
    }

    let result = state.ctx.orchestrator.run_job(descriptor).await;
    let status = match result.error_kind {
        Some(kind) if !result.success => failure_status(kind),
        _ => StatusCode::OK,
    };

    Ok((status, rate_limit_headers(&key_decision), Json(result)).into_response())
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/breakers",
    responses(
        (status = 200, description = "State of every dependency breaker", body = BreakerListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn list_breakers(State(state): State<Arc<AppState>>) -> Json<BreakerListResponse> {
    Json(BreakerListResponse {
        breakers: state.ctx.breakers.stats(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/pool",
    responses(
        (status = 200, description = "Browser pool statistics", body = PoolResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn pool_stats(State(state): State<Arc<AppState>>) -> Json<PoolResponse> {
    Json(PoolResponse {
        pool: state.ctx.pool.stats(),
        plugins: state
            .ctx
            .orchestrator
            .plugins()
            .ids()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Pool is shut down", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.ctx.pool.stats();
    let closed = state.ctx.pool.is_closed();

    let response = HealthResponse {
        status: if closed { "unhealthy" } else { "healthy" },
        pool: if closed { "closed" } else { "ok" },
        rate_limit_store: state.ctx.limiter.store().name(),
        instances: stats.instance_count,
        pages_in_use: stats.pages_in_use,
    };

    let status = if closed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(response))
}
