use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Trawl API",
        version = "0.1.0",
        description = "Web-crawling orchestrator: rate-limited, pooled headless-browser scraping with pluggable extractors."
    ),
    paths(
        crate::routes::scrape,
        crate::routes::list_breakers,
        crate::routes::pool_stats,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::ScrapeRequest,
        crate::dto::BreakerListResponse,
        crate::dto::PoolResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "scrape", description = "Run scrape jobs"),
        (name = "system", description = "Health, pool and breaker status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some("API key from TRAWL_API_KEYS."))
                        .build(),
                ),
            );
        }
    }
}
