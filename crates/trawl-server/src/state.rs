use trawl_core::context::AppContext;

use crate::auth::ApiKeys;
use crate::limiter::LimiterStore;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub ctx: AppContext<LimiterStore>,
    /// Accepted API keys (empty = scrape endpoints disabled).
    pub api_keys: ApiKeys,
}
