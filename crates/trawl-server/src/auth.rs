use std::str::FromStr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use trawl_core::error::AppError;
use trawl_core::rate_limit::RateLimitTier;

use crate::dto::ErrorResponse;
use crate::state::AppState;

/// A configured API key. `id` names the rate-limit bucket so the secret
/// itself never reaches logs or the shared store.
#[derive(Clone)]
pub struct ApiKey {
    pub id: String,
    pub tier: RateLimitTier,
    secret: String,
}

impl ApiKey {
    pub fn new(id: impl Into<String>, secret: impl Into<String>, tier: RateLimitTier) -> Self {
        Self {
            id: id.into(),
            tier,
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

/// Identity attached to authenticated requests.
#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub id: String,
    pub tier: RateLimitTier,
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: Vec<ApiKey>,
}

impl ApiKeys {
    pub fn new(keys: Vec<ApiKey>) -> Self {
        Self { keys }
    }

    /// Parse `TRAWL_API_KEYS`: comma-separated `[name=]secret[:tier]` entries.
    /// Unnamed keys are called `key-1`, `key-2`, ... in order.
    ///
    /// Secrets may contain `:` and `=`. A `:suffix` is only read as the tier
    /// when it names one, and a `name=` prefix only when the name is made of
    /// `[A-Za-z0-9_.-]` and is followed by something other than `=`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let mut keys = Vec::new();
        for (index, entry) in raw.split(',').map(str::trim).filter(|e| !e.is_empty()).enumerate() {
            let (name, rest) = match split_name(entry) {
                Some((name, rest)) => (name.to_string(), rest),
                None => (format!("key-{}", index + 1), entry),
            };
            let (secret, tier) = match rest.rsplit_once(':') {
                Some((secret, tier)) => match RateLimitTier::from_str(tier.trim()) {
                    Ok(tier) => (secret, tier),
                    Err(_) => (rest, RateLimitTier::Free),
                },
                None => (rest, RateLimitTier::Free),
            };
            if secret.trim().is_empty() {
                return Err(AppError::ConfigError(format!(
                    "TRAWL_API_KEYS entry '{name}' has an empty key"
                )));
            }
            keys.push(ApiKey::new(name, secret.trim(), tier));
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Every key is compared in constant time, matched or not.
    pub fn authenticate(&self, token: &str) -> Option<AuthenticatedKey> {
        let mut found = None;
        for key in &self.keys {
            if bool::from(token.as_bytes().ct_eq(key.secret.as_bytes())) && found.is_none() {
                found = Some(AuthenticatedKey {
                    id: key.id.clone(),
                    tier: key.tier,
                });
            }
        }
        found
    }
}

fn reject(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
    };
    (status, axum::Json(body)).into_response()
}

/// Validates `Authorization: Bearer <key>` and attaches [`AuthenticatedKey`].
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if state.api_keys.is_empty() {
        return reject(
            StatusCode::FORBIDDEN,
            "forbidden",
            "No API keys configured. Set TRAWL_API_KEYS to enable this endpoint.",
        );
    }

    let key = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .and_then(|token| state.api_keys.authenticate(token));

    match key {
        Some(key) => {
            request.extensions_mut().insert(key);
            next.run(request).await
        }
        None => reject(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid Authorization header. Expected: Bearer <api_key>",
        ),
    }
}

fn split_name(entry: &str) -> Option<(&str, &str)> {
    let (name, rest) = entry.split_once('=')?;
    let name = name.trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    (valid && !rest.is_empty() && !rest.starts_with('=')).then_some((name, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entries() {
        let keys = ApiKeys::parse("alpha:pro, beta=s3cret:enterprise ,gamma").unwrap();
        assert_eq!(keys.len(), 3);

        let first = keys.authenticate("alpha").unwrap();
        assert_eq!(first.id, "key-1");
        assert_eq!(first.tier, RateLimitTier::Pro);

        let second = keys.authenticate("s3cret").unwrap();
        assert_eq!(second.id, "beta");
        assert_eq!(second.tier, RateLimitTier::Enterprise);

        assert_eq!(keys.authenticate("gamma").unwrap().tier, RateLimitTier::Free);
        assert!(keys.authenticate("delta").is_none());
        assert!(keys.authenticate("").is_none());
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(ApiKeys::parse("name=:pro").is_err());
        assert!(ApiKeys::parse(":enterprise").is_err());
        assert!(ApiKeys::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_secrets_with_separators() {
        let keys = ApiKeys::parse(
            "ops=tok:en:with:colons:pro, dXNlcjpwYXNz==, svc=a=b:c, k:platinum",
        )
        .unwrap();
        assert_eq!(keys.len(), 4);

        let ops = keys.authenticate("tok:en:with:colons").unwrap();
        assert_eq!(ops.id, "ops");
        assert_eq!(ops.tier, RateLimitTier::Pro);

        let padded = keys.authenticate("dXNlcjpwYXNz==").unwrap();
        assert_eq!(padded.id, "key-2");
        assert_eq!(padded.tier, RateLimitTier::Free);

        let svc = keys.authenticate("a=b:c").unwrap();
        assert_eq!(svc.id, "svc");
        assert_eq!(svc.tier, RateLimitTier::Free);

        // Not a tier, so part of the secret.
        assert_eq!(keys.authenticate("k:platinum").unwrap().tier, RateLimitTier::Free);
        assert!(keys.authenticate("k").is_none());
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = ApiKey::new("ops", "hunter2", RateLimitTier::Free);
        assert!(!format!("{key:?}").contains("hunter2"));
    }
}
