use std::time::Duration;

use thiserror::Error;

use crate::models::FailureKind;

/// Application-wide error types for Trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// Admission denied by the rate limiter.
    #[error("Rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// No browser capacity became available within the queueing timeout.
    #[error("Browser pool exhausted after waiting {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },

    /// The pool is draining and accepts no new acquisitions.
    #[error("Browser pool is shut down")]
    PoolClosed,

    /// A job exceeded its wall-clock budget and was terminated.
    #[error("Job timed out after {0} ms")]
    WorkerTimeout(u64),

    /// The referenced plugin could not be resolved or instantiated.
    #[error("Plugin load error: {0}")]
    PluginLoad(String),

    /// The plugin ran and returned an error.
    #[error("Plugin execution error: {0}")]
    PluginExecution(String),

    /// A protected dependency call was short-circuited.
    #[error("Circuit breaker '{name}' is open, retry after {} ms", retry_after.as_millis())]
    CircuitOpen { name: String, retry_after: Duration },

    /// A pooled browser instance died and could not be replaced.
    #[error("Browser instance crashed: {0}")]
    InstanceCrashed(String),

    /// Browser engine failure (launch, CDP command, navigation).
    #[error("Browser error: {0}")]
    BrowserError(String),

    /// The job descriptor is malformed.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// HTML-to-Markdown conversion failed.
    #[error("Cleaner error: {0}")]
    CleanerError(String),

    /// Extracted JSON does not match the expected schema.
    #[error("Schema validation error: {0}")]
    SchemaValidationError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded { .. }
            | AppError::PoolExhausted { .. }
            | AppError::CircuitOpen { .. }
            | AppError::InstanceCrashed(_) => true,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error signals a transient dependency failure.
    ///
    /// Used by breakers configured with [`TripPolicy::TransientOnly`](crate::circuit_breaker::TripPolicy).
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded { .. } => {
                true
            }
            AppError::LlmError {
                status_code,
                retryable,
                ..
            } => *status_code == 429 || *status_code >= 500 || *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// Returns true if the dependency told us to slow down (HTTP 429).
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded { .. }
                | AppError::LlmError {
                    status_code: 429,
                    ..
                }
        )
    }

    /// Classify this error for a job result.
    ///
    /// Anything not raised by admission, the pool or validation is
    /// attributed to the plugin.
    pub fn kind(&self) -> FailureKind {
        match self {
            AppError::WorkerTimeout(_) => FailureKind::Timeout,
            AppError::PluginLoad(_) => FailureKind::PluginLoad,
            AppError::PoolExhausted { .. } | AppError::PoolClosed => FailureKind::PoolExhausted,
            AppError::InstanceCrashed(_) => FailureKind::InstanceCrashed,
            AppError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            AppError::InvalidJob(_) | AppError::ConfigError(_) => FailureKind::InvalidJob,
            AppError::RateLimitExceeded { .. } => FailureKind::RateLimited,
            _ => FailureKind::PluginExecution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(
            AppError::RateLimitExceeded {
                retry_after_secs: 5
            }
            .is_retryable()
        );
        assert!(AppError::PoolExhausted { waited_ms: 10 }.is_retryable());
        assert!(!AppError::PluginLoad("missing".into()).is_retryable());
        assert!(!AppError::CleanerError("bad html".into()).is_retryable());
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::Timeout(30).should_trip_circuit());
        assert!(
            AppError::LlmError {
                message: "overloaded".into(),
                status_code: 503,
                retryable: true,
            }
            .should_trip_circuit()
        );
        assert!(!AppError::SchemaValidationError("bad".into()).should_trip_circuit());
    }

    #[test]
    fn test_rate_limited_detection() {
        assert!(
            AppError::LlmError {
                message: "slow down".into(),
                status_code: 429,
                retryable: true,
            }
            .is_rate_limited()
        );
        assert!(!AppError::NetworkError("x".into()).is_rate_limited());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(AppError::WorkerTimeout(100).kind(), FailureKind::Timeout);
        assert_eq!(AppError::PluginLoad("x".into()).kind(), FailureKind::PluginLoad);
        assert_eq!(
            AppError::HttpError("404".into()).kind(),
            FailureKind::PluginExecution
        );
        assert_eq!(AppError::PoolClosed.kind(), FailureKind::PoolExhausted);
        assert_eq!(
            AppError::ConfigError("no engine".into()).kind(),
            FailureKind::InvalidJob
        );
        assert!(!AppError::PoolClosed.is_retryable());
    }
}
