use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use trawl_core::error::AppError;
use trawl_core::models::ScrapeResult;
use trawl_core::traits::ResultNotifier;

use crate::guard::UrlGuard;

const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
pub const JOB_ID_HEADER: &str = "X-Trawl-Job-Id";

/// POSTs finished results as JSON to the job's webhook URL.
///
/// One attempt per call; retries and the `webhook` breaker are applied by the
/// orchestrator around it.
#[derive(Clone)]
pub struct HttpWebhookNotifier {
    client: Client,
    guard: UrlGuard,
    timeout: Duration,
}

impl HttpWebhookNotifier {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(DEFAULT_WEBHOOK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("trawl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            guard: UrlGuard::new(),
            timeout,
        })
    }

    pub fn with_guard(mut self, guard: UrlGuard) -> Self {
        self.guard = guard;
        self
    }
}

/// 5xx and 429 are worth another attempt; any other non-2xx is final.
fn status_error(endpoint: &str, status: StatusCode) -> AppError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AppError::NetworkError(format!("Webhook {endpoint} responded {status}"))
    } else {
        AppError::HttpError(format!("Webhook {endpoint} rejected delivery: {status}"))
    }
}

#[async_trait]
impl ResultNotifier for HttpWebhookNotifier {
    async fn notify(&self, endpoint: &str, result: &ScrapeResult) -> Result<(), AppError> {
        self.guard.check(endpoint).await?;

        let response = self
            .client
            .post(endpoint)
            .header(JOB_ID_HEADER, result.job_id.to_string())
            .json(result)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout.as_secs())
                } else {
                    AppError::NetworkError(format!("Webhook {endpoint} unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(endpoint, status));
        }

        tracing::debug!(job_id = %result.job_id, %endpoint, %status, "Webhook accepted");
        Ok(())
    }
}
