use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use trawl_core::error::AppError;
use trawl_core::traits::{Extractor, ExtractorFactory};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a data extraction assistant. Extract the requested fields from the provided web content. Respond ONLY with valid JSON matching the requested schema. Do not include explanations.";

/// OpenAI-compatible chat-completions client used by the `llm-extract` plugin.
///
/// Any provider exposing `/chat/completions` with `json_schema` response
/// formats works, e.g. OpenAI or Gemini's compatibility layer.
#[derive(Clone)]
pub struct OpenAiExtractor {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    system_prompt: String,
}

impl OpenAiExtractor {
    pub fn new(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let system_prompt = self.system_prompt.clone();
        Ok(Self::build(&self.api_key, &self.model, &self.base_url, timeout)?
            .with_system_prompt(system_prompt))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    fn request_body(&self, content: &str, schema: &serde_json::Value) -> Result<ChatRequest, AppError> {
        Ok(ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user",
                    content: format!(
                        "Extract data according to this JSON schema:\n```json\n{}\n```\n\nFrom the following web content:\n\n{}",
                        serde_json::to_string_pretty(schema)?,
                        content
                    ),
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaWrapper {
                    name: "extraction",
                    strict: true,
                    schema: schema.clone(),
                },
            },
        })
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaWrapper,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: &'static str,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Map a non-2xx provider response to an error. 429 and 5xx are retryable,
/// and 429 additionally stretches the `llm` breaker's cooldown.
fn status_error(status_code: u16, body: &str) -> AppError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

    AppError::LlmError {
        message,
        status_code,
        retryable: status_code == 429 || status_code >= 500,
    }
}

fn parse_completion(response: ChatResponse) -> Result<serde_json::Value, AppError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| AppError::LlmError {
            message: "Empty response from LLM".into(),
            status_code: 200,
            retryable: false,
        })?;

    serde_json::from_str(&content).map_err(|e| {
        AppError::SchemaValidationError(format!("LLM returned invalid JSON: {e}. Raw: {content}"))
    })
}

impl Extractor for OpenAiExtractor {
    async fn extract(
        &self,
        content: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self.request_body(content, schema)?;

        tracing::debug!(model = %self.model, chars = content.len(), "Sending extraction request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout.as_secs())
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        parse_completion(chat_response)
    }
}

/// Builds [`OpenAiExtractor`]s sharing one API key, so each job can pick its
/// own model and endpoint.
#[derive(Clone)]
pub struct OpenAiExtractorFactory {
    api_key: String,
    llm_timeout: Option<Duration>,
    system_prompt: Option<String>,
}

impl OpenAiExtractorFactory {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            llm_timeout: None,
            system_prompt: None,
        }
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = Some(timeout);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

impl ExtractorFactory for OpenAiExtractorFactory {
    type Extractor = OpenAiExtractor;

    fn create(&self, model: &str, base_url: &str) -> Result<OpenAiExtractor, AppError> {
        let mut extractor = OpenAiExtractor::new(&self.api_key, model, base_url)?;
        if let Some(timeout) = self.llm_timeout {
            extractor = extractor.with_timeout(timeout)?;
        }
        if let Some(prompt) = &self.system_prompt {
            extractor = extractor.with_system_prompt(prompt.clone());
        }
        Ok(extractor)
    }
}
