use std::time::Duration;

use async_trait::async_trait;
use rehearse_core::config::LlmConfig;
use rehearse_core::{
    CompletionError, OutputSchema, PromptPayload, RawResponse, RoleConfig,
};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

const MAX_ERROR_BODY_CHARS: usize = 240;

/// One call to the completion boundary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub payload: PromptPayload,
    pub schema: OutputSchema,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl CompletionRequest {
    pub fn for_role(config: &RoleConfig, payload: PromptPayload) -> Self {
        Self {
            payload,
            schema: config.output_schema.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        }
    }
}

/// Schema-constrained text generation.
///
/// Implementations return a payload of the requested [`OutputSchema`] kind or
/// a classified [`CompletionError`]. They never retry on their own; attempt
/// budgeting belongs to the caller.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<RawResponse, CompletionError>;
}

/// OpenAI-compatible `/chat/completions` client. Works against OpenAI and
/// Ollama's compatibility endpoint.
pub struct HttpCompletionClient {
    client: Client,
    chat_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl HttpCompletionClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| {
                CompletionError::Fatal(format!("could not build http client: {error}"))
            })?;

        let base_url = config.base_url.trim_end_matches('/');
        let chat_url = if base_url.ends_with("/chat/completions") {
            base_url.to_string()
        } else {
            format!("{base_url}/chat/completions")
        };

        Ok(Self {
            client,
            chat_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<RawResponse, CompletionError> {
        let body = build_request_body(&self.model, request);
        let mut builder = self.client.post(&self.chat_url).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport_error)?;
        debug!(
            event_name = "agent.completion.response",
            status = status.as_u16(),
            schema = request.schema.kind.schema_name(),
            body_len = text.len(),
            "completion endpoint responded"
        );

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        parse_completion_body(request, &text)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

pub fn build_request_body(model: &str, request: &CompletionRequest) -> Value {
    let messages = request
        .payload
        .messages
        .iter()
        .map(|turn| ChatMessage { role: turn.speaker.as_str(), content: &turn.text })
        .collect::<Vec<_>>();

    json!({
        "model": model,
        "messages": messages,
        "temperature": request.temperature,
        "max_tokens": request.max_output_tokens,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": request.schema.kind.schema_name(),
                "strict": true,
                "schema": request.schema.json_schema,
            }
        }
    })
}

/// Decodes a successful chat completion body into a payload of the requested kind.
pub fn parse_completion_body(
    request: &CompletionRequest,
    body: &str,
) -> Result<RawResponse, CompletionError> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|error| {
        CompletionError::Fatal(format!("completion body is not a chat response: {error}"))
    })?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::Fatal("completion returned no choices".to_string()))?;

    if let Some(refusal) = choice.message.refusal.filter(|value| !value.trim().is_empty()) {
        return Err(CompletionError::Fatal(format!("model refused: {}", truncate(&refusal))));
    }
    if choice.finish_reason.as_deref() == Some("length") {
        return Err(CompletionError::Fatal(
            "completion was cut off by the output token limit".to_string(),
        ));
    }

    let content = choice
        .message
        .content
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| CompletionError::Fatal("completion content was empty".to_string()))?;
    let payload: Value = serde_json::from_str(content.trim()).map_err(|error| {
        CompletionError::Fatal(format!("completion content is not valid JSON: {error}"))
    })?;

    Ok(RawResponse::new(request.schema.kind, payload))
}

/// Rate limits, request timeouts and upstream 5xx are worth another attempt.
/// Everything else means the request itself is wrong.
pub fn classify_status(status: StatusCode, body: &str) -> CompletionError {
    let message = format!("completion endpoint returned {status}: {}", truncate(body));
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        CompletionError::Transient(message)
    } else {
        CompletionError::Fatal(message)
    }
}

fn classify_transport_error(error: reqwest::Error) -> CompletionError {
    if error.is_timeout() || error.is_connect() {
        CompletionError::Transient(format!("completion endpoint unreachable: {error}"))
    } else if error.is_decode() || error.is_body() {
        CompletionError::Transient(format!("completion response was interrupted: {error}"))
    } else {
        CompletionError::Fatal(format!("completion request failed: {error}"))
    }
}

fn truncate(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let mut shortened = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
    shortened.push_str("...");
    shortened
}
