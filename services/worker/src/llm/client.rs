//! services/worker/src/llm/client.rs
//!
//! Provider-agnostic chat-completion client. Implements the
//! `ChatCompletionService` port over raw HTTP, absorbing the endpoint,
//! auth-header and payload differences between OpenAI and Azure OpenAI,
//! including reasoning-model parameter quirks. All failure is encoded in
//! the returned `LlmResult`; this client never surfaces an `Err`.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use lesson_core::json::{extract_json_object, get_u64_loose};
use lesson_core::llm::{ChatMessage, ChatOptions, LlmFailure, LlmResult, ResponseFormat, Usage};
use lesson_core::ports::ChatCompletionService;

use crate::config::{LlmSettings, Provider};
use crate::llm::token::TokenProvider;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const ERROR_BODY_HEAD: usize = 300;

pub struct LlmClient {
    http: reqwest::Client,
    settings: LlmSettings,
    tokens: Arc<TokenProvider>,
}

impl LlmClient {
    /// Creates the client. The connect timeout is fixed on the shared
    /// reqwest client; per-request totals come from `ChatOptions::timeout`.
    pub fn new(settings: LlmSettings, tokens: Arc<TokenProvider>) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self { http, settings, tokens })
    }

    async fn execute(&self, messages: &[ChatMessage], options: &ChatOptions) -> LlmResult {
        let url = match request_url(&self.settings, options) {
            Ok(url) => url,
            Err(message) => return LlmResult::transport_failure("config", message),
        };
        let body = build_chat_body(messages, options);

        let http = match connect_timeout_override(&self.settings, options) {
            Some(connect_timeout) => {
                match reqwest::Client::builder().connect_timeout(connect_timeout).build() {
                    Ok(client) => client,
                    Err(e) => {
                        return LlmResult::transport_failure(
                            "config",
                            format!("failed to build HTTP client: {}", e),
                        )
                    }
                }
            }
            None => self.http.clone(),
        };

        let mut request = http
            .post(&url)
            .timeout(options.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .json(&body);

        request = match self.settings.provider {
            Provider::OpenAi => match self.tokens.bearer().await {
                Ok(token) => request.bearer_auth(token),
                Err(message) => return LlmResult::transport_failure("auth", message),
            },
            Provider::Azure => {
                if let Some(key) = &self.settings.azure_api_key {
                    request.header("api-key", key)
                } else {
                    match self.tokens.bearer().await {
                        Ok(token) => request.bearer_auth(token),
                        Err(message) => return LlmResult::transport_failure("auth", message),
                    }
                }
            }
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let kind = if e.is_timeout() { "timeout" } else { "transport" };
                warn!("LLM request failed before a response arrived: {}", e);
                return LlmResult::transport_failure(kind, e.to_string());
            }
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return LlmResult::transport_failure("transport", e.to_string()),
        };

        if !(200..300).contains(&status) {
            let raw: Option<Value> = serde_json::from_str(&text).ok();
            let message = raw
                .as_ref()
                .and_then(|v| v.get("error"))
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| text.chars().take(ERROR_BODY_HEAD).collect());
            warn!(status, "LLM provider returned an error: {}", message);
            return LlmResult::provider_failure(status, message, raw);
        }

        let raw: Value = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(e) => {
                return LlmResult::provider_failure(
                    status,
                    format!("response body was not JSON: {}", e),
                    None,
                )
            }
        };

        parse_success(status, raw)
    }
}

#[async_trait]
impl ChatCompletionService for LlmClient {
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> LlmResult {
        self.execute(messages, options).await
    }

    async fn chat_json(&self, messages: &[ChatMessage], options: &ChatOptions) -> LlmResult {
        let mut result = self.execute(messages, options).await;
        if !result.ok {
            return result;
        }
        match extract_json_object(&result.content) {
            Some(value) => result.json = Some(value),
            None => {
                debug!("Assistant content was not a decodable JSON object");
                result.error = Some(LlmFailure {
                    kind: "decode".to_string(),
                    message: "Failed to decode JSON object from model output".to_string(),
                });
            }
        }
        result
    }
}

/// A per-request connect timeout that differs from the shared client's
/// needs its own client; otherwise the shared one is reused.
fn connect_timeout_override(settings: &LlmSettings, options: &ChatOptions) -> Option<Duration> {
    options
        .connect_timeout
        .filter(|timeout| *timeout != settings.connect_timeout)
}

/// Reasoning models ("o" series) take different request parameters than
/// standard chat models.
fn is_reasoning_model(model: &str) -> bool {
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().map_or(false, |c| c.is_ascii_digit())
}

/// Builds the chat-completions request payload, applying the per-model
/// parameter quirks.
fn build_chat_body(messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let mut body = Map::new();

    if let Some(model) = &options.model {
        body.insert("model".to_string(), json!(model));
    }
    body.insert(
        "messages".to_string(),
        Value::Array(
            messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                .collect(),
        ),
    );

    let reasoning = options.model.as_deref().map_or(false, is_reasoning_model);
    if let Some(tokens) = options.max_output_tokens {
        let field = if reasoning { "max_completion_tokens" } else { "max_tokens" };
        body.insert(field.to_string(), json!(tokens));
    }

    if let Some(temperature) = options.temperature {
        // Reasoning models reject any temperature other than the default 1.
        if !reasoning || temperature == 1.0 {
            body.insert("temperature".to_string(), json!(temperature));
        }
    }
    if reasoning {
        if let Some(effort) = &options.reasoning_effort {
            body.insert("reasoning_effort".to_string(), json!(effort));
        }
    }

    match &options.response_format {
        Some(ResponseFormat::JsonObject) => {
            body.insert("response_format".to_string(), json!({"type": "json_object"}));
        }
        Some(ResponseFormat::JsonSchema { name, schema }) => {
            body.insert(
                "response_format".to_string(),
                json!({
                    "type": "json_schema",
                    "json_schema": {"name": name, "schema": schema, "strict": true}
                }),
            );
        }
        None => {}
    }

    Value::Object(body)
}

/// Resolves the provider endpoint. Azure routes through either the newer
/// `/openai/v1/` path or the deployment-specific legacy path.
fn request_url(settings: &LlmSettings, options: &ChatOptions) -> Result<String, String> {
    match settings.provider {
        Provider::OpenAi => Ok(format!(
            "{}/chat/completions",
            settings.openai_base_url.trim_end_matches('/')
        )),
        Provider::Azure => {
            let endpoint = settings
                .azure_endpoint
                .as_deref()
                .ok_or_else(|| "AZURE_OPENAI_ENDPOINT is not configured".to_string())?
                .trim_end_matches('/');
            let api_version = options
                .azure_api_version
                .as_deref()
                .unwrap_or(&settings.azure_api_version);
            let use_v1 = options.azure_use_v1.unwrap_or(settings.azure_use_v1);

            if use_v1 {
                return Ok(format!(
                    "{}/openai/v1/chat/completions?api-version={}",
                    endpoint, api_version
                ));
            }

            let deployment = options
                .azure_deployment
                .as_deref()
                .or(settings.azure_deployment.as_deref())
                .ok_or_else(|| "Azure deployment name is not configured".to_string())?;
            Ok(format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint, deployment, api_version
            ))
        }
    }
}

/// Pulls the assistant text out of the first choice. Content may be a plain
/// string or an array of typed segments.
fn extract_content(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(segments)) => segments
            .iter()
            .filter_map(|seg| seg.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn parse_success(status: u16, raw: Value) -> LlmResult {
    let choice = raw
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first());

    let (content, finish_reason) = match choice {
        Some(choice) => {
            let content = choice.get("message").map(extract_content).unwrap_or_default();
            let finish_reason = choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            (content, finish_reason)
        }
        None => (String::new(), None),
    };

    let usage = raw.get("usage").map(|u| Usage {
        prompt_tokens: get_u64_loose(u, "prompt_tokens").unwrap_or(0),
        completion_tokens: get_u64_loose(u, "completion_tokens").unwrap_or(0),
        total_tokens: get_u64_loose(u, "total_tokens").unwrap_or(0),
    });

    LlmResult {
        ok: true,
        status,
        content,
        json: None,
        finish_reason,
        usage,
        error: None,
        raw: Some(raw),
    }
}
