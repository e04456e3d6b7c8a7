//! crates/lesson_core/src/llm.rs
//!
//! Value types exchanged with the chat-completion port. Failure is encoded
//! in `LlmResult` rather than in the `Result` channel so callers can treat
//! a provider error and a transport error the same way (skip and log).

use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// Response-format negotiation with the provider.
#[derive(Debug, Clone)]
pub enum ResponseFormat {
    /// `{"type": "json_object"}` — the model must emit a JSON object.
    JsonObject,
    /// Strict-mode JSON schema; the model output must validate against it.
    JsonSchema { name: String, schema: Value },
}

/// Per-request options. Unset fields fall back to the client's task defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<String>,
    pub response_format: Option<ResponseFormat>,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    // Azure-specific overrides.
    pub azure_deployment: Option<String>,
    pub azure_api_version: Option<String>,
    pub azure_use_v1: Option<bool>,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct LlmFailure {
    pub kind: String,
    pub message: String,
}

/// The outcome of one chat-completion call.
///
/// Invariants: if `ok` is false, `json` is `None`; if `json` is `Some`,
/// `ok` is true. `status` is 0 on transport failure (no HTTP exchange).
#[derive(Debug, Clone)]
pub struct LlmResult {
    pub ok: bool,
    pub status: u16,
    pub content: String,
    pub json: Option<Value>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub error: Option<LlmFailure>,
    pub raw: Option<Value>,
}

impl LlmResult {
    /// A transport-level failure: no HTTP response was received.
    pub fn transport_failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: 0,
            content: String::new(),
            json: None,
            finish_reason: None,
            usage: None,
            error: Some(LlmFailure { kind: kind.into(), message: message.into() }),
            raw: None,
        }
    }

    /// A provider-reported failure: non-2xx status with an error body.
    pub fn provider_failure(status: u16, message: impl Into<String>, raw: Option<Value>) -> Self {
        Self {
            ok: false,
            status,
            content: String::new(),
            json: None,
            finish_reason: None,
            usage: None,
            error: Some(LlmFailure { kind: "provider".to_string(), message: message.into() }),
            raw,
        }
    }

    /// True when the call succeeded and produced a decodable JSON object.
    pub fn has_json(&self) -> bool {
        self.ok && self.json.is_some()
    }

    pub fn truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}
