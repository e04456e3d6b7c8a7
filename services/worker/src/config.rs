//! services/worker/src/config.rs
//!
//! Defines the worker's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup into
//! one immutable struct that is passed by `Arc` into each component; no
//! component performs ambient config lookups after startup. The `.env`
//! file is used for local development.

use lesson_core::chunk::ChunkPolicy;
use lesson_core::llm::ChatOptions;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which chat-completion provider the worker talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Azure,
}

/// Provider connection settings shared by every task.
#[derive(Clone, Debug)]
pub struct LlmSettings {
    pub provider: Provider,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub azure_endpoint: Option<String>,
    pub azure_api_key: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: String,
    pub azure_use_v1: bool,
    // Azure AD client-credential flow, used when no static api key is set.
    pub azure_tenant_id: Option<String>,
    pub azure_client_id: Option<String>,
    pub azure_client_secret: Option<String>,
    /// Cache TTL for fetched tokens; kept shorter than the provider's
    /// actual token lifetime so refresh happens before expiry.
    pub token_ttl: Duration,
    /// Connect timeout for the shared HTTP client.
    pub connect_timeout: Duration,
}

/// Per-task model and limit settings.
#[derive(Clone, Debug)]
pub struct TaskSettings {
    pub model: String,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl TaskSettings {
    /// Base `ChatOptions` for this task; callers layer response-format and
    /// temperature on top.
    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            model: Some(self.model.clone()),
            max_output_tokens: Some(self.max_output_tokens),
            timeout: Some(self.timeout),
            connect_timeout: Some(self.connect_timeout),
            ..ChatOptions::default()
        }
    }

    fn from_env(prefix: &str, default_model: &str, default_tokens: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            model: env_string(&format!("{prefix}_MODEL"), default_model),
            max_output_tokens: env_parse(&format!("{prefix}_MAX_OUTPUT_TOKENS"), default_tokens)?,
            timeout: Duration::from_secs(env_parse(&format!("{prefix}_TIMEOUT_SECS"), 120u64)?),
            connect_timeout: Duration::from_secs(env_parse(
                &format!("{prefix}_CONNECT_TIMEOUT_SECS"),
                10u64,
            )?),
        })
    }
}

/// Exercise generation count and balance policy.
#[derive(Clone, Debug)]
pub struct ExerciseSettings {
    pub default_count: usize,
    pub min_count: usize,
    pub max_count: usize,
    pub vocab_ratio: f32,
    pub grammar_ratio: f32,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub log_level: Level,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub retry_backoff: Duration,

    pub llm: LlmSettings,

    pub nlp: TaskSettings,
    pub exercises_task: TaskSettings,
    pub grammar: TaskSettings,
    pub sentences: TaskSettings,
    pub words: TaskSettings,
    pub dialogue: TaskSettings,
    pub translation: TaskSettings,

    /// Chunking policy for the full-text NLP analysis task.
    pub nlp_chunks: ChunkPolicy,
    /// Word count above which the NLP task switches to chunked mode.
    pub chunk_word_threshold: usize,

    pub exercises: ExerciseSettings,
    pub words_char_budget: usize,
    pub sentences_char_budget: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for
    /// development, but this is skipped in test environments to ensure
    /// tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Server and Database Settings ---
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let poll_interval = Duration::from_millis(env_parse("POLL_INTERVAL_MS", 2000u64)?);
        let job_timeout = Duration::from_secs(env_parse("JOB_TIMEOUT_SECS", 600u64)?);
        let retry_backoff = Duration::from_secs(env_parse("RETRY_BACKOFF_SECS", 30u64)?);

        // --- Provider Settings ---
        let provider_str = env_string("LLM_PROVIDER", "openai");
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAi,
            "azure" => Provider::Azure,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not a supported provider", other),
                ))
            }
        };

        let llm = LlmSettings {
            provider,
            openai_base_url: env_string("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            azure_endpoint: std::env::var("AZURE_OPENAI_ENDPOINT").ok(),
            azure_api_key: std::env::var("AZURE_OPENAI_API_KEY").ok(),
            azure_deployment: std::env::var("AZURE_OPENAI_DEPLOYMENT").ok(),
            azure_api_version: env_string("AZURE_OPENAI_API_VERSION", "2024-10-21"),
            azure_use_v1: env_parse("AZURE_USE_V1", false)?,
            azure_tenant_id: std::env::var("AZURE_TENANT_ID").ok(),
            azure_client_id: std::env::var("AZURE_CLIENT_ID").ok(),
            azure_client_secret: std::env::var("AZURE_CLIENT_SECRET").ok(),
            token_ttl: Duration::from_secs(env_parse("LLM_TOKEN_TTL_SECS", 2700u64)?),
            connect_timeout: Duration::from_secs(env_parse("LLM_CONNECT_TIMEOUT_SECS", 10u64)?),
        };

        // --- Per-task Model Settings ---
        let nlp = TaskSettings::from_env("NLP", "gpt-4o", 4096)?;
        let exercises_task = TaskSettings::from_env("EXERCISES", "gpt-4o", 4096)?;
        let grammar = TaskSettings::from_env("GRAMMAR", "gpt-4o", 2048)?;
        let sentences = TaskSettings::from_env("SENTENCES", "gpt-4o-mini", 2048)?;
        let words = TaskSettings::from_env("WORDS", "gpt-4o-mini", 2048)?;
        let dialogue = TaskSettings::from_env("DIALOGUE", "gpt-4o", 4096)?;
        let translation = TaskSettings::from_env("TRANSLATION", "gpt-4o-mini", 2048)?;

        // --- Chunking Policy (NLP full-text analysis) ---
        let nlp_chunks = ChunkPolicy::new(
            env_parse("NLP_CHUNK_TARGET_WORDS", 220usize)?,
            env_parse("NLP_CHUNK_OVERLAP_WORDS", 30usize)?,
            env_parse("NLP_CHUNK_MAX_CHUNKS", 6usize)?,
        )
        .with_time_budget_ms(env_parse("NLP_CHUNK_TIME_BUDGET_MS", 240_000u64)?);
        let chunk_word_threshold = env_parse("NLP_CHUNK_WORD_THRESHOLD", 260usize)?;

        // --- Generation Limits ---
        let exercises = ExerciseSettings {
            default_count: env_parse("EXERCISES_COUNT", 12usize)?,
            min_count: 10,
            max_count: 24,
            vocab_ratio: env_parse("EXERCISES_VOCAB_RATIO", 0.4f32)?,
            grammar_ratio: env_parse("EXERCISES_GRAMMAR_RATIO", 0.4f32)?,
        };
        let words_char_budget = env_parse("WORDS_CHAR_BUDGET", 6000usize)?;
        let sentences_char_budget = env_parse("SENTENCES_CHAR_BUDGET", 6000usize)?;

        Ok(Self {
            database_url,
            log_level,
            poll_interval,
            job_timeout,
            retry_backoff,
            llm,
            nlp,
            exercises_task,
            grammar,
            sentences,
            words,
            dialogue,
            translation,
            nlp_chunks,
            chunk_word_threshold,
            exercises,
            words_char_budget,
            sentences_char_budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_settings_flow_into_chat_options() {
        let task = TaskSettings {
            model: "gpt-4o-mini".to_string(),
            max_output_tokens: 2048,
            timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(3),
        };
        let options = task.chat_options();
        assert_eq!(options.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(options.max_output_tokens, Some(2048));
        assert_eq!(options.timeout, Some(Duration::from_secs(90)));
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(3)));
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}
