//! crates/lesson_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the generation pipeline.
//! These traits form the boundary of the hexagonal architecture, allowing
//! the core to be independent of the LLM provider and the database.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    Exercise, GenerationJob, GrammarPoint, JobKind, Lesson, LessonStatus, NlpAnalysis, Sentence,
    SentenceRow, Word,
};
use crate::llm::{ChatMessage, ChatOptions, LlmResult};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Provider-agnostic chat completion.
///
/// Deliberately infallible at the signature level: transport and provider
/// failures are encoded in the returned `LlmResult` so callers handle both
/// the same way.
#[async_trait]
pub trait ChatCompletionService: Send + Sync {
    /// Sends a chat completion request and extracts the assistant text.
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> LlmResult;

    /// Like `chat`, but additionally attempts loose JSON-object extraction
    /// from the assistant text.
    async fn chat_json(&self, messages: &[ChatMessage], options: &ChatOptions) -> LlmResult;
}

/// Persistence for lessons and their generated child collections.
///
/// Every `store_*` operation that replaces prior output must wrap
/// delete+insert in a single transaction: readers observe either the old
/// complete set or the new one, never an empty window in between.
#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn get_lesson(&self, lesson_id: Uuid) -> PortResult<Lesson>;

    async fn update_lesson_status(&self, lesson_id: Uuid, status: LessonStatus) -> PortResult<()>;

    /// Shallow-merges `patch` (a JSON object) into the lesson's
    /// `analysis_meta`, overwriting colliding top-level keys.
    async fn merge_analysis_meta(&self, lesson_id: Uuid, patch: Value) -> PortResult<()>;

    async fn words_for_lesson(&self, lesson_id: Uuid) -> PortResult<Vec<Word>>;

    async fn grammar_points_for_lesson(&self, lesson_id: Uuid) -> PortResult<Vec<GrammarPoint>>;

    async fn sentence_rows_for_lesson(&self, lesson_id: Uuid) -> PortResult<Vec<SentenceRow>>;

    async fn store_words(
        &self,
        lesson_id: Uuid,
        words: &[Word],
        replace_existing: bool,
    ) -> PortResult<()>;

    async fn store_sentences(
        &self,
        lesson_id: Uuid,
        sentences: &[Sentence],
        replace_existing: bool,
    ) -> PortResult<()>;

    async fn store_grammar_points(
        &self,
        lesson_id: Uuid,
        points: &[GrammarPoint],
        replace_existing: bool,
    ) -> PortResult<()>;

    async fn store_exercises(
        &self,
        lesson_id: Uuid,
        exercises: &[Exercise],
        replace_existing: bool,
    ) -> PortResult<()>;

    /// Persists a full NLP analysis (sentences + words + exercises) and the
    /// terminal `ready` status in one transaction.
    async fn store_analysis(
        &self,
        lesson_id: Uuid,
        analysis: &NlpAnalysis,
        replace_existing: bool,
    ) -> PortResult<()>;

    async fn update_sentence_translations(
        &self,
        lesson_id: Uuid,
        translations: &[(Uuid, String)],
    ) -> PortResult<()>;
}

/// The asynchronous job queue fronting each generation task.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        kind: JobKind,
        lesson_id: Uuid,
        custom_prompt: Option<String>,
        replace_existing: bool,
    ) -> PortResult<Uuid>;

    /// Claims the next runnable job, if any. Claiming must be safe under
    /// concurrent workers.
    async fn claim_next(&self) -> PortResult<Option<GenerationJob>>;

    async fn complete(&self, job_id: Uuid) -> PortResult<()>;

    /// Records a failure. With `retry` the job becomes runnable again after
    /// a fixed backoff, until its attempt budget is exhausted.
    async fn fail(&self, job_id: Uuid, error: &str, retry: bool) -> PortResult<()>;
}
