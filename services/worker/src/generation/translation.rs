//! services/worker/src/generation/translation.rs
//!
//! Batch translation of persisted lesson sentences that are still missing
//! a translation. Results map back by index; anything the model gets wrong
//! (bad index, empty text) is simply skipped.

use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use lesson_core::domain::SentenceRow;
use lesson_core::json::{get_array, get_u64_loose, string_or_default};
use lesson_core::llm::{ChatMessage, ChatOptions, ResponseFormat};
use lesson_core::ports::ChatCompletionService;

use crate::config::TaskSettings;
use crate::generation::GenerationError;

const SYSTEM_PROMPT: &str = "You translate sentences for language learners. Translate each \
numbered sentence from the target language into the support language, keeping the tone \
natural. Return a JSON object: {\"translations\": [{\"index\": <number from the list>, \
\"translation\": ...}]}.";

pub struct LessonSentenceTranslationService {
    llm: Arc<dyn ChatCompletionService>,
    task: TaskSettings,
}

impl LessonSentenceTranslationService {
    pub fn new(llm: Arc<dyn ChatCompletionService>, task: TaskSettings) -> Self {
        Self { llm, task }
    }

    /// Translates the rows that lack a translation. Returns `(sentence id,
    /// translation)` pairs ready for the store.
    pub async fn translate(
        &self,
        sentences: &[SentenceRow],
        target_language: &str,
        support_language: &str,
    ) -> Result<Vec<(Uuid, String)>, GenerationError> {
        let pending: Vec<&SentenceRow> = sentences
            .iter()
            .filter(|row| row.translation.as_deref().map_or(true, |t| t.trim().is_empty()))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let listing = pending
            .iter()
            .enumerate()
            .map(|(i, row)| format!("{}. {}", i, row.text))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Target language: {}\nSupport language: {}\n\nSENTENCES:\n{}",
                target_language, support_language, listing
            )),
        ];
        let options = ChatOptions {
            temperature: Some(0.2),
            response_format: Some(ResponseFormat::JsonObject),
            ..self.task.chat_options()
        };

        let result = self.llm.chat_json(&messages, &options).await;
        if !result.has_json() {
            warn!(
                "Sentence translation produced no usable JSON (status {})",
                result.status
            );
            return Ok(Vec::new());
        }

        Ok(apply_translations(&pending, &result.json.unwrap_or_default()))
    }
}

/// Maps the model's indexed translations back onto the pending rows.
pub(crate) fn apply_translations(
    pending: &[&SentenceRow],
    json: &serde_json::Value,
) -> Vec<(Uuid, String)> {
    let Some(items) = get_array(json, "translations") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for item in items {
        let Some(index) = get_u64_loose(item, "index") else {
            continue;
        };
        let Some(row) = pending.get(index as usize) else {
            continue;
        };
        let translation = string_or_default(item, "translation");
        if translation.is_empty() {
            continue;
        }
        out.push((row.id, translation));
    }
    out
}
