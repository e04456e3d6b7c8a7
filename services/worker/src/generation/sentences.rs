//! services/worker/src/generation/sentences.rs
//!
//! Shadowing-sentence generation: short, natural sentences a learner can
//! repeat aloud, produced in one shot from a (possibly sampled) text.

use std::sync::Arc;
use tracing::warn;

use lesson_core::domain::Sentence;
use lesson_core::json::{get_array, string_or_default};
use lesson_core::llm::{ChatMessage, ChatOptions, ResponseFormat};
use lesson_core::ports::ChatCompletionService;

use crate::config::TaskSettings;
use crate::generation::{sample_text, GenerationError};

const SYSTEM_PROMPT: &str = "You are a language-learning assistant preparing sentences for \
shadowing practice. From the text, select or lightly adapt 8 to 14 sentences in the target \
language. Each must be natural spoken language, 5 to 16 words long. Return a JSON object: \
{\"sentences\": [{\"text\": ..., \"translation\": ..., \"source\": \"lesson\"|\"adapted\"}]}. \
\"translation\" is in the support language.";

pub struct LessonSentenceService {
    llm: Arc<dyn ChatCompletionService>,
    task: TaskSettings,
    char_budget: usize,
}

impl LessonSentenceService {
    pub fn new(llm: Arc<dyn ChatCompletionService>, task: TaskSettings, char_budget: usize) -> Self {
        Self { llm, task, char_budget }
    }

    pub async fn generate(
        &self,
        text: &str,
        target_language: &str,
        support_language: &str,
    ) -> Result<Vec<Sentence>, GenerationError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let sampled = sample_text(text, self.char_budget);
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Target language: {}\nSupport language: {}\n\nTEXT:\n{}",
                target_language, support_language, sampled
            )),
        ];
        let options = ChatOptions {
            temperature: Some(0.5),
            response_format: Some(ResponseFormat::JsonObject),
            ..self.task.chat_options()
        };

        let result = self.llm.chat_json(&messages, &options).await;
        if !result.has_json() {
            warn!(
                "Sentence generation produced no usable JSON (status {})",
                result.status
            );
            return Ok(Vec::new());
        }

        Ok(parse_sentences(&result.json.unwrap_or_default()))
    }
}

/// Normalizes the raw `sentences` array: requires non-empty text,
/// deduplicates case-insensitively, defaults `source` to "lesson".
pub(crate) fn parse_sentences(json: &serde_json::Value) -> Vec<Sentence> {
    let Some(items) = get_array(json, "sentences") else {
        return Vec::new();
    };

    let mut seen: Vec<String> = Vec::new();
    let mut sentences = Vec::new();
    for item in items {
        let text = string_or_default(item, "text");
        if text.is_empty() {
            continue;
        }
        let key = text.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);

        let mut source = string_or_default(item, "source");
        if source.is_empty() {
            source = "lesson".to_string();
        }
        sentences.push(Sentence {
            text,
            translation: string_or_default(item, "translation"),
            source,
        });
    }
    sentences
}
