//! services/worker/src/generation/words.rs
//!
//! Fast vocabulary extraction: a single-shot prompt over a (possibly
//! sampled) text that yields deduplicated Word items.

use std::sync::Arc;
use tracing::warn;

use lesson_core::domain::Word;
use lesson_core::json::{get_array, string_or_default};
use lesson_core::llm::{ChatMessage, ChatOptions, ResponseFormat};
use lesson_core::ports::ChatCompletionService;

use crate::config::TaskSettings;
use crate::generation::{sample_text, GenerationError};

const SYSTEM_PROMPT: &str = "You are a language-learning assistant. Extract the most useful \
vocabulary from the text for a learner of the target language. Return a JSON object: \
{\"words\": [{\"term\": ..., \"meaning\": ..., \"example_sentence\": ..., \"translation\": ...}]}. \
\"meaning\" and \"translation\" are in the support language; \"example_sentence\" is a short \
natural sentence in the target language using the term. Pick 12 to 20 items, prefer words a \
learner would actually study, skip names and numbers.";

pub struct FastLessonWordsService {
    llm: Arc<dyn ChatCompletionService>,
    task: TaskSettings,
    char_budget: usize,
}

impl FastLessonWordsService {
    pub fn new(llm: Arc<dyn ChatCompletionService>, task: TaskSettings, char_budget: usize) -> Self {
        Self { llm, task, char_budget }
    }

    pub async fn generate(
        &self,
        text: &str,
        target_language: &str,
        support_language: &str,
    ) -> Result<Vec<Word>, GenerationError> {
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
            temperature: Some(0.4),
            response_format: Some(ResponseFormat::JsonObject),
            ..self.task.chat_options()
        };

        let result = self.llm.chat_json(&messages, &options).await;
        if !result.has_json() {
            warn!(
                "Word generation produced no usable JSON (status {})",
                result.status
            );
            return Ok(Vec::new());
        }

        Ok(parse_words(&result.json.unwrap_or_default()))
    }
}

/// Normalizes the raw `words` array: requires a non-empty term and meaning,
/// deduplicates case-insensitively by term (first occurrence wins).
pub(crate) fn parse_words(json: &serde_json::Value) -> Vec<Word> {
    let Some(items) = get_array(json, "words") else {
        return Vec::new();
    };

    let mut seen: Vec<String> = Vec::new();
    let mut words = Vec::new();
    for item in items {
        let term = string_or_default(item, "term");
        let meaning = string_or_default(item, "meaning");
        if term.is_empty() || meaning.is_empty() {
            continue;
        }
        let key = term.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        words.push(Word {
            term,
            meaning,
            example_sentence: string_or_default(item, "example_sentence"),
            translation: string_or_default(item, "translation"),
        });
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn words_are_deduped_case_insensitively() {
        let json = json!({"words": [
            {"term": "the cat", "meaning": "die Katze"},
            {"term": "THE CAT", "meaning": "die Katze (dup)"},
            {"term": "run", "meaning": "laufen"},
        ]});
        let words = parse_words(&json);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].term, "the cat");
        assert_eq!(words[0].meaning, "die Katze");
        assert_eq!(words[1].term, "run");
    }

    #[test]
    fn items_missing_term_or_meaning_are_dropped() {
        let json = json!({"words": [
            {"term": "", "meaning": "x"},
            {"term": "ok", "meaning": ""},
            {"term": "good", "meaning": "gut", "example_sentence": "Das ist gut.", "translation": "good"},
        ]});
        let words = parse_words(&json);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].example_sentence, "Das ist gut.");
    }

    #[test]
    fn missing_words_array_yields_nothing() {
        assert!(parse_words(&json!({"items": []})).is_empty());
        assert!(parse_words(&json!({"words": "not an array"})).is_empty());
    }
}
