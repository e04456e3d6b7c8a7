//! services/worker/src/generation/nlp.rs
//!
//! The full-pipeline analysis task: sentences, vocabulary and exercises in
//! one pass over the whole text. Long texts run chunk by chunk through the
//! shared chunker and prompt runner; per-chunk results are merged in chunk
//! order with vocabulary deduplicated across chunks.

use std::sync::Arc;
use tracing::{info, warn};

use lesson_core::chunk::{plan, ChunkPolicy};
use lesson_core::domain::NlpAnalysis;
use lesson_core::llm::{ChatMessage, ChatOptions, ResponseFormat};
use lesson_core::ports::ChatCompletionService;

use crate::config::TaskSettings;
use crate::generation::exercises::parse_exercises;
use crate::generation::sentences::parse_sentences;
use crate::generation::words::parse_words;
use crate::generation::GenerationError;
use crate::llm::runner::{ChunkOutcome, ChunkedPromptRunner};

const SYSTEM_PROMPT: &str = "You are a language-learning assistant analyzing a text for a \
learner. For the given passage produce, in one JSON object: {\"sentences\": [{\"text\": ..., \
\"translation\": ..., \"source\": \"lesson\"}], \"words\": [{\"term\": ..., \"meaning\": ..., \
\"example_sentence\": ..., \"translation\": ...}], \"exercises\": [{\"type\": \"mcq\", \
\"skill\": ..., \"difficulty\": ..., \"question_prompt\": ..., \"instructions\": ..., \
\"solution_explanation\": ..., \"options\": [{\"label\": ..., \"text\": ..., \
\"is_correct\": ..., \"explanation\": ...}]}]}. Sentences suit shadowing practice, words are \
the most useful vocabulary, exercises are multiple choice with one correct answer. Meanings, \
translations and instructions are in the support language.";

pub struct LessonNlpService {
    llm: Arc<dyn ChatCompletionService>,
    task: TaskSettings,
    policy: ChunkPolicy,
    /// Texts at or below this word count are analyzed in a single call.
    chunk_word_threshold: usize,
}

impl LessonNlpService {
    pub fn new(
        llm: Arc<dyn ChatCompletionService>,
        task: TaskSettings,
        policy: ChunkPolicy,
        chunk_word_threshold: usize,
    ) -> Self {
        Self { llm, task, policy, chunk_word_threshold }
    }

    pub async fn analyze_text(
        &self,
        text: &str,
        target_language: &str,
        support_language: &str,
        custom_prompt: Option<&str>,
    ) -> Result<NlpAnalysis, GenerationError> {
        if text.trim().is_empty() {
            return Ok(NlpAnalysis::default());
        }

        // Short texts still go through the chunker with a single-window
        // policy so both paths share one code path and one prompt.
        let word_count = text.split_whitespace().count();
        let policy = if word_count <= self.chunk_word_threshold {
            ChunkPolicy::new(word_count.max(1), 0, 1)
        } else {
            self.policy
        };
        let chunk_plan = plan(text, &policy);
        info!(
            "NLP analysis: {} words across {} chunk(s)",
            chunk_plan.total_words,
            chunk_plan.len()
        );

        let target = target_language.to_string();
        let support = support_language.to_string();
        let extra = custom_prompt.map(str::to_string);
        let factory = move |chunk: &str, index: usize, total: usize| {
            let mut user = format!(
                "Target language: {}\nSupport language: {}\n",
                target, support
            );
            if total > 1 {
                user.push_str(&format!(
                    "This is part {} of {} of a longer text; analyze only this part.\n",
                    index + 1,
                    total
                ));
            }
            if let Some(extra) = &extra {
                user.push_str(&format!("Additional instructions: {}\n", extra));
            }
            user.push_str(&format!("\nTEXT:\n{}", chunk));
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
        };

        let options = ChatOptions {
            temperature: Some(0.4),
            response_format: Some(ResponseFormat::JsonObject),
            ..self.task.chat_options()
        };

        let runner = ChunkedPromptRunner::new(self.llm.clone());
        let outcomes = runner
            .run_json(&chunk_plan, &factory, &options, policy.time_budget_ms, "nlp")
            .await;

        if outcomes.is_empty() {
            warn!("NLP analysis produced no usable chunks");
            return Ok(NlpAnalysis::default());
        }
        Ok(merge_outcomes(&outcomes))
    }
}

/// Merges per-chunk results in chunk order. Words are deduplicated by term
/// across chunks (case-insensitive, first occurrence wins); sentences and
/// exercises are concatenated.
pub(crate) fn merge_outcomes(outcomes: &[ChunkOutcome]) -> NlpAnalysis {
    let mut analysis = NlpAnalysis::default();
    let mut seen_terms: Vec<String> = Vec::new();

    for outcome in outcomes {
        analysis.sentences.extend(parse_sentences(&outcome.json));
        analysis.exercises.extend(parse_exercises(&outcome.json));
        for word in parse_words(&outcome.json) {
            let key = word.term.to_lowercase();
            if seen_terms.contains(&key) {
                continue;
            }
            seen_terms.push(key);
            analysis.words.push(word);
        }
    }
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn outcome(index: usize, total: usize, json: Value) -> ChunkOutcome {
        ChunkOutcome {
            chunk_index: index,
            chunks_total: total,
            json,
            finish_reason: Some("stop".to_string()),
            usage: None,
        }
    }

    #[test]
    fn merge_dedupes_words_across_chunks() {
        let first = json!({
            "sentences": [{"text": "Der Hund läuft."}],
            "words": [{"term": "Hund", "meaning": "dog"}],
            "exercises": [],
        });
        let second = json!({
            "sentences": [{"text": "Die Katze schläft."}],
            "words": [
                {"term": "HUND", "meaning": "dog again"},
                {"term": "Katze", "meaning": "cat"},
            ],
            "exercises": [],
        });
        let merged = merge_outcomes(&[outcome(0, 2, first), outcome(1, 2, second)]);
        assert_eq!(merged.sentences.len(), 2);
        assert_eq!(merged.words.len(), 2);
        assert_eq!(merged.words[0].term, "Hund");
        assert_eq!(merged.words[0].meaning, "dog");
        assert_eq!(merged.words[1].term, "Katze");
    }

    #[test]
    fn merge_preserves_sentence_chunk_order() {
        let first = json!({"sentences": [{"text": "one"}], "words": [], "exercises": []});
        let second = json!({"sentences": [{"text": "two"}], "words": [], "exercises": []});
        let merged = merge_outcomes(&[outcome(0, 2, first), outcome(1, 2, second)]);
        let texts: Vec<&str> = merged.sentences.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}
