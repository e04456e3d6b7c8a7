//! services/worker/src/generation/grammar.rs
//!
//! Grammar point generation: one or two well-formed grammar points per
//! lesson, each with a pattern and examples from both the lesson text and
//! outside it. Points failing the completeness checks are dropped.

use std::sync::Arc;
use tracing::warn;

use lesson_core::domain::{GrammarExample, GrammarPoint, Lesson};
use lesson_core::json::{get_array, string_or_default};
use lesson_core::llm::{ChatMessage, ChatOptions, ResponseFormat};
use lesson_core::ports::ChatCompletionService;

use crate::config::TaskSettings;
use crate::generation::{sample_text, GenerationError};

/// Hard cap on grammar points kept per run.
const MAX_POINTS: usize = 2;
const TEXT_CHAR_BUDGET: usize = 6000;

const SYSTEM_PROMPT: &str = "You are a grammar teacher. Identify the 1 or 2 most instructive \
grammar points a learner should study in this text. Return a JSON object: {\"grammar_points\": \
[{\"id\": ..., \"title\": ..., \"level\": \"A1\"-\"C2\", \"description\": ..., \"pattern\": ..., \
\"examples\": [{\"text\": ..., \"translation\": ..., \"source\": \"lesson\"|\"extra\"}]}]}. Each \
point needs at least two examples: one quoted from the lesson text (source \"lesson\") and one \
you invent (source \"extra\"). \"description\" is in the support language.";

pub struct LessonGrammarService {
    llm: Arc<dyn ChatCompletionService>,
    task: TaskSettings,
}

impl LessonGrammarService {
    pub fn new(llm: Arc<dyn ChatCompletionService>, task: TaskSettings) -> Self {
        Self { llm, task }
    }

    pub async fn generate(
        &self,
        lesson: &Lesson,
        custom_prompt: Option<&str>,
    ) -> Result<Vec<GrammarPoint>, GenerationError> {
        if !lesson.has_source_text() {
            return Ok(Vec::new());
        }

        let mut user_prompt = format!(
            "Target language: {}\nSupport language: {}\n\nTEXT:\n{}",
            lesson.target_language,
            lesson.support_language,
            sample_text(&lesson.original_text, TEXT_CHAR_BUDGET)
        );
        if let Some(extra) = custom_prompt {
            user_prompt.push_str(&format!("\n\nAdditional instructions: {}", extra));
        }

        let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user_prompt)];
        let options = ChatOptions {
            temperature: Some(0.4),
            response_format: Some(ResponseFormat::JsonObject),
            ..self.task.chat_options()
        };

        let result = self.llm.chat_json(&messages, &options).await;
        if !result.has_json() {
            warn!(
                "Grammar generation produced no usable JSON (status {})",
                result.status
            );
            return Ok(Vec::new());
        }

        Ok(parse_grammar_points(&result.json.unwrap_or_default()))
    }
}

pub(crate) fn parse_grammar_points(json: &serde_json::Value) -> Vec<GrammarPoint> {
    get_array(json, "grammar_points")
        .map(|items| {
            items
                .iter()
                .filter_map(normalize_grammar_point)
                .take(MAX_POINTS)
                .collect()
        })
        .unwrap_or_default()
}

/// A point must carry a non-empty id, title, description and pattern, plus
/// at least two examples covering both the lesson and an invented one.
fn normalize_grammar_point(item: &serde_json::Value) -> Option<GrammarPoint> {
    let key = string_or_default(item, "id");
    let title = string_or_default(item, "title");
    let description = string_or_default(item, "description");
    let pattern = string_or_default(item, "pattern");
    if key.is_empty() || title.is_empty() || description.is_empty() || pattern.is_empty() {
        return None;
    }

    let examples: Vec<GrammarExample> = get_array(item, "examples")?
        .iter()
        .filter_map(|raw| {
            let text = string_or_default(raw, "text");
            if text.is_empty() {
                return None;
            }
            Some(GrammarExample {
                text,
                translation: string_or_default(raw, "translation"),
                source: string_or_default(raw, "source"),
            })
        })
        .collect();

    let has_lesson_example = examples.iter().any(|e| e.source == "lesson");
    let has_extra_example = examples.iter().any(|e| e.source == "extra");
    if examples.len() < 2 || !has_lesson_example || !has_extra_example {
        return None;
    }

    Some(GrammarPoint {
        key,
        title,
        level: string_or_default(item, "level"),
        description,
        pattern,
        examples,
        meta: item.get("meta").cloned().unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn point(id: &str, examples: Value) -> Value {
        json!({
            "id": id,
            "title": "Dative case",
            "level": "A2",
            "description": "Used for indirect objects.",
            "pattern": "geben + DAT",
            "examples": examples,
        })
    }

    fn examples_pair() -> Value {
        json!([
            {"text": "Ich gebe dem Mann das Buch.", "translation": "...", "source": "lesson"},
            {"text": "Sie hilft dem Kind.", "translation": "...", "source": "extra"},
        ])
    }

    #[test]
    fn complete_point_is_kept() {
        let json = json!({"grammar_points": [point("dative", examples_pair())]});
        let points = parse_grammar_points(&json);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].key, "dative");
        assert_eq!(points[0].examples.len(), 2);
    }

    #[test]
    fn point_missing_pattern_is_dropped() {
        let mut raw = point("dative", examples_pair());
        raw["pattern"] = json!("");
        let json = json!({"grammar_points": [raw]});
        assert!(parse_grammar_points(&json).is_empty());
    }

    #[test]
    fn point_missing_an_extra_example_is_dropped() {
        let examples = json!([
            {"text": "Ich gebe dem Mann das Buch.", "source": "lesson"},
            {"text": "Er dankt der Frau.", "source": "lesson"},
        ]);
        let json = json!({"grammar_points": [point("dative", examples)]});
        assert!(parse_grammar_points(&json).is_empty());
    }

    #[test]
    fn list_is_capped_at_two_points() {
        let json = json!({"grammar_points": [
            point("p1", examples_pair()),
            point("p2", examples_pair()),
            point("p3", examples_pair()),
        ]});
        assert_eq!(parse_grammar_points(&json).len(), 2);
    }
}
