//! services/worker/src/generation/dialogue.rs
//!
//! AI lesson generation from a topic: a complete two-speaker dialogue via
//! schema-constrained output. Unlike the other services this one is
//! all-or-nothing: an invalid dialogue is retried with a stricter prompt,
//! and persistent failure is a terminal error.

use std::sync::Arc;
use tracing::warn;

use lesson_core::domain::{Dialogue, DialogueTurn};
use lesson_core::json::{get_array, string_or_default};
use lesson_core::llm::{ChatMessage, ChatOptions, ResponseFormat};
use lesson_core::ports::ChatCompletionService;

use crate::config::TaskSettings;
use crate::generation::GenerationError;

const MAX_ATTEMPTS: usize = 3;
const MIN_TURNS: usize = 6;
const SCHEMA_MIN_TURNS: usize = 8;
const SCHEMA_MAX_TURNS: usize = 24;

const SYSTEM_PROMPT: &str = "You write dialogues for language learners. Create a natural \
two-speaker conversation about the given topic in the target language, with translations in \
the support language. Speakers alternate; every turn is a complete utterance.";

const STRICTER_REMINDER: &str = "\n\nIMPORTANT: your previous attempt was rejected. The \
dialogue MUST have exactly 2 distinct speakers, every turn's speaker MUST be one of them, and \
no field may be empty. Follow the schema exactly.";

pub struct AiLessonGeneratorService {
    llm: Arc<dyn ChatCompletionService>,
    task: TaskSettings,
}

impl AiLessonGeneratorService {
    pub fn new(llm: Arc<dyn ChatCompletionService>, task: TaskSettings) -> Self {
        Self { llm, task }
    }

    /// Generates a validated dialogue, retrying up to 3 times with an
    /// escalating prompt before giving up.
    pub async fn generate_dialogue(
        &self,
        topic: &str,
        target_language: &str,
        support_language: &str,
    ) -> Result<Dialogue, GenerationError> {
        let base_user = format!(
            "Topic: {}\nTarget language: {}\nSupport language: {}",
            topic, target_language, support_language
        );
        let options = ChatOptions {
            temperature: Some(0.7),
            response_format: Some(ResponseFormat::JsonSchema {
                name: "dialogue".to_string(),
                schema: dialogue_schema(),
            }),
            ..self.task.chat_options()
        };

        let mut last_error = String::from("no attempts made");
        for attempt in 1..=MAX_ATTEMPTS {
            let mut user = base_user.clone();
            if attempt > 1 {
                user.push_str(STRICTER_REMINDER);
            }
            let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)];

            let result = self.llm.chat_json(&messages, &options).await;
            let Some(json) = result.json else {
                last_error = result
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| format!("no JSON in response (status {})", result.status));
                warn!("Dialogue attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, last_error);
                continue;
            };

            match validate_dialogue(&json) {
                Ok(dialogue) => return Ok(dialogue),
                Err(reason) => {
                    warn!(
                        "Dialogue attempt {}/{} rejected: {}",
                        attempt, MAX_ATTEMPTS, reason
                    );
                    last_error = reason;
                }
            }
        }

        Err(GenerationError::Validation(format!(
            "dialogue generation failed after {} attempts: {}",
            MAX_ATTEMPTS, last_error
        )))
    }
}

fn dialogue_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["title", "speakers", "turns"],
        "properties": {
            "title": {"type": "string"},
            "speakers": {
                "type": "array",
                "items": {"type": "string"},
                "minItems": 2,
                "maxItems": 2
            },
            "turns": {
                "type": "array",
                "minItems": SCHEMA_MIN_TURNS,
                "maxItems": SCHEMA_MAX_TURNS,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["speaker", "text", "translation"],
                    "properties": {
                        "speaker": {"type": "string"},
                        "text": {"type": "string"},
                        "translation": {"type": "string"}
                    }
                }
            }
        }
    })
}

/// Checks the semantic constraints the schema cannot express: two distinct
/// speakers, enough turns, every turn attributed and non-empty.
pub(crate) fn validate_dialogue(json: &serde_json::Value) -> Result<Dialogue, String> {
    let title = string_or_default(json, "title");
    if title.is_empty() {
        return Err("missing title".to_string());
    }

    let speakers: Vec<String> = get_array(json, "speakers")
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let mut distinct = speakers.clone();
    distinct.sort();
    distinct.dedup();
    if distinct.len() != 2 {
        return Err(format!("expected exactly 2 distinct speakers, got {}", distinct.len()));
    }

    let raw_turns = get_array(json, "turns").ok_or_else(|| "missing turns".to_string())?;
    if raw_turns.len() < MIN_TURNS {
        return Err(format!("only {} turns, need at least {}", raw_turns.len(), MIN_TURNS));
    }

    let mut turns = Vec::new();
    for (i, raw) in raw_turns.iter().enumerate() {
        let speaker = string_or_default(raw, "speaker");
        let text = string_or_default(raw, "text");
        let translation = string_or_default(raw, "translation");
        if text.is_empty() || translation.is_empty() {
            return Err(format!("turn {} has an empty field", i + 1));
        }
        if !speakers.contains(&speaker) {
            return Err(format!("turn {} speaker '{}' is not in the cast", i + 1, speaker));
        }
        turns.push(DialogueTurn { speaker, text, translation });
    }

    Ok(Dialogue { title, speakers, turns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use lesson_core::llm::LlmResult;

    fn valid_dialogue_json() -> Value {
        let turns: Vec<Value> = (0..8)
            .map(|i| {
                let speaker = if i % 2 == 0 { "Anna" } else { "Ben" };
                json!({"speaker": speaker, "text": format!("Zeile {}", i), "translation": format!("Line {}", i)})
            })
            .collect();
        json!({"title": "Im Café", "speakers": ["Anna", "Ben"], "turns": turns})
    }

    fn one_speaker_json() -> Value {
        let mut v = valid_dialogue_json();
        v["speakers"] = json!(["Anna", "Anna"]);
        v
    }

    struct ScriptedChat {
        responses: Mutex<Vec<Value>>,
        calls: Mutex<usize>,
    }

    impl ScriptedChat {
        fn new(responses: Vec<Value>) -> Self {
            Self { responses: Mutex::new(responses), calls: Mutex::new(0) }
        }
    }

    #[async_trait]
    impl ChatCompletionService for ScriptedChat {
        async fn chat(&self, m: &[ChatMessage], o: &ChatOptions) -> LlmResult {
            self.chat_json(m, o).await
        }

        async fn chat_json(&self, _m: &[ChatMessage], _o: &ChatOptions) -> LlmResult {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            let value = responses.remove(0);
            LlmResult {
                ok: true,
                status: 200,
                content: value.to_string(),
                json: Some(value),
                finish_reason: Some("stop".to_string()),
                usage: None,
                error: None,
                raw: None,
            }
        }
    }

    fn task() -> TaskSettings {
        TaskSettings {
            model: "gpt-4o".to_string(),
            max_output_tokens: 2048,
            timeout: std::time::Duration::from_secs(30),
            connect_timeout: std::time::Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn invalid_response_triggers_retry_then_succeeds() {
        let chat = Arc::new(ScriptedChat::new(vec![one_speaker_json(), valid_dialogue_json()]));
        let service = AiLessonGeneratorService::new(chat.clone(), task());
        let dialogue = service.generate_dialogue("ordering coffee", "de", "en").await.unwrap();
        assert_eq!(dialogue.speakers.len(), 2);
        assert_eq!(*chat.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn three_invalid_responses_are_a_terminal_error() {
        let chat = Arc::new(ScriptedChat::new(vec![
            one_speaker_json(),
            one_speaker_json(),
            one_speaker_json(),
        ]));
        let service = AiLessonGeneratorService::new(chat.clone(), task());
        let result = service.generate_dialogue("ordering coffee", "de", "en").await;
        assert!(matches!(result, Err(GenerationError::Validation(_))));
        assert_eq!(*chat.calls.lock().unwrap(), 3);
    }

    #[test]
    fn too_few_turns_are_rejected() {
        let mut v = valid_dialogue_json();
        v["turns"].as_array_mut().unwrap().truncate(3);
        assert!(validate_dialogue(&v).is_err());
    }

    #[test]
    fn unknown_speaker_is_rejected() {
        let mut v = valid_dialogue_json();
        v["turns"][0]["speaker"] = json!("Clara");
        assert!(validate_dialogue(&v).is_err());
    }

    #[test]
    fn empty_turn_text_is_rejected() {
        let mut v = valid_dialogue_json();
        v["turns"][2]["text"] = json!("");
        assert!(validate_dialogue(&v).is_err());
    }

    #[test]
    fn valid_dialogue_passes() {
        let dialogue = validate_dialogue(&valid_dialogue_json()).unwrap();
        assert_eq!(dialogue.title, "Im Café");
        assert_eq!(dialogue.turns.len(), 8);
    }
}
