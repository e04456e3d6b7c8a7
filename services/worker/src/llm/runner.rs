//! services/worker/src/llm/runner.rs
//!
//! Drives a chunk plan through the chat-completion port sequentially,
//! enforcing a wall-clock budget across chunks and repairing truncated
//! JSON responses. Individual chunk failures are tolerated: the aggregate
//! keeps whatever chunks produced usable JSON, in input order.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use lesson_core::chunk::ChunkPlan;
use lesson_core::llm::{ChatMessage, ChatOptions, LlmResult, ResponseFormat, Usage};
use lesson_core::ports::ChatCompletionService;

/// Raw responses longer than this are excerpted (head + tail) before being
/// sent back for repair, to keep the repair prompt itself within budget.
const REPAIR_EXCERPT_LIMIT: usize = 12_000;
const REPAIR_HEAD_CHARS: usize = 9_000;
const REPAIR_TAIL_CHARS: usize = 3_000;
const REPAIR_MIN_TOKENS: u32 = 512;

const REPAIR_SYSTEM_PROMPT: &str = "You repair truncated JSON. You receive a partial JSON object \
that was cut off mid-generation. Return the same object as valid JSON, preserving every complete \
item and dropping any incomplete trailing item. Output only the JSON object, nothing else.";

/// Per-chunk structured result, in input chunk order.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub chunks_total: usize,
    pub json: serde_json::Value,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// Builds the task-specific messages for one chunk. Receives the chunk
/// text, the zero-based chunk index and the total chunk count; callers
/// that don't need position simply ignore the extra arguments.
pub type MessagesFactory<'a> = dyn Fn(&str, usize, usize) -> Vec<ChatMessage> + Send + Sync + 'a;

pub struct ChunkedPromptRunner {
    llm: Arc<dyn ChatCompletionService>,
}

impl ChunkedPromptRunner {
    pub fn new(llm: Arc<dyn ChatCompletionService>) -> Self {
        Self { llm }
    }

    /// Runs every chunk of `plan` through the LLM, returning the outcomes
    /// of chunks that produced a decodable JSON object. Stops early when
    /// the optional wall-clock budget is exhausted; partial results are a
    /// normal outcome, not an error.
    pub async fn run_json(
        &self,
        plan: &ChunkPlan,
        factory: &MessagesFactory<'_>,
        options: &ChatOptions,
        time_budget_ms: Option<u64>,
        log_context: &str,
    ) -> Vec<ChunkOutcome> {
        if plan.is_empty() {
            info!("{}: empty chunk plan, nothing to run", log_context);
            return Vec::new();
        }

        let total = plan.len();
        let budget = time_budget_ms.map(Duration::from_millis);
        let started = Instant::now();
        let mut outcomes = Vec::new();

        for (index, chunk) in plan.chunks.iter().enumerate() {
            if let Some(budget) = budget {
                if started.elapsed() >= budget {
                    warn!(
                        "{}: time budget exhausted after {} of {} chunks, returning partial results",
                        log_context,
                        index,
                        total
                    );
                    break;
                }
            }

            let messages = factory(chunk, index, total);
            let mut result = self.llm.chat_json(&messages, options).await;

            if result.ok && result.truncated() && result.json.is_none() {
                info!("{}: chunk {} truncated, attempting JSON repair", log_context, index + 1);
                if let Some(repaired) = self.repair(&result, options).await {
                    result = repaired;
                }
            }

            match (result.ok, result.json) {
                (true, Some(json)) => {
                    info!("{}: chunk {}/{} completed", log_context, index + 1, total);
                    outcomes.push(ChunkOutcome {
                        chunk_index: index,
                        chunks_total: total,
                        json,
                        finish_reason: result.finish_reason,
                        usage: result.usage,
                    });
                }
                _ => {
                    let reason = result
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "no decodable JSON".to_string());
                    warn!(
                        "{}: dropping chunk {}/{} (status {}): {}",
                        log_context,
                        index + 1,
                        total,
                        result.status,
                        reason
                    );
                }
            }
        }

        outcomes
    }

    /// Asks the model to fix its own truncated output. Runs at temperature
    /// zero with a reduced token budget; on success the repaired result
    /// replaces the original chunk result.
    async fn repair(&self, original: &LlmResult, options: &ChatOptions) -> Option<LlmResult> {
        let excerpt = excerpt_for_repair(&original.content);
        let messages = vec![
            ChatMessage::system(REPAIR_SYSTEM_PROMPT),
            ChatMessage::user(format!("Partial JSON to repair:\n{}", excerpt)),
        ];

        let repair_options = ChatOptions {
            temperature: Some(0.0),
            max_output_tokens: options
                .max_output_tokens
                .map(|t| (t / 2).max(REPAIR_MIN_TOKENS)),
            response_format: Some(ResponseFormat::JsonObject),
            ..options.clone()
        };

        let repaired = self.llm.chat_json(&messages, &repair_options).await;
        if repaired.has_json() {
            Some(repaired)
        } else {
            warn!("JSON repair attempt failed (status {})", repaired.status);
            None
        }
    }
}

fn excerpt_for_repair(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= REPAIR_EXCERPT_LIMIT {
        return content.to_string();
    }
    let head: String = chars[..REPAIR_HEAD_CHARS].iter().collect();
    let tail: String = chars[chars.len() - REPAIR_TAIL_CHARS..].iter().collect();
    format!("{}\n...[truncated]...\n{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lesson_core::chunk::{plan, ChunkPolicy};
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted chat service: pops one canned response per call, optionally
    /// sleeping first to simulate provider latency.
    struct ScriptedChat {
        responses: Mutex<Vec<LlmResult>>,
        delay: Option<Duration>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedChat {
        fn new(responses: Vec<LlmResult>) -> Self {
            Self { responses: Mutex::new(responses), delay: None, calls: Mutex::new(Vec::new()) }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatCompletionService for ScriptedChat {
        async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> LlmResult {
            self.chat_json(messages, options).await
        }

        async fn chat_json(&self, messages: &[ChatMessage], _options: &ChatOptions) -> LlmResult {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push(messages.to_vec());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                LlmResult::transport_failure("script", "script exhausted")
            } else {
                responses.remove(0)
            }
        }
    }

    fn ok_json(value: serde_json::Value) -> LlmResult {
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

    fn truncated_no_json(content: &str) -> LlmResult {
        LlmResult {
            ok: true,
            status: 200,
            content: content.to_string(),
            json: None,
            finish_reason: Some("length".to_string()),
            usage: None,
            error: None,
            raw: None,
        }
    }

    fn three_chunk_plan() -> ChunkPlan {
        let text = (0..20)
            .map(|i| format!("Sentence number {} has exactly six words.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let plan = plan(&text, &ChunkPolicy::new(50, 10, 3));
        assert_eq!(plan.len(), 3);
        plan
    }

    fn factory(chunk: &str, index: usize, total: usize) -> Vec<ChatMessage> {
        vec![ChatMessage::user(format!("[{}/{}] {}", index + 1, total, chunk))]
    }

    #[tokio::test]
    async fn empty_plan_yields_empty_results() {
        let chat = Arc::new(ScriptedChat::new(vec![]));
        let runner = ChunkedPromptRunner::new(chat.clone());
        let empty = plan("", &ChunkPolicy::new(50, 10, 3));
        let outcomes = runner
            .run_json(&empty, &factory, &ChatOptions::default(), None, "test")
            .await;
        assert!(outcomes.is_empty());
        assert_eq!(chat.call_count(), 0);
    }

    #[tokio::test]
    async fn outcomes_preserve_chunk_order() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ok_json(json!({"n": 0})),
            ok_json(json!({"n": 1})),
            ok_json(json!({"n": 2})),
        ]));
        let runner = ChunkedPromptRunner::new(chat);
        let outcomes = runner
            .run_json(&three_chunk_plan(), &factory, &ChatOptions::default(), None, "test")
            .await;
        let indices: Vec<usize> = outcomes.iter().map(|o| o.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(outcomes.iter().all(|o| o.chunks_total == 3));
    }

    #[tokio::test]
    async fn failed_chunk_is_skipped_without_aborting() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ok_json(json!({"n": 0})),
            LlmResult::provider_failure(500, "upstream blew up", None),
            ok_json(json!({"n": 2})),
        ]));
        let runner = ChunkedPromptRunner::new(chat);
        let outcomes = runner
            .run_json(&three_chunk_plan(), &factory, &ChatOptions::default(), None, "test")
            .await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].chunk_index, 0);
        assert_eq!(outcomes[1].chunk_index, 2);
    }

    #[tokio::test]
    async fn time_budget_truncates_the_run() {
        let chat = Arc::new(
            ScriptedChat::new(vec![
                ok_json(json!({"n": 0})),
                ok_json(json!({"n": 1})),
                ok_json(json!({"n": 2})),
            ])
            .with_delay(Duration::from_millis(30)),
        );
        let runner = ChunkedPromptRunner::new(chat.clone());
        let outcomes = runner
            .run_json(&three_chunk_plan(), &factory, &ChatOptions::default(), Some(50), "test")
            .await;
        // Each chunk takes ~30ms against a 50ms budget: the third chunk
        // must not start.
        assert!(outcomes.len() < 3);
        assert!(!outcomes.is_empty());
        assert_eq!(chat.call_count(), outcomes.len());
    }

    #[tokio::test]
    async fn truncated_chunk_is_repaired() {
        let repaired = json!({"items": [1, 2]});
        let chat = Arc::new(ScriptedChat::new(vec![
            truncated_no_json(r#"{"items": [1, 2"#),
            ok_json(repaired.clone()),
        ]));
        let runner = ChunkedPromptRunner::new(chat.clone());
        let single = plan("only one short sentence here.", &ChunkPolicy::new(50, 10, 3));
        let outcomes = runner
            .run_json(&single, &factory, &ChatOptions::default(), None, "test")
            .await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].json, repaired);
        // Second call is the repair pass carrying the partial content.
        assert_eq!(chat.call_count(), 2);
        let calls = chat.calls.lock().unwrap();
        assert!(calls[1].iter().any(|m| m.content.contains(r#"{"items": [1, 2"#)));
    }

    #[tokio::test]
    async fn failed_repair_drops_the_chunk() {
        let chat = Arc::new(ScriptedChat::new(vec![
            truncated_no_json(r#"{"items": ["#),
            LlmResult::transport_failure("timeout", "repair timed out"),
        ]));
        let runner = ChunkedPromptRunner::new(chat);
        let single = plan("only one short sentence here.", &ChunkPolicy::new(50, 10, 3));
        let outcomes = runner
            .run_json(&single, &factory, &ChatOptions::default(), None, "test")
            .await;
        assert!(outcomes.is_empty());
    }

    #[test]
    fn long_content_is_excerpted_head_and_tail() {
        let content = "x".repeat(20_000);
        let excerpt = excerpt_for_repair(&content);
        assert!(excerpt.len() < content.len());
        assert!(excerpt.contains("...[truncated]..."));

        let short = r#"{"a": 1"#;
        assert_eq!(excerpt_for_repair(short), short);
    }
}
