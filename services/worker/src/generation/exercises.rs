//! services/worker/src/generation/exercises.rs
//!
//! MCQ exercise generation. One large prompt embeds a compacted view of the
//! lesson's vocabulary and grammar; normalization then forces the model's
//! loose output into the strict exercise schema, guaranteeing 3-4 options
//! and exactly one correct option per exercise.

use std::sync::Arc;
use tracing::warn;

use lesson_core::domain::{Exercise, ExerciseOption, GrammarPoint, Lesson, Word};
use lesson_core::json::{get_array, get_bool_loose, get_u64_loose, string_or_default};
use lesson_core::llm::{ChatMessage, ChatOptions, ResponseFormat};
use lesson_core::ports::ChatCompletionService;

use crate::config::{ExerciseSettings, TaskSettings};
use crate::generation::GenerationError;

/// At most this many vocabulary terms are embedded in the prompt.
const MAX_PROMPT_WORDS: usize = 18;
/// At most this many grammar points are embedded in the prompt.
const MAX_PROMPT_GRAMMAR: usize = 6;

const OPTION_LABELS: [&str; 4] = ["A", "B", "C", "D"];

const SYSTEM_PROMPT: &str = "You create multiple-choice exercises for language learners. Every \
exercise has type \"mcq\", a skill (\"vocabulary\", \"grammar\" or \"mixed\"), a difficulty \
(\"easy\", \"medium\" or \"hard\"), a question_prompt in the target language, short instructions \
in the support language, a solution_explanation, and 4 options with exactly one correct answer. \
Return a JSON object: {\"exercises\": [{\"type\": \"mcq\", \"skill\": ..., \"difficulty\": ..., \
\"question_prompt\": ..., \"instructions\": ..., \"solution_explanation\": ..., \
\"options\": [{\"label\": \"A\", \"text\": ..., \"is_correct\": true|false, \
\"explanation\": ...}]}]}";

pub struct LessonExerciseService {
    llm: Arc<dyn ChatCompletionService>,
    task: TaskSettings,
    settings: ExerciseSettings,
}

impl LessonExerciseService {
    pub fn new(
        llm: Arc<dyn ChatCompletionService>,
        task: TaskSettings,
        settings: ExerciseSettings,
    ) -> Self {
        Self { llm, task, settings }
    }

    pub async fn generate(
        &self,
        lesson: &Lesson,
        words: &[Word],
        grammar_points: &[GrammarPoint],
        count: usize,
        custom_prompt: Option<&str>,
    ) -> Result<Vec<Exercise>, GenerationError> {
        let count = count.clamp(self.settings.min_count, self.settings.max_count);
        let vocab_target = (count as f32 * self.settings.vocab_ratio).ceil() as usize;
        let grammar_target = (count as f32 * self.settings.grammar_ratio).ceil() as usize;

        let mut user_prompt = format!(
            "Target language: {}\nSupport language: {}\n\nCreate exactly {} exercises: at least \
             {} focused on vocabulary, at least {} focused on grammar, the rest free choice.\n",
            lesson.target_language, lesson.support_language, count, vocab_target, grammar_target
        );
        user_prompt.push_str(&compact_vocabulary(words));
        user_prompt.push_str(&compact_grammar(grammar_points));
        if let Some(extra) = custom_prompt {
            user_prompt.push_str(&format!("\nAdditional instructions: {}\n", extra));
        }

        let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user_prompt)];
        let options = ChatOptions {
            temperature: Some(0.6),
            response_format: Some(ResponseFormat::JsonObject),
            ..self.task.chat_options()
        };

        let result = self.llm.chat_json(&messages, &options).await;
        if !result.has_json() {
            warn!(
                "Exercise generation produced no usable JSON (status {})",
                result.status
            );
            return Ok(Vec::new());
        }

        Ok(parse_exercises(&result.json.unwrap_or_default()))
    }
}

fn compact_vocabulary(words: &[Word]) -> String {
    let mut seen: Vec<String> = Vec::new();
    let mut lines = String::from("\nVOCABULARY:\n");
    for word in words {
        let key = word.term.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        lines.push_str(&format!("- {} = {}\n", word.term, word.meaning));
        if seen.len() >= MAX_PROMPT_WORDS {
            break;
        }
    }
    lines
}

fn compact_grammar(points: &[GrammarPoint]) -> String {
    let mut seen: Vec<String> = Vec::new();
    let mut lines = String::from("\nGRAMMAR POINTS:\n");
    for point in points {
        let key = point.key.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        lines.push_str(&format!("- {}: {}\n", point.title, point.pattern));
        if seen.len() >= MAX_PROMPT_GRAMMAR {
            break;
        }
    }
    lines
}

pub(crate) fn parse_exercises(json: &serde_json::Value) -> Vec<Exercise> {
    get_array(json, "exercises")
        .map(|items| items.iter().filter_map(normalize_exercise).collect())
        .unwrap_or_default()
}

/// Normalizes one raw exercise. Returns `None` (drop) for non-mcq items and
/// items with fewer than 3 usable options. Guarantees the output has 3-4
/// options and exactly one marked correct.
pub(crate) fn normalize_exercise(item: &serde_json::Value) -> Option<Exercise> {
    let kind = string_or_default(item, "type").to_lowercase();
    if !kind.is_empty() && kind != "mcq" {
        return None;
    }

    let question_prompt = string_or_default(item, "question_prompt");
    if question_prompt.is_empty() {
        return None;
    }

    let mut options: Vec<ExerciseOption> = get_array(item, "options")?
        .iter()
        .filter_map(|raw| {
            let text = string_or_default(raw, "text");
            if text.is_empty() {
                return None;
            }
            Some(ExerciseOption {
                label: string_or_default(raw, "label"),
                text,
                is_correct: get_bool_loose(raw, "is_correct"),
                explanation: string_or_default(raw, "explanation"),
            })
        })
        .take(4)
        .collect();

    if options.len() < 3 {
        return None;
    }

    for (i, option) in options.iter_mut().enumerate() {
        if option.label.is_empty() {
            option.label = OPTION_LABELS[i].to_string();
        }
    }

    repair_correct_flags(&mut options, get_u64_loose(item, "correct_option_index"));

    Some(Exercise {
        skill: normalize_skill(&string_or_default(item, "skill")),
        difficulty: normalize_difficulty(&string_or_default(item, "difficulty")),
        question_prompt,
        instructions: string_or_default(item, "instructions"),
        solution_explanation: string_or_default(item, "solution_explanation"),
        options,
    })
}

/// Forces exactly one correct option. When the flags disagree, an explicit
/// `correct_option_index` wins; otherwise the first flagged option wins;
/// with no flag at all, option 0 is chosen.
fn repair_correct_flags(options: &mut [ExerciseOption], correct_index: Option<u64>) {
    let flagged = options.iter().filter(|o| o.is_correct).count();
    if flagged == 1 {
        return;
    }

    let winner = match correct_index {
        Some(i) if (i as usize) < options.len() => i as usize,
        _ => options.iter().position(|o| o.is_correct).unwrap_or(0),
    };
    for (i, option) in options.iter_mut().enumerate() {
        option.is_correct = i == winner;
    }
}

/// Maps the synonym skill labels the model tends to produce.
fn normalize_skill(skill: &str) -> String {
    match skill.to_lowercase().as_str() {
        "vocab" | "vocabulary" => "vocabulary".to_string(),
        "grammer" | "grammar" => "grammar".to_string(),
        "" => "mixed".to_string(),
        other => other.to_string(),
    }
}

fn normalize_difficulty(difficulty: &str) -> String {
    match difficulty.to_lowercase().as_str() {
        "easy" | "medium" | "hard" => difficulty.to_lowercase(),
        _ => "medium".to_string(),
    }
}
