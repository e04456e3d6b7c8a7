//! services/worker/src/generation/mod.rs
//!
//! Task-specific generation services. Each builds its prompt, calls the
//! chat-completion port (directly or through the chunked runner), and
//! normalizes raw model JSON into the strict domain schema. Services never
//! let an LLM failure escape as an error: a failed call surfaces as an
//! empty result, which the job layer reads as "nothing to persist". Only
//! dialogue generation, whose output is all-or-nothing, fails terminally.

pub mod dialogue;
pub mod exercises;
pub mod grammar;
pub mod nlp;
pub mod sentences;
pub mod translation;
pub mod words;

pub use dialogue::AiLessonGeneratorService;
pub use exercises::LessonExerciseService;
pub use grammar::LessonGrammarService;
pub use nlp::LessonNlpService;
pub use sentences::LessonSentenceService;
pub use translation::LessonSentenceTranslationService;
pub use words::FastLessonWordsService;

/// Error type returned by generation services.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("LLM call failed: {0}")]
    Llm(String),
    #[error("Model output failed validation: {0}")]
    Validation(String),
}

/// Head+tail sampling for single-shot prompts: texts over `char_budget`
/// keep roughly the first two thirds and the last third of the budget so
/// the prompt sees both how the text opens and how it ends.
pub(crate) fn sample_text(text: &str, char_budget: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= char_budget || char_budget < 64 {
        return text.to_string();
    }
    let head_len = char_budget * 2 / 3;
    let tail_len = char_budget / 3;
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();
    format!("{}\n[...]\n{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(sample_text("hello world", 100), "hello world");
    }

    #[test]
    fn long_text_keeps_head_and_tail() {
        let text = format!("START{}END", "x".repeat(10_000));
        let sampled = sample_text(&text, 600);
        assert!(sampled.starts_with("START"));
        assert!(sampled.ends_with("END"));
        assert!(sampled.contains("[...]"));
        assert!(sampled.chars().count() < 700);
    }
}
