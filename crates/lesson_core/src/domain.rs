//! crates/lesson_core/src/domain.rs
//!
//! Defines the pure, core data structures for the lesson generation pipeline.
//! These structs are independent of any database or provider wire format.

use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a lesson as driven by the generation jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LessonStatus {
    Draft,
    Processing,
    Ready,
    Failed,
    Generating,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Draft => "draft",
            LessonStatus::Processing => "processing",
            LessonStatus::Ready => "ready",
            LessonStatus::Failed => "failed",
            LessonStatus::Generating => "generating",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(LessonStatus::Draft),
            "processing" => Some(LessonStatus::Processing),
            "ready" => Some(LessonStatus::Ready),
            "failed" => Some(LessonStatus::Failed),
            "generating" => Some(LessonStatus::Generating),
            _ => None,
        }
    }
}

/// A lesson as seen by the generation pipeline.
///
/// `analysis_meta` is a free-form JSON bag merged across generation runs;
/// it caches prior AI output and carries feature flags such as `lesson_pack`.
#[derive(Debug, Clone)]
pub struct Lesson {
    pub id: Uuid,
    pub original_text: String,
    pub target_language: String,
    pub support_language: String,
    pub status: LessonStatus,
    pub analysis_meta: Value,
}

impl Lesson {
    /// Generation jobs must no-op when there is no source material.
    pub fn has_source_text(&self) -> bool {
        !self.original_text.trim().is_empty()
    }
}

/// A normalized vocabulary item produced by generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub term: String,
    pub meaning: String,
    pub example_sentence: String,
    pub translation: String,
}

/// A normalized practice sentence produced by generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    pub text: String,
    pub translation: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GrammarExample {
    pub text: String,
    pub translation: String,
    /// Either "lesson" (taken from the source text) or "extra" (invented).
    pub source: String,
}

/// A normalized grammar point produced by generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GrammarPoint {
    pub key: String,
    pub title: String,
    pub level: String,
    pub description: String,
    pub pattern: String,
    pub examples: Vec<GrammarExample>,
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExerciseOption {
    pub label: String,
    pub text: String,
    pub is_correct: bool,
    pub explanation: String,
}

/// A normalized multiple-choice exercise.
///
/// Invariant after normalization: 3..=4 options, exactly one correct.
#[derive(Debug, Clone, PartialEq)]
pub struct Exercise {
    pub skill: String,
    pub difficulty: String,
    pub question_prompt: String,
    pub instructions: String,
    pub solution_explanation: String,
    pub options: Vec<ExerciseOption>,
}

impl Exercise {
    pub fn correct_count(&self) -> usize {
        self.options.iter().filter(|o| o.is_correct).count()
    }
}

/// The full-pipeline output bundle of the NLP analysis task.
#[derive(Debug, Clone, Default)]
pub struct NlpAnalysis {
    pub sentences: Vec<Sentence>,
    pub words: Vec<Word>,
    pub exercises: Vec<Exercise>,
}

impl NlpAnalysis {
    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty() && self.words.is_empty() && self.exercises.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DialogueTurn {
    pub speaker: String,
    pub text: String,
    pub translation: String,
}

/// A generated two-speaker dialogue lesson.
#[derive(Debug, Clone, PartialEq)]
pub struct Dialogue {
    pub title: String,
    pub speakers: Vec<String>,
    pub turns: Vec<DialogueTurn>,
}

/// Read model for the sentence translation task: a persisted sentence row.
#[derive(Debug, Clone)]
pub struct SentenceRow {
    pub id: Uuid,
    pub text: String,
    pub translation: Option<String>,
}

/// The kind of background generation work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    AnalyzeText,
    GenerateWords,
    GenerateSentences,
    GenerateGrammar,
    GenerateExercises,
    GenerateLesson,
    TranslateSentences,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AnalyzeText => "analyze_text",
            JobKind::GenerateWords => "generate_words",
            JobKind::GenerateSentences => "generate_sentences",
            JobKind::GenerateGrammar => "generate_grammar",
            JobKind::GenerateExercises => "generate_exercises",
            JobKind::GenerateLesson => "generate_lesson",
            JobKind::TranslateSentences => "translate_sentences",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "analyze_text" => Some(JobKind::AnalyzeText),
            "generate_words" => Some(JobKind::GenerateWords),
            "generate_sentences" => Some(JobKind::GenerateSentences),
            "generate_grammar" => Some(JobKind::GenerateGrammar),
            "generate_exercises" => Some(JobKind::GenerateExercises),
            "generate_lesson" => Some(JobKind::GenerateLesson),
            "translate_sentences" => Some(JobKind::TranslateSentences),
            _ => None,
        }
    }

    /// Most generation tasks do not retry: a partial LLM failure is
    /// acceptable degradation, not a transient error. Dialogue generation
    /// gets one extra attempt because its output is all-or-nothing.
    pub fn max_attempts(&self) -> i32 {
        match self {
            JobKind::GenerateLesson => 2,
            _ => 1,
        }
    }
}

/// A claimed unit of background generation work.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub lesson_id: Uuid,
    pub custom_prompt: Option<String>,
    pub replace_existing: bool,
    pub attempts: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_round_trips_through_strings() {
        for kind in [
            JobKind::AnalyzeText,
            JobKind::GenerateWords,
            JobKind::GenerateSentences,
            JobKind::GenerateGrammar,
            JobKind::GenerateExercises,
            JobKind::GenerateLesson,
            JobKind::TranslateSentences,
        ] {
            assert_eq!(JobKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::from_str("reticulate_splines"), None);
    }

    #[test]
    fn only_lesson_generation_gets_a_retry() {
        assert_eq!(JobKind::GenerateLesson.max_attempts(), 2);
        for kind in [
            JobKind::AnalyzeText,
            JobKind::GenerateWords,
            JobKind::GenerateSentences,
            JobKind::GenerateGrammar,
            JobKind::GenerateExercises,
            JobKind::TranslateSentences,
        ] {
            assert_eq!(kind.max_attempts(), 1, "{}", kind.as_str());
        }
    }
}
