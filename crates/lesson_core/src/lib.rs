pub mod chunk;
pub mod domain;
pub mod json;
pub mod llm;
pub mod ports;

pub use chunk::{ChunkPlan, ChunkPolicy};
pub use domain::{
    Dialogue, DialogueTurn, Exercise, ExerciseOption, GenerationJob, GrammarExample, GrammarPoint,
    JobKind, Lesson, LessonStatus, NlpAnalysis, Sentence, SentenceRow, Word,
};
pub use llm::{ChatMessage, ChatOptions, LlmResult, ResponseFormat, Role, Usage};
pub use ports::{ChatCompletionService, JobQueue, LessonStore, PortError, PortResult};
