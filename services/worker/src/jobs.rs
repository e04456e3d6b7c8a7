//! services/worker/src/jobs.rs
//!
//! One handler per job kind. Each handler loads the lesson, invokes the
//! matching generation service and persists the result through the store.
//!
//! Handlers are fail-closed: a service returning an empty list means the
//! run produced nothing usable, so existing child rows are left untouched
//! rather than wiped. Only the dialogue task treats failure as terminal.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use lesson_core::domain::{Dialogue, GenerationJob, JobKind, Lesson, LessonStatus};
use lesson_core::json::string_or_default;
use lesson_core::ports::{ChatCompletionService, LessonStore};

use crate::config::Config;
use crate::error::WorkerError;
use crate::generation::{
    AiLessonGeneratorService, FastLessonWordsService, GenerationError, LessonExerciseService,
    LessonGrammarService, LessonNlpService, LessonSentenceService,
    LessonSentenceTranslationService,
};

/// Errors stored into `analysis_meta` are capped at this many characters.
const ERROR_META_LIMIT: usize = 500;

/// Dispatches claimed jobs to the generation services.
pub struct JobRunner {
    store: Arc<dyn LessonStore>,
    exercise_count: usize,
    nlp: LessonNlpService,
    words: FastLessonWordsService,
    sentences: LessonSentenceService,
    grammar: LessonGrammarService,
    exercises: LessonExerciseService,
    dialogue: AiLessonGeneratorService,
    translation: LessonSentenceTranslationService,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn LessonStore>,
        llm: Arc<dyn ChatCompletionService>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            exercise_count: config.exercises.default_count,
            nlp: LessonNlpService::new(
                llm.clone(),
                config.nlp.clone(),
                config.nlp_chunks,
                config.chunk_word_threshold,
            ),
            words: FastLessonWordsService::new(
                llm.clone(),
                config.words.clone(),
                config.words_char_budget,
            ),
            sentences: LessonSentenceService::new(
                llm.clone(),
                config.sentences.clone(),
                config.sentences_char_budget,
            ),
            grammar: LessonGrammarService::new(llm.clone(), config.grammar.clone()),
            exercises: LessonExerciseService::new(
                llm.clone(),
                config.exercises_task.clone(),
                config.exercises.clone(),
            ),
            dialogue: AiLessonGeneratorService::new(llm.clone(), config.dialogue.clone()),
            translation: LessonSentenceTranslationService::new(llm, config.translation.clone()),
        }
    }

    /// Runs one claimed job to completion. `Err` means the attempt failed
    /// and the queue should decide between retry and terminal failure.
    pub async fn run(&self, job: &GenerationJob) -> Result<(), WorkerError> {
        let lesson = self.store.get_lesson(job.lesson_id).await?;
        info!(
            job_id = %job.id,
            kind = job.kind.as_str(),
            lesson_id = %lesson.id,
            attempt = job.attempts,
            "Running generation job"
        );

        match job.kind {
            JobKind::AnalyzeText => self.run_analyze_text(&lesson, job).await,
            JobKind::GenerateWords => self.run_generate_words(&lesson, job).await,
            JobKind::GenerateSentences => self.run_generate_sentences(&lesson, job).await,
            JobKind::GenerateGrammar => self.run_generate_grammar(&lesson, job).await,
            JobKind::GenerateExercises => self.run_generate_exercises(&lesson, job).await,
            JobKind::GenerateLesson => self.run_generate_lesson(&lesson, job).await,
            JobKind::TranslateSentences => self.run_translate_sentences(&lesson, job).await,
        }
    }

    async fn run_analyze_text(
        &self,
        lesson: &Lesson,
        job: &GenerationJob,
    ) -> Result<(), WorkerError> {
        if !lesson.has_source_text() {
            warn!(lesson_id = %lesson.id, "Skipping analysis: lesson has no source text");
            return Ok(());
        }

        self.store
            .update_lesson_status(lesson.id, LessonStatus::Processing)
            .await?;

        let analysis = match self
            .nlp
            .analyze_text(
                &lesson.original_text,
                &lesson.target_language,
                &lesson.support_language,
                job.custom_prompt.as_deref(),
            )
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                self.store
                    .update_lesson_status(lesson.id, LessonStatus::Failed)
                    .await?;
                return Err(WorkerError::Internal(e.to_string()));
            }
        };

        if analysis.is_empty() {
            warn!(lesson_id = %lesson.id, "Analysis produced nothing; existing rows kept");
            self.store
                .update_lesson_status(lesson.id, LessonStatus::Failed)
                .await?;
            return Err(WorkerError::Internal("analysis produced no items".to_string()));
        }

        // store_analysis persists the items and the ready status in one
        // transaction.
        self.store
            .store_analysis(lesson.id, &analysis, job.replace_existing)
            .await?;
        info!(
            lesson_id = %lesson.id,
            sentences = analysis.sentences.len(),
            words = analysis.words.len(),
            exercises = analysis.exercises.len(),
            "Analysis stored"
        );
        Ok(())
    }

    async fn run_generate_words(
        &self,
        lesson: &Lesson,
        job: &GenerationJob,
    ) -> Result<(), WorkerError> {
        if !lesson.has_source_text() {
            warn!(lesson_id = %lesson.id, "Skipping word generation: lesson has no source text");
            return Ok(());
        }
        let words = self
            .words
            .generate(
                &lesson.original_text,
                &lesson.target_language,
                &lesson.support_language,
            )
            .await
            .map_err(|e| WorkerError::Internal(e.to_string()))?;
        if words.is_empty() {
            warn!(lesson_id = %lesson.id, "Word generation produced nothing; existing rows kept");
            return Ok(());
        }
        self.store
            .store_words(lesson.id, &words, job.replace_existing)
            .await?;
        info!(lesson_id = %lesson.id, count = words.len(), "Words stored");
        Ok(())
    }

    async fn run_generate_sentences(
        &self,
        lesson: &Lesson,
        job: &GenerationJob,
    ) -> Result<(), WorkerError> {
        if !lesson.has_source_text() {
            warn!(lesson_id = %lesson.id, "Skipping sentence generation: lesson has no source text");
            return Ok(());
        }
        let sentences = self
            .sentences
            .generate(
                &lesson.original_text,
                &lesson.target_language,
                &lesson.support_language,
            )
            .await
            .map_err(|e| WorkerError::Internal(e.to_string()))?;
        if sentences.is_empty() {
            warn!(lesson_id = %lesson.id, "Sentence generation produced nothing; existing rows kept");
            return Ok(());
        }
        self.store
            .store_sentences(lesson.id, &sentences, job.replace_existing)
            .await?;
        info!(lesson_id = %lesson.id, count = sentences.len(), "Sentences stored");
        Ok(())
    }

    async fn run_generate_grammar(
        &self,
        lesson: &Lesson,
        job: &GenerationJob,
    ) -> Result<(), WorkerError> {
        if !lesson.has_source_text() {
            warn!(lesson_id = %lesson.id, "Skipping grammar generation: lesson has no source text");
            return Ok(());
        }
        let points = self
            .grammar
            .generate(lesson, job.custom_prompt.as_deref())
            .await
            .map_err(|e| WorkerError::Internal(e.to_string()))?;
        if points.is_empty() {
            warn!(lesson_id = %lesson.id, "Grammar generation produced nothing; existing rows kept");
            return Ok(());
        }
        self.store
            .store_grammar_points(lesson.id, &points, job.replace_existing)
            .await?;
        info!(lesson_id = %lesson.id, count = points.len(), "Grammar points stored");
        Ok(())
    }

    async fn run_generate_exercises(
        &self,
        lesson: &Lesson,
        job: &GenerationJob,
    ) -> Result<(), WorkerError> {
        if !lesson.has_source_text() {
            warn!(lesson_id = %lesson.id, "Skipping exercise generation: lesson has no source text");
            return Ok(());
        }
        let words = self.store.words_for_lesson(lesson.id).await?;
        let grammar_points = self.store.grammar_points_for_lesson(lesson.id).await?;
        let exercises = self
            .exercises
            .generate(
                lesson,
                &words,
                &grammar_points,
                self.exercise_count,
                job.custom_prompt.as_deref(),
            )
            .await
            .map_err(|e| WorkerError::Internal(e.to_string()))?;
        if exercises.is_empty() {
            warn!(lesson_id = %lesson.id, "Exercise generation produced nothing; existing rows kept");
            return Ok(());
        }
        self.store
            .store_exercises(lesson.id, &exercises, job.replace_existing)
            .await?;
        info!(lesson_id = %lesson.id, count = exercises.len(), "Exercises stored");
        Ok(())
    }

    async fn run_generate_lesson(
        &self,
        lesson: &Lesson,
        _job: &GenerationJob,
    ) -> Result<(), WorkerError> {
        // This task creates the lesson content, so the topic lives in
        // analysis_meta rather than original_text.
        let topic = string_or_default(&lesson.analysis_meta, "topic");
        if topic.is_empty() {
            let message = "lesson generation requested without a topic";
            self.record_generation_failure(lesson, message).await?;
            return Err(WorkerError::Internal(message.to_string()));
        }

        match self
            .dialogue
            .generate_dialogue(&topic, &lesson.target_language, &lesson.support_language)
            .await
        {
            Ok(dialogue) => {
                self.store
                    .merge_analysis_meta(lesson.id, json!({"dialogue": dialogue_to_json(&dialogue)}))
                    .await?;
                self.store
                    .update_lesson_status(lesson.id, LessonStatus::Draft)
                    .await?;
                info!(lesson_id = %lesson.id, turns = dialogue.turns.len(), "Dialogue stored");
                Ok(())
            }
            Err(GenerationError::Validation(message)) | Err(GenerationError::Llm(message)) => {
                self.record_generation_failure(lesson, &message).await?;
                Err(WorkerError::Internal(message))
            }
        }
    }

    async fn run_translate_sentences(
        &self,
        lesson: &Lesson,
        _job: &GenerationJob,
    ) -> Result<(), WorkerError> {
        let rows = self.store.sentence_rows_for_lesson(lesson.id).await?;
        if rows.is_empty() {
            warn!(lesson_id = %lesson.id, "Skipping translation: lesson has no sentences");
            return Ok(());
        }
        let translations = self
            .translation
            .translate(&rows, &lesson.target_language, &lesson.support_language)
            .await
            .map_err(|e| WorkerError::Internal(e.to_string()))?;
        if translations.is_empty() {
            info!(lesson_id = %lesson.id, "No sentence translations to apply");
            return Ok(());
        }
        self.store
            .update_sentence_translations(lesson.id, &translations)
            .await?;
        info!(lesson_id = %lesson.id, count = translations.len(), "Sentence translations stored");
        Ok(())
    }

    async fn record_generation_failure(
        &self,
        lesson: &Lesson,
        message: &str,
    ) -> Result<(), WorkerError> {
        self.store
            .merge_analysis_meta(
                lesson.id,
                json!({"generation_error": truncate_error(message)}),
            )
            .await?;
        self.store
            .update_lesson_status(lesson.id, LessonStatus::Failed)
            .await?;
        Ok(())
    }
}

fn dialogue_to_json(dialogue: &Dialogue) -> Value {
    json!({
        "title": dialogue.title,
        "speakers": dialogue.speakers,
        "turns": dialogue
            .turns
            .iter()
            .map(|t| json!({"speaker": t.speaker, "text": t.text, "translation": t.translation}))
            .collect::<Vec<Value>>(),
    })
}

fn truncate_error(message: &str) -> String {
    if message.len() <= ERROR_META_LIMIT {
        return message.to_string();
    }
    let mut end = ERROR_META_LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lesson_core::chunk::ChunkPolicy;
    use lesson_core::domain::{
        Exercise, GrammarPoint, NlpAnalysis, Sentence, SentenceRow, Word,
    };
    use lesson_core::llm::{ChatMessage, ChatOptions, LlmResult};
    use lesson_core::ports::{PortResult, ChatCompletionService};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    use crate::config::{ExerciseSettings, LlmSettings, Provider, TaskSettings};

    //-----------------------------------------------------------------
    // Test doubles
    //-----------------------------------------------------------------

    #[derive(Default)]
    struct RecordingStore {
        lesson: Mutex<Option<Lesson>>,
        sentence_rows: Mutex<Vec<SentenceRow>>,
        status_updates: Mutex<Vec<LessonStatus>>,
        meta_patches: Mutex<Vec<Value>>,
        stored_words: Mutex<Vec<Vec<Word>>>,
        stored_sentences: Mutex<Vec<Vec<Sentence>>>,
        stored_exercises: Mutex<Vec<Vec<Exercise>>>,
        stored_grammar: Mutex<Vec<Vec<GrammarPoint>>>,
        stored_analyses: Mutex<Vec<NlpAnalysis>>,
        stored_translations: Mutex<Vec<Vec<(Uuid, String)>>>,
    }

    #[async_trait]
    impl LessonStore for RecordingStore {
        async fn get_lesson(&self, _lesson_id: Uuid) -> PortResult<Lesson> {
            Ok(self.lesson.lock().unwrap().clone().unwrap())
        }

        async fn update_lesson_status(
            &self,
            _lesson_id: Uuid,
            status: LessonStatus,
        ) -> PortResult<()> {
            self.status_updates.lock().unwrap().push(status);
            Ok(())
        }

        async fn merge_analysis_meta(&self, _lesson_id: Uuid, patch: Value) -> PortResult<()> {
            self.meta_patches.lock().unwrap().push(patch);
            Ok(())
        }

        async fn words_for_lesson(&self, _lesson_id: Uuid) -> PortResult<Vec<Word>> {
            Ok(Vec::new())
        }

        async fn grammar_points_for_lesson(
            &self,
            _lesson_id: Uuid,
        ) -> PortResult<Vec<GrammarPoint>> {
            Ok(Vec::new())
        }

        async fn sentence_rows_for_lesson(&self, _lesson_id: Uuid) -> PortResult<Vec<SentenceRow>> {
            Ok(self.sentence_rows.lock().unwrap().clone())
        }

        async fn store_words(
            &self,
            _lesson_id: Uuid,
            words: &[Word],
            _replace_existing: bool,
        ) -> PortResult<()> {
            self.stored_words.lock().unwrap().push(words.to_vec());
            Ok(())
        }

        async fn store_sentences(
            &self,
            _lesson_id: Uuid,
            sentences: &[Sentence],
            _replace_existing: bool,
        ) -> PortResult<()> {
            self.stored_sentences.lock().unwrap().push(sentences.to_vec());
            Ok(())
        }

        async fn store_grammar_points(
            &self,
            _lesson_id: Uuid,
            points: &[GrammarPoint],
            _replace_existing: bool,
        ) -> PortResult<()> {
            self.stored_grammar.lock().unwrap().push(points.to_vec());
            Ok(())
        }

        async fn store_exercises(
            &self,
            _lesson_id: Uuid,
            exercises: &[Exercise],
            _replace_existing: bool,
        ) -> PortResult<()> {
            self.stored_exercises.lock().unwrap().push(exercises.to_vec());
            Ok(())
        }

        async fn store_analysis(
            &self,
            _lesson_id: Uuid,
            analysis: &NlpAnalysis,
            _replace_existing: bool,
        ) -> PortResult<()> {
            self.stored_analyses.lock().unwrap().push(analysis.clone());
            Ok(())
        }

        async fn update_sentence_translations(
            &self,
            _lesson_id: Uuid,
            translations: &[(Uuid, String)],
        ) -> PortResult<()> {
            self.stored_translations.lock().unwrap().push(translations.to_vec());
            Ok(())
        }
    }

    struct FailingChat;

    #[async_trait]
    impl ChatCompletionService for FailingChat {
        async fn chat(&self, _m: &[ChatMessage], _o: &ChatOptions) -> LlmResult {
            LlmResult::transport_failure("transport", "connection refused")
        }

        async fn chat_json(&self, m: &[ChatMessage], o: &ChatOptions) -> LlmResult {
            self.chat(m, o).await
        }
    }

    struct JsonChat {
        value: Value,
    }

    #[async_trait]
    impl ChatCompletionService for JsonChat {
        async fn chat(&self, m: &[ChatMessage], o: &ChatOptions) -> LlmResult {
            self.chat_json(m, o).await
        }

        async fn chat_json(&self, _m: &[ChatMessage], _o: &ChatOptions) -> LlmResult {
            LlmResult {
                ok: true,
                status: 200,
                content: self.value.to_string(),
                json: Some(self.value.clone()),
                finish_reason: Some("stop".to_string()),
                usage: None,
                error: None,
                raw: None,
            }
        }
    }

    //-----------------------------------------------------------------
    // Fixtures
    //-----------------------------------------------------------------

    fn task(model: &str) -> TaskSettings {
        TaskSettings {
            model: model.to_string(),
            max_output_tokens: 1024,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn config() -> Config {
        Config {
            database_url: "postgres://localhost/test".to_string(),
            log_level: tracing::Level::INFO,
            poll_interval: Duration::from_millis(100),
            job_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(5),
            llm: LlmSettings {
                provider: Provider::OpenAi,
                openai_base_url: "https://api.openai.com/v1".to_string(),
                openai_api_key: Some("test".to_string()),
                azure_endpoint: None,
                azure_api_key: None,
                azure_deployment: None,
                azure_api_version: "2024-10-21".to_string(),
                azure_use_v1: false,
                azure_tenant_id: None,
                azure_client_id: None,
                azure_client_secret: None,
                token_ttl: Duration::from_secs(2700),
                connect_timeout: Duration::from_secs(10),
            },
            nlp: task("gpt-4o"),
            exercises_task: task("gpt-4o"),
            grammar: task("gpt-4o"),
            sentences: task("gpt-4o-mini"),
            words: task("gpt-4o-mini"),
            dialogue: task("gpt-4o"),
            translation: task("gpt-4o-mini"),
            nlp_chunks: ChunkPolicy::new(220, 30, 6),
            chunk_word_threshold: 260,
            exercises: ExerciseSettings {
                default_count: 12,
                min_count: 10,
                max_count: 24,
                vocab_ratio: 0.4,
                grammar_ratio: 0.4,
            },
            words_char_budget: 6000,
            sentences_char_budget: 6000,
        }
    }

    fn lesson(original_text: &str, analysis_meta: Value) -> Lesson {
        Lesson {
            id: Uuid::new_v4(),
            original_text: original_text.to_string(),
            target_language: "de".to_string(),
            support_language: "en".to_string(),
            status: LessonStatus::Draft,
            analysis_meta,
        }
    }

    fn job(kind: JobKind, lesson_id: Uuid) -> GenerationJob {
        GenerationJob {
            id: Uuid::new_v4(),
            kind,
            lesson_id,
            custom_prompt: None,
            replace_existing: true,
            attempts: 1,
        }
    }

    fn runner_with(
        store: Arc<RecordingStore>,
        llm: Arc<dyn ChatCompletionService>,
    ) -> JobRunner {
        JobRunner::new(store, llm, &config())
    }

    //-----------------------------------------------------------------
    // Tests
    //-----------------------------------------------------------------

    #[tokio::test]
    async fn failed_word_generation_leaves_store_untouched() {
        let store = Arc::new(RecordingStore::default());
        let l = lesson("Der Hund läuft durch den Park.", json!({}));
        let j = job(JobKind::GenerateWords, l.id);
        *store.lesson.lock().unwrap() = Some(l);

        let runner = runner_with(store.clone(), Arc::new(FailingChat));
        runner.run(&j).await.unwrap();

        assert!(store.stored_words.lock().unwrap().is_empty());
        assert!(store.status_updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_source_text_is_a_noop() {
        let store = Arc::new(RecordingStore::default());
        let l = lesson("   ", json!({}));
        let j = job(JobKind::GenerateSentences, l.id);
        *store.lesson.lock().unwrap() = Some(l);

        let runner = runner_with(store.clone(), Arc::new(FailingChat));
        runner.run(&j).await.unwrap();

        assert!(store.stored_sentences.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_word_generation_is_persisted() {
        let store = Arc::new(RecordingStore::default());
        let l = lesson("Der Hund läuft durch den Park.", json!({}));
        let j = job(JobKind::GenerateWords, l.id);
        *store.lesson.lock().unwrap() = Some(l);

        let llm = Arc::new(JsonChat {
            value: json!({"words": [
                {"term": "Hund", "meaning": "dog"},
                {"term": "Park", "meaning": "park"},
            ]}),
        });
        let runner = runner_with(store.clone(), llm);
        runner.run(&j).await.unwrap();

        let stored = store.stored_words.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].len(), 2);
    }

    #[tokio::test]
    async fn analysis_failure_marks_lesson_failed_without_touching_rows() {
        let store = Arc::new(RecordingStore::default());
        let l = lesson("Der Hund läuft durch den Park.", json!({}));
        let j = job(JobKind::AnalyzeText, l.id);
        *store.lesson.lock().unwrap() = Some(l);

        let runner = runner_with(store.clone(), Arc::new(FailingChat));
        let result = runner.run(&j).await;

        assert!(result.is_err());
        assert!(store.stored_analyses.lock().unwrap().is_empty());
        let statuses = store.status_updates.lock().unwrap();
        assert_eq!(
            *statuses,
            vec![LessonStatus::Processing, LessonStatus::Failed]
        );
    }

    #[tokio::test]
    async fn lesson_generation_failure_records_truncated_error() {
        let store = Arc::new(RecordingStore::default());
        let l = lesson("", json!({"topic": "ordering coffee"}));
        let j = job(JobKind::GenerateLesson, l.id);
        *store.lesson.lock().unwrap() = Some(l);

        let runner = runner_with(store.clone(), Arc::new(FailingChat));
        let result = runner.run(&j).await;

        assert!(result.is_err());
        let patches = store.meta_patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert!(patches[0].get("generation_error").is_some());
        let statuses = store.status_updates.lock().unwrap();
        assert_eq!(*statuses, vec![LessonStatus::Failed]);
    }

    #[tokio::test]
    async fn lesson_generation_without_topic_fails() {
        let store = Arc::new(RecordingStore::default());
        let l = lesson("", json!({}));
        let j = job(JobKind::GenerateLesson, l.id);
        *store.lesson.lock().unwrap() = Some(l);

        let runner = runner_with(store.clone(), Arc::new(FailingChat));
        assert!(runner.run(&j).await.is_err());
        assert_eq!(
            *store.status_updates.lock().unwrap(),
            vec![LessonStatus::Failed]
        );
    }

    #[tokio::test]
    async fn translation_job_applies_only_returned_pairs() {
        let store = Arc::new(RecordingStore::default());
        let l = lesson("Der Hund läuft.", json!({}));
        let j = job(JobKind::TranslateSentences, l.id);
        let row_id = Uuid::new_v4();
        *store.lesson.lock().unwrap() = Some(l);
        *store.sentence_rows.lock().unwrap() = vec![SentenceRow {
            id: row_id,
            text: "Der Hund läuft.".to_string(),
            translation: None,
        }];

        let llm = Arc::new(JsonChat {
            value: json!({"translations": [{"index": 0, "translation": "The dog runs."}]}),
        });
        let runner = runner_with(store.clone(), llm);
        runner.run(&j).await.unwrap();

        let stored = store.stored_translations.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], vec![(row_id, "The dog runs.".to_string())]);
    }

    #[test]
    fn error_truncation_respects_char_boundaries() {
        let message = "ü".repeat(600);
        let truncated = truncate_error(&message);
        assert!(truncated.len() <= ERROR_META_LIMIT);
        assert!(truncated.chars().all(|c| c == 'ü'));
    }
}
