//! services/worker/src/adapters/db.rs
//!
//! The database adapter: concrete implementation of the `LessonStore` and
//! `JobQueue` ports against PostgreSQL using `sqlx`. Every replace-style
//! write wraps delete+insert in one transaction so concurrent readers see
//! either the old complete set of child rows or the new one.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use lesson_core::domain::{
    Exercise, GenerationJob, GrammarExample, GrammarPoint, JobKind, Lesson, LessonStatus,
    NlpAnalysis, Sentence, SentenceRow, Word,
};
use lesson_core::ports::{JobQueue, LessonStore, PortError, PortResult};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter implementing the `LessonStore` and `JobQueue` ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
    retry_backoff: Duration,
}

impl DbAdapter {
    pub fn new(pool: PgPool, retry_backoff: Duration) -> Self {
        Self { pool, retry_backoff }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(sqlx::FromRow)]
struct LessonRecord {
    id: Uuid,
    original_text: String,
    target_language: String,
    support_language: String,
    status: String,
    analysis_meta: Value,
}

impl LessonRecord {
    fn to_domain(self) -> PortResult<Lesson> {
        let status = LessonStatus::from_str(&self.status).ok_or_else(|| {
            PortError::Unexpected(format!("Unknown lesson status '{}'", self.status))
        })?;
        Ok(Lesson {
            id: self.id,
            original_text: self.original_text,
            target_language: self.target_language,
            support_language: self.support_language,
            status,
            analysis_meta: self.analysis_meta,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WordRecord {
    term: String,
    meaning: String,
    example_sentence: String,
    translation: String,
}

impl WordRecord {
    fn to_domain(self) -> Word {
        Word {
            term: self.term,
            meaning: self.meaning,
            example_sentence: self.example_sentence,
            translation: self.translation,
        }
    }
}

#[derive(sqlx::FromRow)]
struct GrammarPointRecord {
    key: String,
    title: String,
    level: String,
    description: String,
    pattern: String,
    examples: Value,
    meta: Value,
}

impl GrammarPointRecord {
    fn to_domain(self) -> GrammarPoint {
        GrammarPoint {
            key: self.key,
            title: self.title,
            level: self.level,
            description: self.description,
            pattern: self.pattern,
            examples: examples_from_json(&self.examples),
            meta: self.meta,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SentenceRowRecord {
    id: Uuid,
    text: String,
    translation: Option<String>,
}

impl SentenceRowRecord {
    fn to_domain(self) -> SentenceRow {
        SentenceRow { id: self.id, text: self.text, translation: self.translation }
    }
}

#[derive(sqlx::FromRow)]
struct JobRecord {
    id: Uuid,
    kind: String,
    lesson_id: Uuid,
    custom_prompt: Option<String>,
    replace_existing: bool,
    attempts: i32,
}

impl JobRecord {
    fn to_domain(self) -> PortResult<GenerationJob> {
        let kind = JobKind::from_str(&self.kind)
            .ok_or_else(|| PortError::Unexpected(format!("Unknown job kind '{}'", self.kind)))?;
        Ok(GenerationJob {
            id: self.id,
            kind,
            lesson_id: self.lesson_id,
            custom_prompt: self.custom_prompt,
            replace_existing: self.replace_existing,
            attempts: self.attempts,
        })
    }
}

fn examples_to_json(examples: &[GrammarExample]) -> Value {
    Value::Array(
        examples
            .iter()
            .map(|e| json!({"text": e.text, "translation": e.translation, "source": e.source}))
            .collect(),
    )
}

fn examples_from_json(value: &Value) -> Vec<GrammarExample> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|e| GrammarExample {
                    text: lesson_core::json::string_or_default(e, "text"),
                    translation: lesson_core::json::string_or_default(e, "translation"),
                    source: lesson_core::json::string_or_default(e, "source"),
                })
                .collect()
        })
        .unwrap_or_default()
}

//=========================================================================================
// Transaction Helpers
//=========================================================================================

async fn delete_words(tx: &mut Transaction<'_, Postgres>, lesson_id: Uuid) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM lesson_words WHERE lesson_id = $1")
        .bind(lesson_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_words(
    tx: &mut Transaction<'_, Postgres>,
    lesson_id: Uuid,
    words: &[Word],
) -> sqlx::Result<()> {
    for (index, word) in words.iter().enumerate() {
        sqlx::query(
            "INSERT INTO lesson_words \
             (id, lesson_id, term, meaning, example_sentence, translation, order_index) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(lesson_id)
        .bind(&word.term)
        .bind(&word.meaning)
        .bind(&word.example_sentence)
        .bind(&word.translation)
        .bind(index as i32)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn delete_sentences(tx: &mut Transaction<'_, Postgres>, lesson_id: Uuid) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM lesson_sentences WHERE lesson_id = $1")
        .bind(lesson_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_sentences(
    tx: &mut Transaction<'_, Postgres>,
    lesson_id: Uuid,
    sentences: &[Sentence],
) -> sqlx::Result<()> {
    for (index, sentence) in sentences.iter().enumerate() {
        sqlx::query(
            "INSERT INTO lesson_sentences \
             (id, lesson_id, text, translation, source, order_index) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(lesson_id)
        .bind(&sentence.text)
        .bind(&sentence.translation)
        .bind(&sentence.source)
        .bind(index as i32)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn delete_grammar_points(
    tx: &mut Transaction<'_, Postgres>,
    lesson_id: Uuid,
) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM lesson_grammar_points WHERE lesson_id = $1")
        .bind(lesson_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_grammar_points(
    tx: &mut Transaction<'_, Postgres>,
    lesson_id: Uuid,
    points: &[GrammarPoint],
) -> sqlx::Result<()> {
    for (index, point) in points.iter().enumerate() {
        sqlx::query(
            "INSERT INTO lesson_grammar_points \
             (id, lesson_id, key, title, level, description, pattern, examples, meta, order_index) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(Uuid::new_v4())
        .bind(lesson_id)
        .bind(&point.key)
        .bind(&point.title)
        .bind(&point.level)
        .bind(&point.description)
        .bind(&point.pattern)
        .bind(examples_to_json(&point.examples))
        .bind(&point.meta)
        .bind(index as i32)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn delete_exercises(tx: &mut Transaction<'_, Postgres>, lesson_id: Uuid) -> sqlx::Result<()> {
    sqlx::query(
        "DELETE FROM lesson_exercise_options WHERE exercise_id IN \
         (SELECT id FROM lesson_exercises WHERE lesson_id = $1)",
    )
    .bind(lesson_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM lesson_exercises WHERE lesson_id = $1")
        .bind(lesson_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_exercises(
    tx: &mut Transaction<'_, Postgres>,
    lesson_id: Uuid,
    exercises: &[Exercise],
) -> sqlx::Result<()> {
    for (index, exercise) in exercises.iter().enumerate() {
        let exercise_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO lesson_exercises \
             (id, lesson_id, skill, difficulty, question_prompt, instructions, \
              solution_explanation, order_index) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(exercise_id)
        .bind(lesson_id)
        .bind(&exercise.skill)
        .bind(&exercise.difficulty)
        .bind(&exercise.question_prompt)
        .bind(&exercise.instructions)
        .bind(&exercise.solution_explanation)
        .bind(index as i32)
        .execute(&mut **tx)
        .await?;

        for (option_index, option) in exercise.options.iter().enumerate() {
            sqlx::query(
                "INSERT INTO lesson_exercise_options \
                 (id, exercise_id, label, text, is_correct, explanation, order_index) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(Uuid::new_v4())
            .bind(exercise_id)
            .bind(&option.label)
            .bind(&option.text)
            .bind(option.is_correct)
            .bind(&option.explanation)
            .bind(option_index as i32)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

//=========================================================================================
// `LessonStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl LessonStore for DbAdapter {
    async fn get_lesson(&self, lesson_id: Uuid) -> PortResult<Lesson> {
        let record = sqlx::query_as::<_, LessonRecord>(
            "SELECT id, original_text, target_language, support_language, status, analysis_meta \
             FROM lessons WHERE id = $1",
        )
        .bind(lesson_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Lesson {} not found", lesson_id))
            }
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn update_lesson_status(&self, lesson_id: Uuid, status: LessonStatus) -> PortResult<()> {
        sqlx::query("UPDATE lessons SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(lesson_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn merge_analysis_meta(&self, lesson_id: Uuid, patch: Value) -> PortResult<()> {
        // JSONB || is a shallow merge: colliding top-level keys are
        // overwritten by the patch.
        sqlx::query(
            "UPDATE lessons SET analysis_meta = analysis_meta || $1, updated_at = now() \
             WHERE id = $2",
        )
        .bind(patch)
        .bind(lesson_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn words_for_lesson(&self, lesson_id: Uuid) -> PortResult<Vec<Word>> {
        let records = sqlx::query_as::<_, WordRecord>(
            "SELECT term, meaning, example_sentence, translation FROM lesson_words \
             WHERE lesson_id = $1 ORDER BY order_index ASC",
        )
        .bind(lesson_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn grammar_points_for_lesson(&self, lesson_id: Uuid) -> PortResult<Vec<GrammarPoint>> {
        let records = sqlx::query_as::<_, GrammarPointRecord>(
            "SELECT key, title, level, description, pattern, examples, meta \
             FROM lesson_grammar_points WHERE lesson_id = $1 ORDER BY order_index ASC",
        )
        .bind(lesson_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn sentence_rows_for_lesson(&self, lesson_id: Uuid) -> PortResult<Vec<SentenceRow>> {
        let records = sqlx::query_as::<_, SentenceRowRecord>(
            "SELECT id, text, translation FROM lesson_sentences \
             WHERE lesson_id = $1 ORDER BY order_index ASC",
        )
        .bind(lesson_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn store_words(
        &self,
        lesson_id: Uuid,
        words: &[Word],
        replace_existing: bool,
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        if replace_existing {
            delete_words(&mut tx, lesson_id).await.map_err(unexpected)?;
        }
        insert_words(&mut tx, lesson_id, words).await.map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn store_sentences(
        &self,
        lesson_id: Uuid,
        sentences: &[Sentence],
        replace_existing: bool,
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        if replace_existing {
            delete_sentences(&mut tx, lesson_id).await.map_err(unexpected)?;
        }
        insert_sentences(&mut tx, lesson_id, sentences).await.map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn store_grammar_points(
        &self,
        lesson_id: Uuid,
        points: &[GrammarPoint],
        replace_existing: bool,
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        if replace_existing {
            delete_grammar_points(&mut tx, lesson_id).await.map_err(unexpected)?;
        }
        insert_grammar_points(&mut tx, lesson_id, points).await.map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn store_exercises(
        &self,
        lesson_id: Uuid,
        exercises: &[Exercise],
        replace_existing: bool,
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        if replace_existing {
            delete_exercises(&mut tx, lesson_id).await.map_err(unexpected)?;
        }
        insert_exercises(&mut tx, lesson_id, exercises).await.map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn store_analysis(
        &self,
        lesson_id: Uuid,
        analysis: &NlpAnalysis,
        replace_existing: bool,
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        if replace_existing {
            delete_sentences(&mut tx, lesson_id).await.map_err(unexpected)?;
            delete_words(&mut tx, lesson_id).await.map_err(unexpected)?;
            delete_exercises(&mut tx, lesson_id).await.map_err(unexpected)?;
        }
        insert_sentences(&mut tx, lesson_id, &analysis.sentences).await.map_err(unexpected)?;
        insert_words(&mut tx, lesson_id, &analysis.words).await.map_err(unexpected)?;
        insert_exercises(&mut tx, lesson_id, &analysis.exercises).await.map_err(unexpected)?;
        sqlx::query("UPDATE lessons SET status = $1, updated_at = now() WHERE id = $2")
            .bind(LessonStatus::Ready.as_str())
            .bind(lesson_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn update_sentence_translations(
        &self,
        lesson_id: Uuid,
        translations: &[(Uuid, String)],
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        for (sentence_id, translation) in translations {
            sqlx::query(
                "UPDATE lesson_sentences SET translation = $1 \
                 WHERE id = $2 AND lesson_id = $3",
            )
            .bind(translation)
            .bind(sentence_id)
            .bind(lesson_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }
}

//=========================================================================================
// `JobQueue` Trait Implementation
//=========================================================================================

#[async_trait]
impl JobQueue for DbAdapter {
    async fn enqueue(
        &self,
        kind: JobKind,
        lesson_id: Uuid,
        custom_prompt: Option<String>,
        replace_existing: bool,
    ) -> PortResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO generation_jobs \
             (id, kind, lesson_id, custom_prompt, replace_existing) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(lesson_id)
        .bind(custom_prompt)
        .bind(replace_existing)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(id)
    }

    async fn claim_next(&self) -> PortResult<Option<GenerationJob>> {
        // SKIP LOCKED keeps concurrent workers from claiming the same job.
        let record = sqlx::query_as::<_, JobRecord>(
            "UPDATE generation_jobs SET status = 'running', attempts = attempts + 1, \
             updated_at = now() \
             WHERE id = ( \
                 SELECT id FROM generation_jobs \
                 WHERE status = 'queued' AND run_after <= now() \
                 ORDER BY created_at ASC LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, kind, lesson_id, custom_prompt, replace_existing, attempts",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        record.map(JobRecord::to_domain).transpose()
    }

    async fn complete(&self, job_id: Uuid) -> PortResult<()> {
        sqlx::query(
            "UPDATE generation_jobs SET status = 'completed', updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str, retry: bool) -> PortResult<()> {
        if retry {
            sqlx::query(
                "UPDATE generation_jobs SET status = 'queued', last_error = $1, \
                 run_after = now() + make_interval(secs => $2), updated_at = now() \
                 WHERE id = $3",
            )
            .bind(error)
            .bind(self.retry_backoff.as_secs_f64())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        } else {
            sqlx::query(
                "UPDATE generation_jobs SET status = 'failed', last_error = $1, \
                 updated_at = now() WHERE id = $2",
            )
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        }
        Ok(())
    }
}
