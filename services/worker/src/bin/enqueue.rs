//! services/worker/src/bin/enqueue.rs
//!
//! Small operational CLI for pushing a generation job onto the queue:
//!
//!   enqueue <job_kind> <lesson_id> [--keep] [--prompt <text>]
//!
//! `--keep` appends to existing rows instead of replacing them.

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use uuid::Uuid;

use lesson_core::domain::JobKind;
use lesson_core::ports::JobQueue;
use worker_lib::adapters::DbAdapter;
use worker_lib::config::Config;
use worker_lib::error::WorkerError;

const USAGE: &str = "usage: enqueue <job_kind> <lesson_id> [--keep] [--prompt <text>]\n\
job kinds: analyze_text, generate_words, generate_sentences, generate_grammar, \
generate_exercises, generate_lesson, translate_sentences";

struct Args {
    kind: JobKind,
    lesson_id: Uuid,
    replace_existing: bool,
    custom_prompt: Option<String>,
}

fn parse_args(mut args: std::env::Args) -> Result<Args, String> {
    args.next(); // program name

    let kind_raw = args.next().ok_or(USAGE)?;
    let kind = JobKind::from_str(&kind_raw)
        .ok_or_else(|| format!("unknown job kind '{}'\n{}", kind_raw, USAGE))?;

    let lesson_raw = args.next().ok_or(USAGE)?;
    let lesson_id = Uuid::parse_str(&lesson_raw)
        .map_err(|_| format!("'{}' is not a valid lesson id\n{}", lesson_raw, USAGE))?;

    let mut replace_existing = true;
    let mut custom_prompt = None;
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--keep" => replace_existing = false,
            "--prompt" => {
                custom_prompt =
                    Some(args.next().ok_or_else(|| format!("--prompt needs a value\n{}", USAGE))?);
            }
            other => return Err(format!("unknown flag '{}'\n{}", other, USAGE)),
        }
    }

    Ok(Args { kind, lesson_id, replace_existing, custom_prompt })
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let args = match parse_args(std::env::args()) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    let config = Config::from_env()?;
    let db_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database_url)
        .await?;
    let queue = Arc::new(DbAdapter::new(db_pool, config.retry_backoff));

    let job_id = queue
        .enqueue(args.kind, args.lesson_id, args.custom_prompt, args.replace_existing)
        .await?;
    println!("enqueued {} job {} for lesson {}", args.kind.as_str(), job_id, args.lesson_id);
    Ok(())
}
