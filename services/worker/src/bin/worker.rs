//! services/worker/src/bin/worker.rs

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lesson_core::ports::{ChatCompletionService, JobQueue, LessonStore};
use worker_lib::adapters::DbAdapter;
use worker_lib::config::{Config, LlmSettings, Provider};
use worker_lib::error::WorkerError;
use worker_lib::jobs::JobRunner;
use worker_lib::llm::{LlmClient, TokenProvider};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting generation worker...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db = Arc::new(DbAdapter::new(db_pool, config.retry_backoff));
    info!("Running database migrations...");
    db.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize the LLM Stack & Job Runner ---
    let tokens = Arc::new(build_token_provider(&config.llm)?);
    let llm: Arc<dyn ChatCompletionService> = Arc::new(
        LlmClient::new(config.llm.clone(), tokens).map_err(WorkerError::Internal)?,
    );
    let store: Arc<dyn LessonStore> = db.clone();
    let queue: Arc<dyn JobQueue> = db.clone();
    let runner = JobRunner::new(store, llm, &config);

    // --- 4. Poll the Queue ---
    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        job_timeout_secs = config.job_timeout.as_secs(),
        "Worker ready, polling for jobs"
    );
    loop {
        let job = match queue.claim_next().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
            Err(e) => {
                error!("Failed to claim a job: {}", e);
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        let retry = job.attempts < job.kind.max_attempts();
        match tokio::time::timeout(config.job_timeout, runner.run(&job)).await {
            Ok(Ok(())) => {
                if let Err(e) = queue.complete(job.id).await {
                    error!(job_id = %job.id, "Failed to mark job completed: {}", e);
                }
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, retry, "Job failed: {}", e);
                if let Err(e) = queue.fail(job.id, &e.to_string(), retry).await {
                    error!(job_id = %job.id, "Failed to record job failure: {}", e);
                }
            }
            Err(_) => {
                let message = format!("job timed out after {}s", config.job_timeout.as_secs());
                warn!(job_id = %job.id, retry, "{}", message);
                if let Err(e) = queue.fail(job.id, &message, retry).await {
                    error!(job_id = %job.id, "Failed to record job timeout: {}", e);
                }
            }
        }
    }
}

fn build_token_provider(llm: &LlmSettings) -> Result<TokenProvider, WorkerError> {
    match llm.provider {
        Provider::OpenAi => {
            let key = llm
                .openai_api_key
                .clone()
                .ok_or_else(|| WorkerError::Internal("OPENAI_API_KEY is required".to_string()))?;
            Ok(TokenProvider::static_key(key))
        }
        Provider::Azure => {
            // A static api-key wins; otherwise fall back to the AAD
            // client-credential flow.
            if let Some(key) = &llm.azure_api_key {
                return Ok(TokenProvider::static_key(key.clone()));
            }
            match (&llm.azure_tenant_id, &llm.azure_client_id, &llm.azure_client_secret) {
                (Some(tenant), Some(client), Some(secret)) => Ok(TokenProvider::azure_ad(
                    tenant.clone(),
                    client.clone(),
                    secret.clone(),
                    llm.token_ttl,
                )),
                _ => Err(WorkerError::Internal(
                    "Azure provider requires AZURE_OPENAI_API_KEY or the \
                     AZURE_TENANT_ID/AZURE_CLIENT_ID/AZURE_CLIENT_SECRET triple"
                        .to_string(),
                )),
            }
        }
    }
}
