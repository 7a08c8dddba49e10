use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use grader::error::PoolError;
use grader::models::{Run, RunOutcome, RunRequest, RunStatus};
use grader::reporter::{RedisReporter, ReporterRegistry};
use grader::storage::{BlobStore, QueueMessage, RedisStore, RunQueue};
use grader::{GraderConfig, RunEngine, WorkerPool};

/// Name tests use to select the Redis channel reporter
const REDIS_REPORTER: &str = "redis";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("grader=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Arc::new(GraderConfig::load()?);
    info!(
        "Starting grader: {} worker(s), work root {:?}",
        config.workers, config.work_root
    );

    let store = RedisStore::connect(&config.redis_url).await?;
    let blobs = BlobStore::from_config(&config.blobs);

    let mut reporters = ReporterRegistry::new();
    reporters.register(REDIS_REPORTER, Arc::new(RedisReporter::new(store.connection())));

    let engine = Arc::new(RunEngine::new(
        Arc::new(store),
        blobs,
        config.clone(),
        reporters,
    ));
    let pool = Arc::new(WorkerPool::new(engine.clone(), config.workers));
    let mut queue = RunQueue::connect(&config.redis_url).await?;

    info!("Waiting for runs...");

    loop {
        tokio::select! {
            message = queue.pop() => match message? {
                QueueMessage::Run(request) => submit(&pool, &engine, request).await,
                QueueMessage::Cancel(id) => {
                    if pool.cancel(id.into()) {
                        info!("Cancelled run {}", id);
                    } else {
                        warn!("Cancel for unknown or finished run {}", id);
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, draining queued runs");
                break;
            }
        }
    }

    pool.shutdown().await;
    Ok(())
}

async fn submit(pool: &Arc<WorkerPool>, engine: &RunEngine, mut request: RunRequest) {
    // Fix the id up front so a rejection is recorded under the id pollers expect
    let id = *request.id.get_or_insert_with(Uuid::new_v4);
    let mut rejected = Run::new(&request);

    match pool.submit(request).await {
        Ok(handle) => {
            info!("Accepted run {}", handle.id());
            // Results live in Redis; drop the in-memory slot once it is final
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.wait(handle).await;
                pool.forget(handle);
            });
        }
        Err(PoolError::Closed) => warn!("Pool closed, dropping run {}", id),
        Err(e) => {
            warn!("Rejected run {}: {}", id, e);
            let status = match &e {
                PoolError::UnknownPlugin { stage: "builder", .. } => {
                    RunStatus::CompleteExceptionBuilder
                }
                _ => RunStatus::CompleteExceptionRun,
            };
            rejected.start();
            engine
                .complete(&mut rejected, RunOutcome::exception(status, e.to_string()))
                .await;
        }
    }
}
