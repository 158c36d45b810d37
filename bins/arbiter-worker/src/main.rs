mod compiler;
mod engine;
mod error;
mod evaluator;
mod executor;
mod runner;
mod worker;
mod workspace;


use anyhow::Context;
use arbiter_common::config::WorkerConfig;
use arbiter_common::redis;
use engine::ProcessEngine;
use executor::Pipeline;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use worker::{RedisJobQueue, RedisReplySink, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Arbiter worker booting...");

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    info!(
        worker_id = %config.worker_id,
        queue = %config.queue_name,
        max_concurrent_jobs = config.max_concurrent_jobs,
        code_dir = %config.paths.code_dir.display(),
        scripts_dir = %config.paths.scripts_dir.display(),
        test_cases_dir = %config.paths.test_cases_dir.display(),
        script_timeout = ?config.scripts.timeout,
        "Worker configured"
    );

    // Blocking receives get their own connection so they never stall replies
    let client = ::redis::Client::open(config.redis_url.as_str())
        .context("Invalid REDIS_URL")?;
    let mut intake_conn = ::redis::aio::ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;
    let reply_conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis: {}", config.redis_url);

    let processing = redis::processing_queue(&config.worker_id);
    let requeued = redis::requeue_unacked(&mut intake_conn, &processing, &config.queue_name)
        .await
        .context("Failed to recover unacknowledged jobs")?;
    if requeued > 0 {
        warn!(requeued, "Returned unacknowledged jobs from a previous run to the queue");
    }

    let engine = Arc::new(ProcessEngine::new(
        config.paths.scripts_dir.clone(),
        config.scripts.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(engine, config.paths.clone()));

    let worker = Worker::new(
        RedisJobQueue::new(intake_conn, &config),
        RedisReplySink::new(reply_conn),
        pipeline,
        config.max_concurrent_jobs,
    );

    // Setup graceful shutdown
    let shutdown = async {
        signal::ctrl_c().await.expect("failed to install CTRL+C signal handler");
        warn!("Received shutdown signal, draining in-flight jobs...");
    };

    info!("Listening for jobs on '{}'", config.queue_name);
    worker.run(shutdown).await?;

    info!("Worker shutdown complete");
    Ok(())
}
