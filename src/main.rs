use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use coderun::config::{SandboxBackend, WorkerConfig};
use coderun::jobs::{process_run_job, RunJob, RunJobResult};
use coderun::redis_manager::{RedisManager, ResultSink};
use coderun::sandbox::{
    ensure_cgroups_available, IsolateBoundary, IsolationBoundary, ProcessBoundary,
    ProcessBoundaryConfig,
};
use coderun::{Coordinator, LanguageTable};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coderun=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let languages = match &config.languages_config {
        Some(path) => {
            let table = LanguageTable::load(path)?;
            info!("Loaded language configurations from {}", path.display());
            table
        }
        None => LanguageTable::embedded()?,
    };
    info!(
        "Supported languages: {}",
        languages
            .supported()
            .iter()
            .map(|l| l.name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    info!("Starting coderun worker...");

    let mut redis = RedisManager::connect(&config.redis_url, config.worker_id).await?;
    let worker_id = redis.worker_id();

    let boundary = build_boundary(&config, worker_id).await?;
    let coordinator = Arc::new(Coordinator::new(
        boundary,
        Arc::new(languages),
        config.limits,
    ));

    let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let shutdown = CancellationToken::new();
    let (breach_tx, mut breach_rx) = mpsc::channel::<String>(1);

    info!(
        "Waiting for jobs (worker_id={}, backend={}, up to {} at once)...",
        worker_id, config.backend, config.max_concurrent_jobs
    );

    let breach = loop {
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => permit.context("Job semaphore closed")?,
            Some(reason) = breach_rx.recv() => break Some(reason),
            _ = tokio::signal::ctrl_c() => break None,
        };

        let job = tokio::select! {
            job = redis.pop_job() => job?,
            Some(reason) = breach_rx.recv() => break Some(reason),
            _ = tokio::signal::ctrl_c() => break None,
        };

        let coordinator = coordinator.clone();
        let sink = redis.result_sink();
        let cancel = shutdown.child_token();
        let breach_tx = breach_tx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Some(reason) = handle_job(&coordinator, sink, job, cancel).await {
                let _ = breach_tx.send(reason).await;
            }
        });
    };

    // Stop in-flight jobs and give their workspaces time to be torn down
    shutdown.cancel();
    let total = config.max_concurrent_jobs as u32;
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, permits.acquire_many(total))
        .await
        .is_err()
    {
        warn!("Timed out waiting for in-flight jobs to finish");
    }

    match breach {
        Some(reason) => {
            error!("Stopping worker after isolation breach: {}", reason);
            Err(anyhow!("isolation breach: {}", reason))
        }
        None => {
            info!("Shutting down");
            Ok(())
        }
    }
}

async fn build_boundary(
    config: &WorkerConfig,
    worker_id: u32,
) -> Result<Arc<dyn IsolationBoundary>> {
    match config.backend {
        SandboxBackend::Process => {
            let boundary = ProcessBoundary::new(
                ProcessBoundaryConfig::new(config.workspace_root.clone())
                    .with_network(config.network)
                    .with_cgroup_root(config.cgroup_root.clone()),
            )
            .await
            .context("Failed to prepare the process sandbox")?;
            Ok(Arc::new(boundary))
        }
        SandboxBackend::Isolate => {
            let boundary = IsolateBoundary::new(worker_id)
                .await
                .context("Failed to prepare the isolate sandbox")?;
            // Memory limits are only reliable under cgroups; fail fast otherwise
            ensure_cgroups_available(&boundary)?;
            info!("Confirmed isolate cgroup support is available");
            Ok(Arc::new(boundary))
        }
    }
}

/// Run one job and deliver its result. Returns the reason on an isolation breach.
async fn handle_job(
    coordinator: &Coordinator,
    mut sink: ResultSink,
    job: RunJob,
    cancel: CancellationToken,
) -> Option<String> {
    let job_id = job.job_id.clone();
    let poller = spawn_cancel_poller(sink.clone(), job_id.clone(), cancel.clone());

    let outcome = process_run_job(coordinator, job, cancel).await;
    poller.abort();

    let (result, breach) = match outcome {
        Ok(result) => (result, None),
        Err(e) => {
            error!("Job {} hit an isolation breach: {}", job_id, e);
            (
                RunJobResult::system_error(&job_id, e.to_string()),
                Some(e.to_string()),
            )
        }
    };

    info!("Job {} finished: {:?}", job_id, result.status);
    if let Err(e) = sink.store_result(&result).await {
        error!("Failed to store result for job {}: {:#}", job_id, e);
    }
    breach
}

/// Poll the job's cancel flag until it is set or the job ends
fn spawn_cancel_poller(
    mut sink: ResultSink,
    job_id: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match sink.is_cancelled(&job_id).await {
                Ok(true) => {
                    info!("Cancellation requested for job {}", job_id);
                    cancel.cancel();
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to poll cancel flag for job {}: {:#}", job_id, e),
            }
        }
    })
}
