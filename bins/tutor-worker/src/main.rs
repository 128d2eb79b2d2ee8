use ::redis::aio::ConnectionManager;
use ::redis::RedisResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{debug, error, info, instrument, warn};
use tutor_common::config::{max_timeout, WorkerSettings};
use tutor_common::redis;
use tutor_common::types::{ExecutionResult, FailureKind, Job, JobOutcome, JobPayload, JobResult};
use tutor_grader::{DockerBackend, Grader, IsolationRunner, RuntimeRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Tutor worker booting...");

    let settings = WorkerSettings::from_env().map_err(|e| {
        error!("Invalid worker configuration: {:#}", e);
        e
    })?;

    let registry = RuntimeRegistry::load_or_builtin(&settings.languages_config)?;
    info!(languages = ?registry.list_languages(), "Runtimes loaded");

    let backend = Arc::new(DockerBackend::connect()?);
    match backend.reap_orphans().await {
        Ok(0) => {}
        Ok(reaped) => warn!(reaped, "Removed sandboxes left by a previous run"),
        Err(e) => warn!(error = %e, "Could not check for orphaned sandboxes"),
    }

    let runner = IsolationRunner::new(backend.clone(), settings.limits);
    let grader = Grader::new(runner, registry.python()?.clone())
        .with_timeout(settings.timeout)
        .with_concurrency(settings.concurrency);

    info!(
        timeout_secs = settings.timeout.as_secs(),
        memory_bytes = settings.limits.memory_bytes(),
        nano_cpus = settings.limits.nano_cpus(),
        pids_limit = settings.limits.pids_limit(),
        output_bytes = settings.limits.output_bytes(),
        concurrency = settings.concurrency,
        "Sandbox policy"
    );

    let client = ::redis::Client::open(settings.redis_url.as_str())?;
    let mut redis_conn = ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", settings.redis_url);

    // The job in flight always finishes; the flag only stops further pops
    let shutdown = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Received shutdown signal, finishing the current job...");
                    shutdown.store(true, Ordering::SeqCst);
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    });

    worker_loop(&mut redis_conn, &grader, &registry, &shutdown).await;

    match backend.reap_orphans().await {
        Ok(0) => {}
        Ok(reaped) => warn!(reaped, "Removed sandboxes still present at shutdown"),
        Err(e) => warn!(error = %e, "Could not check for leftover sandboxes"),
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Source of jobs and sink for their results
#[async_trait]
trait JobQueue: Send {
    /// Wait briefly for the next job; `Ok(None)` when none arrived
    async fn next_job(&mut self) -> RedisResult<Option<Job>>;

    async fn complete(&mut self, result: &JobResult) -> RedisResult<()>;
}

#[async_trait]
impl JobQueue for ConnectionManager {
    async fn next_job(&mut self) -> RedisResult<Option<Job>> {
        // BLPOP with 5 second timeout so the shutdown flag is seen promptly
        redis::pop_job(self, 5.0).await
    }

    async fn complete(&mut self, result: &JobResult) -> RedisResult<()> {
        redis::store_result(self, result).await
    }
}

#[instrument(skip_all)]
async fn worker_loop(queue: &mut impl JobQueue, grader: &Grader, registry: &RuntimeRegistry, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        match queue.next_job().await {
            Ok(Some(job)) => {
                let job_id = job.id;
                let start = Instant::now();
                let outcome = process_job(grader, registry, &job).await;

                info!(
                    job_id = %job_id,
                    status = ?outcome.status(),
                    execution_ms = start.elapsed().as_millis() as u64,
                    "Job completed"
                );

                match queue.complete(&JobResult::new(job_id, outcome)).await {
                    Ok(()) => debug!(job_id = %job_id, "Result persisted to Redis"),
                    // Non-fatal - worker continues
                    Err(e) => error!(job_id = %job_id, error = %e, "Failed to persist result"),
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Per-job timeout override, clamped to the allowed range
fn job_timeout(requested_secs: Option<u64>, default: Duration) -> Duration {
    match requested_secs {
        Some(secs) => Duration::from_secs(secs).clamp(Duration::from_secs(1), max_timeout()),
        None => default,
    }
}

async fn process_job(grader: &Grader, registry: &RuntimeRegistry, job: &Job) -> JobOutcome {
    let timeout = job_timeout(job.timeout_secs, grader.timeout());
    let grader = grader.clone().with_timeout(timeout);

    match &job.payload {
        JobPayload::Grade {
            user_code,
            invocation,
            test_cases,
        } => {
            info!(
                job_id = %job.id,
                kind = invocation.kind(),
                test_cases = test_cases.len(),
                source_size = user_code.len(),
                "Received grading job"
            );
            JobOutcome::Graded(grader.grade_report(user_code, invocation, test_cases).await)
        }
        JobPayload::Run { language, code } => {
            info!(job_id = %job.id, language = %language, source_size = code.len(), "Received run job");
            match registry.get(language) {
                Ok(runtime) => JobOutcome::Ran(grader.execute(runtime, code).await),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Rejected run job");
                    JobOutcome::Ran(ExecutionResult::failed(FailureKind::Platform, e))
                }
            }
        }
    }
}
