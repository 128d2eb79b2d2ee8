use crate::types::{Job, JobResult, JobStatus};
use redis::{AsyncCommands, RedisResult};

/// Queue and key layout shared by the worker and the CLI so the two never
/// drift apart.

pub const QUEUE_KEY: &str = "tutor:queue:jobs";
pub const RESULT_PREFIX: &str = "tutor:result";
pub const STATUS_PREFIX: &str = "tutor:status";

/// Results and statuses expire after 24 hours
pub const RESULT_TTL_SECS: u64 = 86_400;

pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

fn encode_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

fn decode_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
}

/// Enqueue a job. RPUSH + BLPOP gives FIFO order.
pub async fn push_job(conn: &mut redis::aio::ConnectionManager, job: &Job) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(encode_error)?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Block for up to `timeout_seconds` waiting for the next job.
/// Returns `Ok(None)` when the wait times out so callers can check for shutdown.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<Job>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: Job = serde_json::from_str(&payload).map_err(decode_error)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store a finished job's result and its status, both with a 24-hour TTL
pub async fn store_result(conn: &mut redis::aio::ConnectionManager, result: &JobResult) -> RedisResult<()> {
    let payload = serde_json::to_string(result).map_err(encode_error)?;
    let _: () = conn.set_ex(result_key(&result.job_id), payload, RESULT_TTL_SECS).await?;

    let status = serde_json::to_string(&result.outcome.status()).map_err(encode_error)?;
    let _: () = conn.set_ex(status_key(&result.job_id), status, RESULT_TTL_SECS).await?;

    Ok(())
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<JobResult>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data).map_err(decode_error)?)),
        None => Ok(None),
    }
}

pub async fn get_status(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<JobStatus>> {
    let payload: Option<String> = conn.get(status_key(job_id)).await?;

    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data).map_err(decode_error)?)),
        None => Ok(None),
    }
}
