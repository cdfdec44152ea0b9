//! Redis Manager - queue intake and result delivery
//!
//! This module handles all Redis-related operations including:
//! - Worker ID allocation and lease management
//! - Job queue operations (BLPOP)
//! - Result storage and publishing
//! - Cancellation flags

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::jobs::{RunJob, RunJobResult};

/// Redis key constants
pub mod keys {
    /// Worker lease key prefix for distributed worker ID allocation
    pub const WORKER_LEASE_PREFIX: &str = "coderun:worker:lease:";

    /// Run job queue key
    pub const RUN_QUEUE: &str = "coderun:queue";

    /// Run result key prefix (for polling)
    pub const RUN_RESULT_PREFIX: &str = "coderun:result:";

    /// Run result channel (for pub/sub)
    pub const RUN_RESULT_CHANNEL: &str = "coderun:results";

    /// Cancellation flag prefix; the flag exists while the job should stop
    pub const CANCEL_PREFIX: &str = "coderun:cancel:";

    pub fn result_key(job_id: &str) -> String {
        format!("{}{}", RUN_RESULT_PREFIX, job_id)
    }

    pub fn cancel_key(job_id: &str) -> String {
        format!("{}{}", CANCEL_PREFIX, job_id)
    }
}

/// Configuration constants
const MAX_WORKERS: u32 = 10;
const WORKER_LEASE_TTL_SECS: u64 = 120;
const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// Redis manager owning the queue connection and the worker lease
pub struct RedisManager {
    worker_id: u32,
    client: redis::Client,
    conn: MultiplexedConnection,
    lease_handle: Option<JoinHandle<()>>,
}

impl RedisManager {
    /// Connect and lease a worker ID.
    ///
    /// With `fixed_worker_id` the lease step is skipped and that ID is used as-is.
    pub async fn connect(redis_url: &str, fixed_worker_id: Option<u32>) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        let (worker_id, lease_handle) = match fixed_worker_id {
            Some(id) => {
                info!("Using configured worker_id={}", id);
                (id, None)
            }
            None => {
                let id = allocate_worker_id(&client).await?;
                info!("Allocated worker_id={} (lease {}s)", id, WORKER_LEASE_TTL_SECS);
                (id, Some(spawn_lease_heartbeat(client.clone(), id)))
            }
        };

        Ok(Self {
            worker_id,
            client,
            conn,
            lease_handle,
        })
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Handle for storing results and polling cancel flags from job tasks
    pub fn result_sink(&self) -> ResultSink {
        ResultSink {
            client: self.client.clone(),
            conn: self.conn.clone(),
        }
    }

    /// Block and wait for the next job from the queue.
    ///
    /// This uses BLPOP to efficiently wait for jobs without polling.
    /// Malformed jobs are logged and skipped. Reconnects on connection failure.
    pub async fn pop_job(&mut self) -> Result<RunJob> {
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(keys::RUN_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.conn = get_connection_with_retry(&self.client).await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<RunJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }
}

impl Drop for RedisManager {
    fn drop(&mut self) {
        if let Some(handle) = &self.lease_handle {
            handle.abort();
        }
    }
}

/// Cloneable handle used by job tasks
#[derive(Clone)]
pub struct ResultSink {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl ResultSink {
    /// Store a run result in Redis.
    ///
    /// The result is stored with a 1-hour expiration and also published
    /// to a channel for real-time subscribers.
    pub async fn store_result(&mut self, result: &RunJobResult) -> Result<()> {
        let key = keys::result_key(&result.job_id);
        let json = serde_json::to_string(result)?;

        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.conn = get_connection_with_retry(&self.client).await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish errors are ignored, there may be no subscribers
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::RUN_RESULT_CHANNEL, &json)
            .await;

        // The flag has no further use once the result is out
        let _ = self
            .conn
            .del::<_, ()>(keys::cancel_key(&result.job_id))
            .await;

        Ok(())
    }

    /// Whether cancellation was requested for a job
    pub async fn is_cancelled(&mut self, job_id: &str) -> Result<bool> {
        let exists: bool = self
            .conn
            .exists(keys::cancel_key(job_id))
            .await
            .context("Failed to read cancel flag")?;
        Ok(exists)
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

/// Allocate a unique worker ID using Redis SET NX with expiration
async fn allocate_worker_id(client: &redis::Client) -> Result<u32> {
    loop {
        let mut conn = get_connection_with_retry(client).await?;

        for worker_id in 0..MAX_WORKERS {
            let key = format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id);
            let claimed: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg("claimed")
                .arg("NX")
                .arg("EX")
                .arg(WORKER_LEASE_TTL_SECS as usize)
                .query_async(&mut conn)
                .await?;

            if claimed.is_some() {
                return Ok(worker_id);
            }
        }

        warn!(
            "No free worker_id (0-{}). Retrying in 1 second...",
            MAX_WORKERS - 1
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Spawn a background task to keep the worker lease alive
fn spawn_lease_heartbeat(client: redis::Client, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(WORKER_LEASE_TTL_SECS / 2);
        let key = format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id);

        loop {
            tokio::time::sleep(interval).await;

            match get_connection_with_retry(&client).await {
                Ok(mut conn) => {
                    if let Err(e) = redis::cmd("EXPIRE")
                        .arg(&key)
                        .arg(WORKER_LEASE_TTL_SECS as usize)
                        .query_async::<()>(&mut conn)
                        .await
                    {
                        warn!("Failed to refresh worker lease {}: {}", worker_id, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to refresh worker lease {} (connection): {}",
                        worker_id, e
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::result_key("42"), "coderun:result:42");
        assert_eq!(keys::cancel_key("42"), "coderun:cancel:42");
        assert!(keys::RUN_QUEUE.starts_with("coderun:"));
    }
}
