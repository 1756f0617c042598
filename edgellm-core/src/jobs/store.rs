//! SQLite-backed persistence for jobs and their companion messages.
//!
//! Every round-trip runs through the `database` [`ResiliencePolicy`]. Only
//! infrastructure failures count against its circuit breaker; a missing row
//! or a write to a finished job is reported to the caller without tripping it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::schema::{MIGRATIONS, SELECT_JOB_COLUMNS};
use super::types::{ActiveStream, CreatedJob, Job, JobId, JobStatus};
use crate::error::JobStoreError;
use crate::resilience::ResiliencePolicy;

/// Result type for job store operations
pub type StoreResult<T> = Result<T, JobStoreError>;

const STALE_JOB_MESSAGE: &str = "Job stalled: no progress within the staleness window";
const INTERRUPTED_JOB_MESSAGE: &str = "Job interrupted by restart";

/// Configuration for the job store
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// A processing/streaming job untouched for longer than this is reclaimed
    /// by `cleanup_stale_jobs`. Must exceed realistic generation latency.
    pub stale_after: Duration,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(600), // 10 minutes
        }
    }
}

impl JobStoreConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("EDGELLM_STALE_JOB_SECS") {
            if let Ok(n) = val.parse() {
                config.stale_after = Duration::from_secs(n);
            }
        }

        config
    }
}

/// Durable job records plus the in-memory registry of running streams
pub struct JobStore {
    pool: SqlitePool,
    config: JobStoreConfig,
    policy: ResiliencePolicy,
    streams: Mutex<HashMap<JobId, ActiveStream>>,
}

impl JobStore {
    pub fn new(pool: SqlitePool, config: JobStoreConfig) -> Self {
        Self::with_policy(pool, config, ResiliencePolicy::database())
    }

    pub fn with_policy(pool: SqlitePool, config: JobStoreConfig, policy: ResiliencePolicy) -> Self {
        Self { pool, config, policy, streams: Mutex::new(HashMap::new()) }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    /// Create the tables and indexes if they do not exist yet
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Job store schema ready");
        Ok(())
    }

    async fn resilient<F, Fut, T>(&self, operation: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.policy.execute_classified(operation, JobStoreError::is_infrastructure).await
    }

    /// Insert a pending job and its placeholder assistant message atomically
    pub async fn create_job(
        &self,
        conversation_id: i64,
        job_type: &str,
        model: &str,
        priority: i32,
    ) -> StoreResult<CreatedJob> {
        let created = self
            .resilient(move || async move {
                let mut tx = self.pool.begin().await?;
                let outcome =
                    insert_job_rows(&mut tx, conversation_id, job_type, model, priority).await;
                commit_or_rollback(tx, outcome).await
            })
            .await?;

        debug!(
            job_id = %created.job_id,
            message_id = created.message_id,
            conversation_id,
            model = %model,
            "Job created"
        );
        Ok(created)
    }

    /// Append output deltas and replace sources.
    ///
    /// Nothing to write means no database round-trip at all.
    pub async fn update_job_content(
        &self,
        job_id: JobId,
        content_delta: Option<&str>,
        thinking_delta: Option<&str>,
        sources: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        let content_delta = content_delta.unwrap_or_default();
        let thinking_delta = thinking_delta.unwrap_or_default();
        if content_delta.is_empty() && thinking_delta.is_empty() && sources.is_none() {
            return Ok(());
        }

        let sources_json = sources.map(serde_json::to_string).transpose()?;
        let sources_json = sources_json.as_deref();
        let id = job_id.to_string();
        let id = id.as_str();

        self.resilient(move || async move {
            let result = sqlx::query(
                "UPDATE jobs SET content = content || ?, thinking = thinking || ?, \
                 sources = COALESCE(?, sources), updated_at = ? \
                 WHERE id = ? AND status IN ('pending', 'processing', 'streaming')",
            )
            .bind(content_delta)
            .bind(thinking_delta)
            .bind(sources_json)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }

            match fetch_status(&self.pool, id).await? {
                None => Err(JobStoreError::NotFound(job_id)),
                Some(status) => Err(JobStoreError::TerminalState { job_id, status }),
            }
        })
        .await
    }

    /// Move a pending job to processing
    pub async fn start_job(&self, job_id: JobId) -> StoreResult<()> {
        self.transition(job_id, JobStatus::Pending, JobStatus::Processing).await
    }

    /// Move a processing job to streaming once the first output arrives
    pub async fn mark_streaming(&self, job_id: JobId) -> StoreResult<()> {
        self.transition(job_id, JobStatus::Processing, JobStatus::Streaming).await
    }

    async fn transition(&self, job_id: JobId, from: JobStatus, to: JobStatus) -> StoreResult<()> {
        let id = job_id.to_string();
        let id = id.as_str();

        self.resilient(move || async move {
            let result =
                sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                    .bind(to.as_str())
                    .bind(now_ms())
                    .bind(id)
                    .bind(from.as_str())
                    .execute(&self.pool)
                    .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }

            match fetch_status(&self.pool, id).await? {
                None => Err(JobStoreError::NotFound(job_id)),
                Some(status) if status.is_terminal() => {
                    Err(JobStoreError::TerminalState { job_id, status })
                }
                Some(status) => Err(JobStoreError::InvalidTransition { job_id, from: status, to }),
            }
        })
        .await
    }

    /// Copy the accumulated output onto the companion message and mark the
    /// job completed.
    ///
    /// A job deleted in the meantime (conversation removed) is logged and
    /// treated as done.
    pub async fn complete_job(&self, job_id: JobId) -> StoreResult<()> {
        let id = job_id.to_string();
        let id = id.as_str();

        let completed = self
            .resilient(move || async move {
                let mut tx = self.pool.begin().await?;
                let outcome = complete_job_rows(&mut tx, job_id, id).await;
                commit_or_rollback(tx, outcome).await
            })
            .await?;

        if completed {
            debug!(job_id = %job_id, "Job completed");
        } else {
            warn!(job_id = %job_id, "Job vanished before completion, nothing to finalize");
        }
        Ok(())
    }

    /// Mark a job failed with `message`. The message row keeps its content.
    pub async fn error_job(&self, job_id: JobId, message: &str) -> StoreResult<()> {
        let id = job_id.to_string();
        let id = id.as_str();

        let updated = self
            .resilient(move || async move {
                let mut tx = self.pool.begin().await?;
                let outcome = error_job_rows(&mut tx, job_id, id, message).await;
                commit_or_rollback(tx, outcome).await
            })
            .await?;

        if updated {
            debug!(job_id = %job_id, error = %message, "Job marked as error");
        } else {
            warn!(job_id = %job_id, "Job vanished before it could be marked as error");
        }
        Ok(())
    }

    /// Mark a job cancelled and fire its stream's cancellation token.
    ///
    /// Returns `false` when the job is missing or already finished.
    pub async fn cancel_job(&self, job_id: JobId) -> StoreResult<bool> {
        if let Some(stream) = self.lock_streams().remove(&job_id) {
            stream.cancel.cancel();
        }

        let id = job_id.to_string();
        let id = id.as_str();

        let cancelled = self
            .resilient(move || async move {
                let mut tx = self.pool.begin().await?;
                let outcome = cancel_job_rows(&mut tx, id).await;
                commit_or_rollback(tx, outcome).await
            })
            .await?;

        if cancelled {
            debug!(job_id = %job_id, "Job cancelled");
        }
        Ok(cancelled)
    }

    pub async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        let id = job_id.to_string();
        let id = id.as_str();
        let query = format!("{} WHERE id = ?", SELECT_JOB_COLUMNS);
        let query = query.as_str();

        self.resilient(move || async move {
            let row = sqlx::query(query).bind(id).fetch_optional(&self.pool).await?;
            row.as_ref().map(job_from_row).transpose()
        })
        .await
    }

    /// Jobs with the given status, oldest first
    pub async fn list_jobs_by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let query = format!("{} WHERE status = ? ORDER BY created_at ASC", SELECT_JOB_COLUMNS);
        let query = query.as_str();

        self.resilient(move || async move {
            let rows = sqlx::query(query).bind(status.as_str()).fetch_all(&self.pool).await?;
            rows.iter().map(job_from_row).collect()
        })
        .await
    }

    /// Persist a new priority for a pending job. Returns `false` otherwise.
    pub async fn set_priority(&self, job_id: JobId, priority: i32) -> StoreResult<bool> {
        let id = job_id.to_string();
        let id = id.as_str();

        self.resilient(move || async move {
            let result = sqlx::query(
                "UPDATE jobs SET priority = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
            )
            .bind(priority)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Remove a job and its message row
    pub async fn delete_job(&self, job_id: JobId) -> StoreResult<bool> {
        self.clear_stream(job_id);

        let id = job_id.to_string();
        let id = id.as_str();

        self.resilient(move || async move {
            let mut tx = self.pool.begin().await?;
            let outcome = delete_job_rows(&mut tx, id).await;
            commit_or_rollback(tx, outcome).await
        })
        .await
    }

    /// Reclaim processing/streaming jobs that stopped making progress.
    ///
    /// Jobs with a registered active stream are never touched. The update is
    /// conditional on the row still being stale, so concurrent sweeps do not
    /// double count.
    pub async fn cleanup_stale_jobs(&self) -> StoreResult<usize> {
        let stale_ms = i64::try_from(self.config.stale_after.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(stale_ms);

        let candidates: Vec<String> = self
            .resilient(move || async move {
                let rows = sqlx::query(
                    "SELECT id FROM jobs WHERE status IN ('processing', 'streaming') \
                     AND updated_at < ?",
                )
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
                rows.iter()
                    .map(|row| row.try_get::<String, _>("id").map_err(JobStoreError::from))
                    .collect()
            })
            .await?;

        let mut reclaimed = 0;
        for id in candidates {
            let job_id: JobId =
                id.parse().map_err(|_| JobStoreError::corrupt(format!("job id '{}'", id)))?;
            if self.is_stream_active(job_id) {
                continue;
            }

            let id = id.as_str();
            let updated = self
                .resilient(move || async move {
                    let mut tx = self.pool.begin().await?;
                    let outcome = reclaim_stale_rows(&mut tx, id, cutoff).await;
                    commit_or_rollback(tx, outcome).await
                })
                .await?;

            if updated {
                warn!(job_id = %job_id, "Reclaimed stale job");
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            info!(count = reclaimed, "Stale job cleanup finished");
        }
        Ok(reclaimed)
    }

    /// Fail every job a previous process left unfinished.
    ///
    /// Payloads live only in memory, so such jobs can never resume.
    pub async fn fail_interrupted_jobs(&self) -> StoreResult<usize> {
        let failed = self
            .resilient(move || async move {
                let mut tx = self.pool.begin().await?;
                let outcome = fail_interrupted_rows(&mut tx).await;
                commit_or_rollback(tx, outcome).await
            })
            .await?;

        if failed > 0 {
            warn!(count = failed, "Marked jobs interrupted by restart as error");
        }
        Ok(failed)
    }

    pub fn register_stream(&self, job_id: JobId, cancel: CancellationToken) {
        self.lock_streams().insert(job_id, ActiveStream { cancel, started_at: Instant::now() });
    }

    pub fn is_stream_active(&self, job_id: JobId) -> bool {
        self.lock_streams().contains_key(&job_id)
    }

    pub fn get_active_stream(&self, job_id: JobId) -> Option<ActiveStream> {
        self.lock_streams().get(&job_id).cloned()
    }

    /// Forget the stream without cancelling it
    pub fn clear_stream(&self, job_id: JobId) -> bool {
        self.lock_streams().remove(&job_id).is_some()
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<JobId, ActiveStream>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Commit on success, roll back on failure.
///
/// A failed rollback is logged and the original error returned; the
/// connection goes back to the pool either way.
async fn commit_or_rollback<T>(
    tx: Transaction<'_, Sqlite>,
    outcome: StoreResult<T>,
) -> StoreResult<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Transaction rollback failed");
            }
            Err(err)
        }
    }
}

async fn insert_job_rows(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: i64,
    job_type: &str,
    model: &str,
    priority: i32,
) -> StoreResult<CreatedJob> {
    let job_id = JobId::new();
    let now = now_ms();

    sqlx::query(
        "INSERT INTO jobs (id, conversation_id, type, status, model, priority, created_at, updated_at) \
         VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)",
    )
    .bind(job_id.to_string())
    .bind(conversation_id)
    .bind(job_type)
    .bind(model)
    .bind(priority)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let message_id = sqlx::query(
        "INSERT INTO messages (conversation_id, role, content, thinking, status, created_at, updated_at) \
         VALUES (?, 'assistant', '', '', 'pending', ?, ?)",
    )
    .bind(conversation_id)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    sqlx::query("UPDATE jobs SET message_id = ? WHERE id = ?")
        .bind(message_id)
        .bind(job_id.to_string())
        .execute(&mut **tx)
        .await?;

    Ok(CreatedJob { job_id, message_id })
}

/// Returns `false` when the job row no longer exists
async fn complete_job_rows(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: JobId,
    id: &str,
) -> StoreResult<bool> {
    let row = sqlx::query("SELECT status, content, thinking, sources, message_id FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Ok(false);
    };

    let status = parse_status(&row.try_get::<String, _>("status")?)?;
    if status.is_terminal() {
        return Err(JobStoreError::TerminalState { job_id, status });
    }

    let content: String = row.try_get("content")?;
    let thinking: String = row.try_get("thinking")?;
    let sources: Option<String> = row.try_get("sources")?;
    let message_id: Option<i64> = row.try_get("message_id")?;
    let now = now_ms();

    if let Some(message_id) = message_id {
        sqlx::query(
            "UPDATE messages SET content = ?, thinking = ?, sources = ?, status = 'completed', \
             updated_at = ? WHERE id = ?",
        )
        .bind(&content)
        .bind(&thinking)
        .bind(&sources)
        .bind(now)
        .bind(message_id)
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query("UPDATE jobs SET status = 'completed', updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await?;

    Ok(true)
}

/// Returns `false` when the job row no longer exists
async fn error_job_rows(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: JobId,
    id: &str,
    message: &str,
) -> StoreResult<bool> {
    let Some(status) = fetch_status(&mut **tx, id).await? else {
        return Ok(false);
    };
    if status.is_terminal() {
        return Err(JobStoreError::TerminalState { job_id, status });
    }

    let now = now_ms();
    sqlx::query("UPDATE jobs SET status = 'error', error_message = ?, updated_at = ? WHERE id = ?")
        .bind(message)
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "UPDATE messages SET status = 'error', updated_at = ? \
         WHERE id = (SELECT message_id FROM jobs WHERE id = ?)",
    )
    .bind(now)
    .bind(id)
    .execute(&mut **tx)
    .await?;

    Ok(true)
}

/// Returns `false` when the job is missing or already finished
async fn cancel_job_rows(tx: &mut Transaction<'_, Sqlite>, id: &str) -> StoreResult<bool> {
    let Some(status) = fetch_status(&mut **tx, id).await? else {
        return Ok(false);
    };
    if status.is_terminal() {
        return Ok(false);
    }

    let now = now_ms();
    sqlx::query("UPDATE jobs SET status = 'cancelled', updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await?;

    // Partial output stays visible on the message
    sqlx::query(
        "UPDATE messages SET status = 'cancelled', \
         content = (SELECT content FROM jobs WHERE id = ?1), \
         thinking = (SELECT thinking FROM jobs WHERE id = ?1), \
         sources = (SELECT sources FROM jobs WHERE id = ?1), \
         updated_at = ?2 \
         WHERE id = (SELECT message_id FROM jobs WHERE id = ?1)",
    )
    .bind(id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(true)
}

async fn delete_job_rows(tx: &mut Transaction<'_, Sqlite>, id: &str) -> StoreResult<bool> {
    sqlx::query("DELETE FROM messages WHERE id = (SELECT message_id FROM jobs WHERE id = ?)")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    let result = sqlx::query("DELETE FROM jobs WHERE id = ?").bind(id).execute(&mut **tx).await?;
    Ok(result.rows_affected() > 0)
}

async fn reclaim_stale_rows(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    cutoff: i64,
) -> StoreResult<bool> {
    let now = now_ms();
    let result = sqlx::query(
        "UPDATE jobs SET status = 'error', error_message = ?, updated_at = ? \
         WHERE id = ? AND status IN ('processing', 'streaming') AND updated_at < ?",
    )
    .bind(STALE_JOB_MESSAGE)
    .bind(now)
    .bind(id)
    .bind(cutoff)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE messages SET status = 'error', updated_at = ? \
         WHERE id = (SELECT message_id FROM jobs WHERE id = ?)",
    )
    .bind(now)
    .bind(id)
    .execute(&mut **tx)
    .await?;

    Ok(true)
}

async fn fail_interrupted_rows(tx: &mut Transaction<'_, Sqlite>) -> StoreResult<usize> {
    let now = now_ms();

    sqlx::query(
        "UPDATE messages SET status = 'error', updated_at = ? WHERE id IN \
         (SELECT message_id FROM jobs WHERE status IN ('pending', 'processing', 'streaming'))",
    )
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let result = sqlx::query(
        "UPDATE jobs SET status = 'error', error_message = ?, updated_at = ? \
         WHERE status IN ('pending', 'processing', 'streaming')",
    )
    .bind(INTERRUPTED_JOB_MESSAGE)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() as usize)
}

async fn fetch_status<'e, E>(executor: E, id: &str) -> StoreResult<Option<JobStatus>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    status.as_deref().map(parse_status).transpose()
}

fn parse_status(value: &str) -> StoreResult<JobStatus> {
    value.parse().map_err(|_| JobStoreError::corrupt(format!("status '{}'", value)))
}

fn job_from_row(row: &SqliteRow) -> StoreResult<Job> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let sources: Option<String> = row.try_get("sources")?;

    Ok(Job {
        id: id.parse().map_err(|_| JobStoreError::corrupt(format!("job id '{}'", id)))?,
        conversation_id: row.try_get("conversation_id")?,
        message_id: row.try_get("message_id")?,
        job_type: row.try_get("type")?,
        status: parse_status(&status)?,
        content: row.try_get("content")?,
        thinking: row.try_get("thinking")?,
        sources: sources.as_deref().map(serde_json::from_str).transpose()?,
        model: row.try_get("model")?,
        priority: row.try_get("priority")?,
        queue_position: None,
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| JobStoreError::corrupt(format!("timestamp {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, RetryConfig};
    use sqlx::sqlite::SqlitePoolOptions;
    use tracing_test::traced_test;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    async fn create_store(config: JobStoreConfig) -> JobStore {
        let store = JobStore::new(create_test_pool().await, config);
        store.migrate().await.unwrap();
        store
    }

    async fn message_row(store: &JobStore, message_id: i64) -> (String, String, String) {
        let row = sqlx::query("SELECT content, thinking, status FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        (row.get("content"), row.get("thinking"), row.get("status"))
    }

    async fn backdate(store: &JobStore, job_id: JobId, by: Duration) {
        sqlx::query("UPDATE jobs SET updated_at = updated_at - ? WHERE id = ?")
            .bind(by.as_millis() as i64)
            .bind(job_id.to_string())
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_job_links_message() {
        let store = create_store(JobStoreConfig::default()).await;

        let created = store.create_job(7, "chat", "llama3.2:3b", 0).await.unwrap();
        let job = store.get_job(created.job_id).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.message_id, Some(created.message_id));
        assert_eq!(job.conversation_id, 7);
        assert_eq!(job.job_type, "chat");
        assert_eq!(job.content, "");

        let (content, _, status) = message_row(&store, created.message_id).await;
        assert_eq!(content, "");
        assert_eq!(status, "pending");
    }

    #[tokio::test]
    async fn test_create_job_rolls_back_on_failure() {
        let store = create_store(JobStoreConfig::default()).await;
        sqlx::query("DROP TABLE messages").execute(store.pool()).await.unwrap();

        let result = store.create_job(1, "chat", "llama3.2:3b", 0).await;
        assert!(matches!(result, Err(JobStoreError::Database(_))));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_deltas_concatenate_in_order() {
        let store = create_store(JobStoreConfig::default()).await;
        let created = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        store.start_job(created.job_id).await.unwrap();

        for (token, thought) in [("Hel", Some("hm")), ("lo", None), (" world", Some("..."))] {
            store
                .update_job_content(created.job_id, Some(token), thought, None)
                .await
                .unwrap();
        }
        let sources = serde_json::json!([{"title": "manual.pdf"}]);
        store.update_job_content(created.job_id, None, None, Some(&sources)).await.unwrap();

        let job = store.get_job(created.job_id).await.unwrap().unwrap();
        assert_eq!(job.content, "Hello world");
        assert_eq!(job.thinking, "hm...");
        assert_eq!(job.sources, Some(sources));
    }

    #[tokio::test]
    async fn test_empty_update_is_noop() {
        let store = create_store(JobStoreConfig::default()).await;
        // No row exists, yet nothing is read or written
        store.update_job_content(JobId::new(), None, Some(""), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_after_terminal_is_rejected() {
        let store = create_store(JobStoreConfig::default()).await;
        let created = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        store.start_job(created.job_id).await.unwrap();
        store.complete_job(created.job_id).await.unwrap();

        let result = store.update_job_content(created.job_id, Some("late"), None, None).await;
        assert!(matches!(
            result,
            Err(JobStoreError::TerminalState { status: JobStatus::Completed, .. })
        ));

        let missing = store.update_job_content(JobId::new(), Some("x"), None, None).await;
        assert!(matches!(missing, Err(JobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_complete_copies_output_to_message() {
        let store = create_store(JobStoreConfig::default()).await;
        let created = store.create_job(1, "rag", "llama3.2:3b", 0).await.unwrap();
        store.start_job(created.job_id).await.unwrap();
        store.mark_streaming(created.job_id).await.unwrap();
        store
            .update_job_content(created.job_id, Some("answer"), Some("reasoning"), None)
            .await
            .unwrap();

        store.complete_job(created.job_id).await.unwrap();

        let job = store.get_job(created.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let (content, thinking, status) = message_row(&store, created.message_id).await;
        assert_eq!(content, "answer");
        assert_eq!(thinking, "reasoning");
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_complete_after_delete_logs_warning() {
        let store = create_store(JobStoreConfig::default()).await;
        let created = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        store.start_job(created.job_id).await.unwrap();
        assert!(store.delete_job(created.job_id).await.unwrap());

        store.complete_job(created.job_id).await.unwrap();

        assert!(logs_contain("Job vanished before completion"));
    }

    #[tokio::test]
    async fn test_error_job_keeps_message_content() {
        let store = create_store(JobStoreConfig::default()).await;
        let created = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        store.start_job(created.job_id).await.unwrap();
        store.update_job_content(created.job_id, Some("partial"), None, None).await.unwrap();

        store.error_job(created.job_id, "model crashed").await.unwrap();

        let job = store.get_job(created.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message.as_deref(), Some("model crashed"));
        let (content, _, status) = message_row(&store, created.message_id).await;
        assert_eq!(content, "");
        assert_eq!(status, "error");
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_fires_token() {
        let store = create_store(JobStoreConfig::default()).await;
        let created = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        store.start_job(created.job_id).await.unwrap();
        store.update_job_content(created.job_id, Some("half"), None, None).await.unwrap();

        let token = CancellationToken::new();
        store.register_stream(created.job_id, token.clone());
        assert!(store.is_stream_active(created.job_id));

        assert!(store.cancel_job(created.job_id).await.unwrap());
        assert!(token.is_cancelled());
        assert!(!store.is_stream_active(created.job_id));

        assert!(!store.cancel_job(created.job_id).await.unwrap());

        let (content, _, status) = message_row(&store, created.message_id).await;
        assert_eq!(content, "half");
        assert_eq!(status, "cancelled");
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let store = create_store(JobStoreConfig::default()).await;
        let created = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();

        let result = store.mark_streaming(created.job_id).await;
        assert!(matches!(
            result,
            Err(JobStoreError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Streaming,
                ..
            })
        ));

        assert!(matches!(store.start_job(JobId::new()).await, Err(JobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cleanup_skips_active_streams() {
        let store = create_store(JobStoreConfig { stale_after: Duration::from_secs(60) }).await;

        let stale = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        let active = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        let fresh = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        let waiting = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        for created in [&stale, &active, &fresh] {
            store.start_job(created.job_id).await.unwrap();
        }
        for created in [&stale, &active, &waiting] {
            backdate(&store, created.job_id, Duration::from_secs(120)).await;
        }
        store.register_stream(active.job_id, CancellationToken::new());

        assert_eq!(store.cleanup_stale_jobs().await.unwrap(), 1);
        assert_eq!(store.cleanup_stale_jobs().await.unwrap(), 0);

        let status = |job: Option<Job>| job.map(|j| j.status);
        assert_eq!(status(store.get_job(stale.job_id).await.unwrap()), Some(JobStatus::Error));
        assert_eq!(
            status(store.get_job(active.job_id).await.unwrap()),
            Some(JobStatus::Processing)
        );
        assert_eq!(status(store.get_job(fresh.job_id).await.unwrap()), Some(JobStatus::Processing));
        assert_eq!(status(store.get_job(waiting.job_id).await.unwrap()), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_fail_interrupted_jobs() {
        let store = create_store(JobStoreConfig::default()).await;
        let pending = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        let running = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        let done = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();
        store.start_job(running.job_id).await.unwrap();
        store.start_job(done.job_id).await.unwrap();
        store.complete_job(done.job_id).await.unwrap();

        assert_eq!(store.fail_interrupted_jobs().await.unwrap(), 2);

        let errored = store.list_jobs_by_status(JobStatus::Error).await.unwrap();
        let mut ids: Vec<JobId> = errored.iter().map(|j| j.id).collect();
        ids.sort();
        let mut expected = vec![pending.job_id, running.job_id];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(errored
            .iter()
            .all(|j| j.error_message.as_deref() == Some(INTERRUPTED_JOB_MESSAGE)));
        assert_eq!(store.list_jobs_by_status(JobStatus::Completed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_priority_only_for_pending() {
        let store = create_store(JobStoreConfig::default()).await;
        let created = store.create_job(1, "chat", "llama3.2:3b", 0).await.unwrap();

        assert!(store.set_priority(created.job_id, 5).await.unwrap());
        assert_eq!(store.get_job(created.job_id).await.unwrap().unwrap().priority, 5);

        store.start_job(created.job_id).await.unwrap();
        assert!(!store.set_priority(created.job_id, 9).await.unwrap());
    }

    #[tokio::test]
    async fn test_database_failures_open_breaker() {
        let pool = create_test_pool().await;
        let policy = ResiliencePolicy::new(
            "database",
            RetryConfig::new().max_attempts(1),
            CircuitBreakerConfig::new().failure_threshold(2),
        );
        // No schema: every query fails at the database
        let store = JobStore::with_policy(pool, JobStoreConfig::default(), policy);

        for _ in 0..2 {
            assert!(matches!(store.get_job(JobId::new()).await, Err(JobStoreError::Database(_))));
        }
        assert!(matches!(store.get_job(JobId::new()).await, Err(JobStoreError::CircuitOpen(_))));
    }
}
