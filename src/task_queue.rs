//! Sweep Task Queue
//!
//! Durable, `FOR UPDATE SKIP LOCKED`-backed queue of pending cascade sweeps
//! and auxiliary jobs, so the Scheduler only has to enqueue work and any
//! number of worker loops can drain it safely without double-processing a
//! row. Mirrors the source's task-result queue: pop marks a row in-flight,
//! success deletes it, failure either requeues with an incremented retry
//! count or moves the row to a dead-letter table once retries are
//! exhausted.
//!
//! NOTE: all queries use runtime-checked `sqlx::query`/`query_as` instead
//! of the compile-time `query!` macros, since the schema is applied by
//! migrations that may not exist at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "database")]
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::config::PolicyKey;
use crate::error::{Categorized, ErrorCategory};

/// Default retry ceiling before a sweep task is moved to the DLQ, matching
/// the source's `MAX_RETRIES`.
pub const MAX_RETRIES: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unknown policy key stored in queue row: {0}")]
    UnknownPolicyKey(String),
}

impl Categorized for TaskQueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            #[cfg(feature = "database")]
            Self::Database(_) => ErrorCategory::Transport,
            Self::UnknownPolicyKey(_) => ErrorCategory::Validation,
        }
    }
}

/// One pending sweep: either a cascade over `scope_root` (when `key` is an
/// entity kind) or an auxiliary job over the same root (sqlite parsing,
/// parsing-error review).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepTask {
    pub id: i64,
    pub key: PolicyKey,
    pub scope_root: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue one sweep. Idempotent: a task for the same `(key, scope_root)`
    /// already awaiting pickup is left alone rather than duplicated.
    async fn enqueue(&self, key: PolicyKey, scope_root: Uuid) -> Result<(), TaskQueueError>;

    /// Atomically claim and return the oldest unclaimed task, or `None` if
    /// the queue is empty.
    async fn pop_next(&self) -> Result<Option<SweepTask>, TaskQueueError>;

    /// Mark a claimed task as done; deletes the row.
    async fn complete(&self, id: i64) -> Result<(), TaskQueueError>;

    /// Release a claimed task back onto the queue with an incremented
    /// retry count, to be retried by the next `pop_next`.
    async fn requeue(&self, id: i64, error: &str) -> Result<(), TaskQueueError>;

    /// Move an exhausted task to the dead-letter table and delete it from
    /// the live queue.
    async fn move_to_dlq(&self, task: &SweepTask, reason: &str) -> Result<(), TaskQueueError>;
}

#[cfg(feature = "database")]
fn policy_key_to_parts(key: &PolicyKey) -> (&'static str, &'static str) {
    match key {
        PolicyKey::Entity(kind) => ("entity", kind.as_str()),
        PolicyKey::Auxiliary(job) => ("auxiliary", job.as_str()),
    }
}

#[cfg(feature = "database")]
fn policy_key_from_parts(category: &str, name: &str) -> Result<PolicyKey, TaskQueueError> {
    match category {
        "entity" => {
            let kind = match name {
                "directory" => crate::entities::EntityKind::Directory,
                "project" => crate::entities::EntityKind::Project,
                "phase" => crate::entities::EntityKind::Phase,
                "elevation" => crate::entities::EntityKind::Elevation,
                other => return Err(TaskQueueError::UnknownPolicyKey(other.to_string())),
            };
            Ok(PolicyKey::Entity(kind))
        }
        "auxiliary" => {
            let job = match name {
                "sqlite_parser" => crate::config::AuxiliaryJob::SqliteParser,
                "parsing_errors" => crate::config::AuxiliaryJob::ParsingErrors,
                other => return Err(TaskQueueError::UnknownPolicyKey(other.to_string())),
            };
            Ok(PolicyKey::Auxiliary(job))
        }
        other => Err(TaskQueueError::UnknownPolicyKey(other.to_string())),
    }
}

#[cfg(feature = "database")]
pub struct PostgresTaskQueue {
    pool: PgPool,
}

#[cfg(feature = "database")]
impl PostgresTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[derive(FromRow)]
struct SweepTaskRow {
    id: i64,
    key_category: String,
    key_name: String,
    scope_root: Uuid,
    enqueued_at: DateTime<Utc>,
    retry_count: i32,
    last_error: Option<String>,
}

#[cfg(feature = "database")]
impl SweepTaskRow {
    fn into_domain(self) -> Result<SweepTask, TaskQueueError> {
        Ok(SweepTask {
            id: self.id,
            key: policy_key_from_parts(&self.key_category, &self.key_name)?,
            scope_root: self.scope_root,
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count,
            last_error: self.last_error,
        })
    }
}

#[cfg(feature = "database")]
#[async_trait::async_trait]
impl TaskQueue for PostgresTaskQueue {
    async fn enqueue(&self, key: PolicyKey, scope_root: Uuid) -> Result<(), TaskQueueError> {
        let (category, name) = policy_key_to_parts(&key);
        sqlx::query(
            r#"
            INSERT INTO sweep_tasks (key_category, key_name, scope_root, enqueued_at, retry_count, claimed_at)
            VALUES ($1, $2, $3, now(), 0, NULL)
            ON CONFLICT (key_category, key_name, scope_root) WHERE claimed_at IS NULL DO NOTHING
            "#,
        )
        .bind(category)
        .bind(name)
        .bind(scope_root)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pop_next(&self) -> Result<Option<SweepTask>, TaskQueueError> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM sweep_tasks
                WHERE claimed_at IS NULL
                ORDER BY enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE sweep_tasks q
            SET claimed_at = now()
            FROM next
            WHERE q.id = next.id
            RETURNING q.id, q.key_category, q.key_name, q.scope_root,
                      q.enqueued_at, q.retry_count, q.last_error
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let task_row = SweepTaskRow {
            id: row.get("id"),
            key_category: row.get("key_category"),
            key_name: row.get("key_name"),
            scope_root: row.get("scope_root"),
            enqueued_at: row.get("enqueued_at"),
            retry_count: row.get("retry_count"),
            last_error: row.get("last_error"),
        };
        Ok(Some(task_row.into_domain()?))
    }

    async fn complete(&self, id: i64) -> Result<(), TaskQueueError> {
        sqlx::query("DELETE FROM sweep_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue(&self, id: i64, error: &str) -> Result<(), TaskQueueError> {
        sqlx::query(
            r#"
            UPDATE sweep_tasks
            SET claimed_at = NULL, retry_count = retry_count + 1, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn move_to_dlq(&self, task: &SweepTask, reason: &str) -> Result<(), TaskQueueError> {
        let (category, name) = policy_key_to_parts(&task.key);
        sqlx::query(
            r#"
            INSERT INTO sweep_task_dlq
                (original_id, key_category, key_name, scope_root, enqueued_at, retry_count, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(task.id)
        .bind(category)
        .bind(name)
        .bind(task.scope_root)
        .bind(task.enqueued_at)
        .bind(task.retry_count)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        self.complete(task.id).await
    }
}

/// In-process fake backing the scheduler/worker tests without a live
/// Postgres instance. Claim semantics are approximated with a simple
/// `claimed` flag guarded by a mutex rather than row locks.
#[cfg(test)]
pub struct InMemoryTaskQueue {
    next_id: std::sync::atomic::AtomicI64,
    rows: tokio::sync::Mutex<Vec<(SweepTask, bool)>>,
    dlq: tokio::sync::Mutex<Vec<(SweepTask, String)>>,
}

#[cfg(test)]
impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicI64::new(1),
            rows: tokio::sync::Mutex::new(Vec::new()),
            dlq: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn dlq_len(&self) -> usize {
        self.dlq.lock().await.len()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, key: PolicyKey, scope_root: Uuid) -> Result<(), TaskQueueError> {
        let mut rows = self.rows.lock().await;
        let duplicate = rows
            .iter()
            .any(|(t, claimed)| !claimed && t.key == key && t.scope_root == scope_root);
        if duplicate {
            return Ok(());
        }
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        rows.push((
            SweepTask {
                id,
                key,
                scope_root,
                enqueued_at: Utc::now(),
                retry_count: 0,
                last_error: None,
            },
            false,
        ));
        Ok(())
    }

    async fn pop_next(&self) -> Result<Option<SweepTask>, TaskQueueError> {
        let mut rows = self.rows.lock().await;
        for (task, claimed) in rows.iter_mut() {
            if !*claimed {
                *claimed = true;
                return Ok(Some(task.clone()));
            }
        }
        Ok(None)
    }

    async fn complete(&self, id: i64) -> Result<(), TaskQueueError> {
        self.rows.lock().await.retain(|(t, _)| t.id != id);
        Ok(())
    }

    async fn requeue(&self, id: i64, error: &str) -> Result<(), TaskQueueError> {
        let mut rows = self.rows.lock().await;
        if let Some((task, claimed)) = rows.iter_mut().find(|(t, _)| t.id == id) {
            task.retry_count += 1;
            task.last_error = Some(error.to_string());
            *claimed = false;
        }
        Ok(())
    }

    async fn move_to_dlq(&self, task: &SweepTask, reason: &str) -> Result<(), TaskQueueError> {
        self.dlq.lock().await.push((task.clone(), reason.to_string()));
        self.complete(task.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKind;

    #[tokio::test]
    async fn enqueue_is_idempotent_while_unclaimed() {
        let queue = InMemoryTaskQueue::new();
        let root = Uuid::new_v4();
        queue.enqueue(PolicyKey::Entity(EntityKind::Directory), root).await.unwrap();
        queue.enqueue(PolicyKey::Entity(EntityKind::Directory), root).await.unwrap();
        assert_eq!(queue.rows.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn requeue_increments_retry_and_unclaims() {
        let queue = InMemoryTaskQueue::new();
        let root = Uuid::new_v4();
        queue.enqueue(PolicyKey::Entity(EntityKind::Directory), root).await.unwrap();
        let task = queue.pop_next().await.unwrap().unwrap();
        queue.requeue(task.id, "boom").await.unwrap();

        let task = queue.pop_next().await.unwrap().unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn move_to_dlq_removes_from_live_queue() {
        let queue = InMemoryTaskQueue::new();
        let root = Uuid::new_v4();
        queue.enqueue(PolicyKey::Entity(EntityKind::Directory), root).await.unwrap();
        let task = queue.pop_next().await.unwrap().unwrap();
        queue.move_to_dlq(&task, "exhausted retries").await.unwrap();

        assert!(queue.pop_next().await.unwrap().is_none());
        assert_eq!(queue.dlq_len().await, 1);
    }
}
