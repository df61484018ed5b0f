//! Postgres-backed task queue.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of processors can poll
//! the same table without handing one task to two of them. Settles are
//! fenced on `lease_id`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use postbox_core::TaskId;

use super::store::{QueueError, QueueStats, TaskQueueStore, LEASE_EXPIRED};
use super::types::{NewTask, Task, TaskState};

const TASK_COLUMNS: &str = "id, task_type, payload, queue, state, max_retry, retry_count, \
     process_at, lease_id, last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    /// The `tasks` table is created by `PgStore::migrate`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    QueueError::Storage(format!("{operation}: {err}"))
}

fn task_from_row(row: &PgRow) -> Result<Task, QueueError> {
    let decode = |e: sqlx::Error| QueueError::Storage(format!("failed to decode task row: {e}"));
    let count = |v: i32| {
        u32::try_from(v).map_err(|_| QueueError::Storage(format!("negative counter in task row: {v}")))
    };

    let state: String = row.try_get("state").map_err(decode)?;
    let state = TaskState::parse(&state)
        .ok_or_else(|| QueueError::Storage(format!("unknown task state: {state}")))?;

    Ok(Task {
        id: TaskId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
        task_type: row.try_get("task_type").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        queue: row.try_get("queue").map_err(decode)?,
        max_retry: count(row.try_get("max_retry").map_err(decode)?)?,
        retry_count: count(row.try_get("retry_count").map_err(decode)?)?,
        process_at: row.try_get::<DateTime<Utc>, _>("process_at").map_err(decode)?,
        state,
        lease_id: row.try_get::<Option<Uuid>, _>("lease_id").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode)?,
    })
}

fn counter(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// Run an UPDATE that must hit a task active under the caller's lease; tells
/// "missing", "wrong state" and "lease lost" apart.
async fn settle_active(
    pool: &PgPool,
    operation: &str,
    id: TaskId,
    query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
) -> Result<Task, QueueError> {
    match query
        .fetch_optional(pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
    {
        Some(row) => task_from_row(&row),
        None => Err(missing_or_invalid(pool, id).await),
    }
}

async fn missing_or_invalid(pool: &PgPool, id: TaskId) -> QueueError {
    let state = sqlx::query("SELECT state FROM tasks WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(pool)
        .await;

    match state {
        Ok(Some(row)) => match row.try_get::<String, _>("state") {
            Ok(s) => match TaskState::parse(&s) {
                Some(TaskState::Active) => QueueError::LeaseLost(id),
                Some(state) => QueueError::InvalidState { id, state },
                None => QueueError::Storage(format!("unknown task state: {s}")),
            },
            Err(e) => map_sqlx_error("load_state", e),
        },
        Ok(None) => QueueError::NotFound(id),
        Err(e) => map_sqlx_error("load_state", e),
    }
}

#[async_trait]
impl TaskQueueStore for PgTaskQueue {
    #[instrument(skip(self, task), fields(task_type = %task.task_type, queue = %task.queue), err)]
    async fn enqueue(&self, task: NewTask) -> Result<Task, QueueError> {
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (id, task_type, payload, queue, state, max_retry, process_at) \
             VALUES ($1, $2, $3, $4, 'pending', $5, $6) RETURNING {TASK_COLUMNS}"
        ))
        .bind(TaskId::new().as_uuid())
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(&task.queue)
        .bind(counter(task.max_retry))
        .bind(task.process_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        task_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<Task>, QueueError> {
        let row = sqlx::query(&format!(
            "UPDATE tasks SET state = 'active', lease_id = $3, \
                 lease_expires_at = now() + ($2 * interval '1 second'), \
                 updated_at = now() \
             WHERE id = ( \
                 SELECT id FROM tasks \
                 WHERE queue = $1 AND state = 'pending' AND process_at <= now() \
                 ORDER BY process_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(queue)
        .bind(lease.as_secs_f64())
        .bind(Uuid::new_v4())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn reap_expired(&self, queue: &str) -> Result<Vec<Task>, QueueError> {
        // SET expressions see the pre-update row, so every CASE branches on
        // the retry count the task had when its lease ran out.
        let rows = sqlx::query(&format!(
            "UPDATE tasks SET \
                 state = CASE WHEN retry_count < max_retry THEN 'pending' ELSE 'archived' END, \
                 retry_count = CASE WHEN retry_count < max_retry \
                     THEN retry_count + 1 ELSE retry_count END, \
                 process_at = CASE WHEN retry_count < max_retry \
                     THEN now() ELSE process_at END, \
                 last_error = $2, lease_id = NULL, lease_expires_at = NULL, updated_at = now() \
             WHERE id IN ( \
                 SELECT id FROM tasks \
                 WHERE queue = $1 AND state = 'active' AND lease_expires_at <= now() \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(queue)
        .bind(LEASE_EXPIRED)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired", e))?;

        let mut reaped = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        reaped.sort_by_key(|t| t.id);
        Ok(reaped)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn complete(&self, id: TaskId, lease_id: Uuid) -> Result<(), QueueError> {
        let result =
            sqlx::query("DELETE FROM tasks WHERE id = $1 AND state = 'active' AND lease_id = $2")
                .bind(id.as_uuid())
                .bind(lease_id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(missing_or_invalid(&self.pool, id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(task_id = %id), err)]
    async fn reschedule(
        &self,
        id: TaskId,
        lease_id: Uuid,
        retry_count: u32,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Task, QueueError> {
        let sql = format!(
            "UPDATE tasks SET state = 'pending', retry_count = $2, process_at = $3, \
                 last_error = $4, lease_id = NULL, lease_expires_at = NULL, updated_at = now() \
             WHERE id = $1 AND state = 'active' AND lease_id = $5 RETURNING {TASK_COLUMNS}"
        );
        let query = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(counter(retry_count))
            .bind(process_at)
            .bind(error)
            .bind(lease_id);

        settle_active(&self.pool, "reschedule", id, query).await
    }

    #[instrument(skip(self, error), fields(task_id = %id), err)]
    async fn archive(&self, id: TaskId, lease_id: Uuid, error: &str) -> Result<Task, QueueError> {
        let sql = format!(
            "UPDATE tasks SET state = 'archived', last_error = $2, \
                 lease_id = NULL, lease_expires_at = NULL, updated_at = now() \
             WHERE id = $1 AND state = 'active' AND lease_id = $3 RETURNING {TASK_COLUMNS}"
        );
        let query = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(error)
            .bind(lease_id);

        settle_active(&self.pool, "archive", id, query).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_archived(&self, queue: &str, limit: usize) -> Result<Vec<Task>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE queue = $1 AND state = 'archived' \
             ORDER BY updated_at DESC LIMIT $2"
        ))
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_archived", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn requeue_archived(&self, id: TaskId) -> Result<Task, QueueError> {
        let row = sqlx::query(&format!(
            "UPDATE tasks SET state = 'pending', retry_count = 0, process_at = now(), \
                 updated_at = now() \
             WHERE id = $1 AND state = 'archived' RETURNING {TASK_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_archived", e))?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(missing_or_invalid(&self.pool, id).await),
        }
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            "SELECT \
                 COUNT(*) FILTER (WHERE state = 'pending' AND process_at <= now()) AS pending, \
                 COUNT(*) FILTER (WHERE state = 'pending' AND process_at > now()) AS scheduled, \
                 COUNT(*) FILTER (WHERE state = 'active') AS active, \
                 COUNT(*) FILTER (WHERE state = 'archived') AS archived \
             FROM tasks WHERE queue = $1",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |name: &str| -> Result<usize, QueueError> {
            let n: i64 = row.try_get(name).map_err(|e| map_sqlx_error("stats", e))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };

        Ok(QueueStats {
            pending: count("pending")?,
            scheduled: count("scheduled")?,
            active: count("active")?,
            archived: count("archived")?,
        })
    }
}
