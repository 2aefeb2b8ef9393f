//! Pipeline-run and task-run repository functions.

use chrono::{NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{PipelineRunRow, RunStatus, TaskRunRow, TaskStatus},
};

// ---------------------------------------------------------------------------
// pipeline_runs
// ---------------------------------------------------------------------------

/// Create a new run record in `running` status.
///
/// The partial unique index on `pipeline_runs` rejects a second running row
/// for the same pipeline; that surfaces as [`DbError::RunAlreadyActive`].
pub async fn insert_run(
    pool: &PgPool,
    pipeline_key: &str,
    logical_date: NaiveDate,
) -> Result<PipelineRunRow, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    let result = sqlx::query_as::<_, PipelineRunRow>(
        r#"
        INSERT INTO pipeline_runs (id, pipeline_key, logical_date, status, started_at)
        VALUES ($1, $2, $3, 'running', $4)
        RETURNING id, pipeline_key, logical_date, status, started_at, finished_at
        "#,
    )
    .bind(id)
    .bind(pipeline_key)
    .bind(logical_date)
    .bind(now)
    .fetch_one(pool)
    .await;

    match result {
        Ok(row) => Ok(row),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(DbError::RunAlreadyActive(pipeline_key.to_owned()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Set the terminal status and `finished_at` of a run.
pub async fn finish_run(pool: &PgPool, run_id: Uuid, status: RunStatus) -> Result<(), DbError> {
    let updated = sqlx::query(
        r#"
        UPDATE pipeline_runs
        SET status = $1, finished_at = $2
        WHERE id = $3
        "#,
    )
    .bind(status.to_string())
    .bind(Utc::now())
    .bind(run_id)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Mark a run whose runner died as `cancelled`, along with its unfinished
/// task records, freeing the pipeline's run slot.
///
/// Returns [`DbError::NotFound`] unless the run exists and is still running.
pub async fn release_run(pool: &PgPool, run_id: Uuid) -> Result<(), DbError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"
        UPDATE pipeline_runs
        SET status = $1, finished_at = $2
        WHERE id = $3 AND status = $4
        "#,
    )
    .bind(RunStatus::Cancelled.to_string())
    .bind(now)
    .bind(run_id)
    .bind(RunStatus::Running.to_string())
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    sqlx::query(
        r#"
        UPDATE task_runs
        SET status = $1, finished_at = $2
        WHERE run_id = $3 AND status IN ($4, $5)
        "#,
    )
    .bind(TaskStatus::Cancelled.to_string())
    .bind(now)
    .bind(run_id)
    .bind(TaskStatus::Pending.to_string())
    .bind(TaskStatus::Running.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Most recent runs of a pipeline, newest first.
pub async fn list_runs(
    pool: &PgPool,
    pipeline_key: &str,
    limit: i64,
) -> Result<Vec<PipelineRunRow>, DbError> {
    let rows = sqlx::query_as::<_, PipelineRunRow>(
        r#"
        SELECT id, pipeline_key, logical_date, status, started_at, finished_at
        FROM pipeline_runs
        WHERE pipeline_key = $1
        ORDER BY started_at DESC
        LIMIT $2
        "#,
    )
    .bind(pipeline_key)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// task_runs
// ---------------------------------------------------------------------------

/// Insert or replace the record of one task within a run.
pub async fn upsert_task_run(pool: &PgPool, record: &TaskRunRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO task_runs
            (id, run_id, task_id, status, attempts, message, output, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (run_id, task_id) DO UPDATE
        SET status = EXCLUDED.status,
            attempts = EXCLUDED.attempts,
            message = EXCLUDED.message,
            output = EXCLUDED.output,
            started_at = EXCLUDED.started_at,
            finished_at = EXCLUDED.finished_at
        "#,
    )
    .bind(record.id)
    .bind(record.run_id)
    .bind(&record.task_id)
    .bind(&record.status)
    .bind(record.attempts)
    .bind(&record.message)
    .bind(&record.output)
    .bind(record.started_at)
    .bind(record.finished_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// All task records of a run, in the order they were first written.
pub async fn list_task_runs(pool: &PgPool, run_id: Uuid) -> Result<Vec<TaskRunRow>, DbError> {
    let rows = sqlx::query_as::<_, TaskRunRow>(
        r#"
        SELECT id, run_id, task_id, status, attempts, message, output, started_at, finished_at
        FROM task_runs
        WHERE run_id = $1
        ORDER BY started_at NULLS LAST, task_id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
