//! `RunStore`: where the runner records run and task state.
//!
//! [`PgRunStore`] persists to Postgres through the repository functions;
//! [`MemoryRunStore`] keeps everything in process for local runs and tests.
//! Both refuse to begin a run while another run of the same pipeline is
//! still `running`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{PipelineRunRow, RunStatus, TaskRunRow, TaskStatus};
use crate::repository::runs;
use crate::{DbError, DbPool};

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Claim the pipeline's single run slot and create a `running` run.
    async fn begin_run(
        &self,
        pipeline_key: &str,
        logical_date: NaiveDate,
    ) -> Result<PipelineRunRow, DbError>;

    /// Insert or replace a task's record, keyed by `(run_id, task_id)`.
    async fn record_task(&self, record: &TaskRunRow) -> Result<(), DbError>;

    /// Mark the run terminal, releasing the slot.
    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), DbError>;

    /// Free the slot of a run left `running` by a runner that died, marking
    /// it and its unfinished tasks `cancelled`. [`DbError::NotFound`] unless
    /// the run is still running.
    async fn release_run(&self, run_id: Uuid) -> Result<(), DbError>;

    async fn list_runs(
        &self,
        pipeline_key: &str,
        limit: i64,
    ) -> Result<Vec<PipelineRunRow>, DbError>;

    async fn task_runs(&self, run_id: Uuid) -> Result<Vec<TaskRunRow>, DbError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgRunStore {
    pool: DbPool,
}

impl PgRunStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn begin_run(
        &self,
        pipeline_key: &str,
        logical_date: NaiveDate,
    ) -> Result<PipelineRunRow, DbError> {
        runs::insert_run(&self.pool, pipeline_key, logical_date).await
    }

    async fn record_task(&self, record: &TaskRunRow) -> Result<(), DbError> {
        runs::upsert_task_run(&self.pool, record).await
    }

    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), DbError> {
        runs::finish_run(&self.pool, run_id, status).await
    }

    async fn release_run(&self, run_id: Uuid) -> Result<(), DbError> {
        runs::release_run(&self.pool, run_id).await
    }

    async fn list_runs(
        &self,
        pipeline_key: &str,
        limit: i64,
    ) -> Result<Vec<PipelineRunRow>, DbError> {
        runs::list_runs(&self.pool, pipeline_key, limit).await
    }

    async fn task_runs(&self, run_id: Uuid) -> Result<Vec<TaskRunRow>, DbError> {
        runs::list_task_runs(&self.pool, run_id).await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    runs: Vec<PipelineRunRow>,
    tasks: Vec<TaskRunRow>,
    task_index: HashMap<(Uuid, String), usize>,
}

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn begin_run(
        &self,
        pipeline_key: &str,
        logical_date: NaiveDate,
    ) -> Result<PipelineRunRow, DbError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let running = RunStatus::Running.to_string();
        if state
            .runs
            .iter()
            .any(|r| r.pipeline_key == pipeline_key && r.status == running)
        {
            return Err(DbError::RunAlreadyActive(pipeline_key.to_owned()));
        }

        let row = PipelineRunRow {
            id: Uuid::new_v4(),
            pipeline_key: pipeline_key.to_owned(),
            logical_date,
            status: running,
            started_at: Utc::now(),
            finished_at: None,
        };
        state.runs.push(row.clone());
        Ok(row)
    }

    async fn record_task(&self, record: &TaskRunRow) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (record.run_id, record.task_id.clone());

        match state.task_index.get(&key).copied() {
            Some(i) => {
                let id = state.tasks[i].id;
                state.tasks[i] = TaskRunRow { id, ..record.clone() };
            }
            None => {
                let i = state.tasks.len();
                state.tasks.push(record.clone());
                state.task_index.insert(key, i);
            }
        }
        Ok(())
    }

    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(DbError::NotFound)?;
        run.status = status.to_string();
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn release_run(&self, run_id: Uuid) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();

        let running = RunStatus::Running.to_string();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id && r.status == running)
            .ok_or(DbError::NotFound)?;
        run.status = RunStatus::Cancelled.to_string();
        run.finished_at = Some(now);

        let unfinished = [TaskStatus::Pending.to_string(), TaskStatus::Running.to_string()];
        for task in state.tasks.iter_mut().filter(|t| t.run_id == run_id) {
            if unfinished.contains(&task.status) {
                task.status = TaskStatus::Cancelled.to_string();
                task.finished_at = Some(now);
            }
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        pipeline_key: &str,
        limit: i64,
    ) -> Result<Vec<PipelineRunRow>, DbError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| r.pipeline_key == pipeline_key)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn task_runs(&self, run_id: Uuid) -> Result<Vec<TaskRunRow>, DbError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.tasks.iter().filter(|t| t.run_id == run_id).cloned().collect())
    }
}
