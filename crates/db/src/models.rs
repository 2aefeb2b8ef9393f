//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// pipeline_runs
// ---------------------------------------------------------------------------

/// Possible statuses for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running   => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed    => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running"   => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A persisted pipeline run row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRunRow {
    pub id: Uuid,
    /// `dataset.pipeline`
    pub pipeline_key: String,
    pub logical_date: NaiveDate,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// task_runs
// ---------------------------------------------------------------------------

/// Possible statuses for one task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// A predecessor failed; the task was never dispatched.
    UpstreamFailed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending        => write!(f, "pending"),
            Self::Running        => write!(f, "running"),
            Self::Succeeded      => write!(f, "succeeded"),
            Self::Failed         => write!(f, "failed"),
            Self::UpstreamFailed => write!(f, "upstream_failed"),
            Self::Cancelled      => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"         => Ok(Self::Pending),
            "running"         => Ok(Self::Running),
            "succeeded"       => Ok(Self::Succeeded),
            "failed"          => Ok(Self::Failed),
            "upstream_failed" => Ok(Self::UpstreamFailed),
            "cancelled"       => Ok(Self::Cancelled),
            other             => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted task run row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRunRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub task_id: String,
    pub status: String,
    pub attempts: i32,
    /// Error message of the last failed attempt.
    pub message: Option<String>,
    /// JSON summary returned by the handler.
    pub output: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRunRow {
    pub fn new(run_id: Uuid, task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            task_id: task_id.into(),
            status: status.to_string(),
            attempts: 0,
            message: None,
            output: None,
            started_at: None,
            finished_at: None,
        }
    }
}
