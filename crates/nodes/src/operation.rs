//! Concrete, fully rendered operations handed to a [`TaskHandler`].
//!
//! Every templated value has already been resolved against the run's logical
//! date and variables by the time an `Operation` exists.
//!
//! [`TaskHandler`]: crate::TaskHandler

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schema::ColumnSchema;

/// Default bound for a container to reach the running state.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Discriminant used to look a handler up in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    ShellCommand,
    ContainerJob,
    TableLoad,
    ObjectMove,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShellCommand => write!(f, "shell_command"),
            Self::ContainerJob => write!(f, "container_job"),
            Self::TableLoad    => write!(f, "table_load"),
            Self::ObjectMove   => write!(f, "object_move"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    ShellCommand(ShellCommand),
    ContainerJob(ContainerJob),
    TableLoad(TableLoad),
    ObjectMove(ObjectMove),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::ShellCommand(_) => OperationKind::ShellCommand,
            Self::ContainerJob(_) => OperationKind::ContainerJob,
            Self::TableLoad(_)    => OperationKind::TableLoad,
            Self::ObjectMove(_)   => OperationKind::ObjectMove,
        }
    }
}

/// Run `command` with `bash -c`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellCommand {
    pub command: String,
    pub env: BTreeMap<String, String>,
}

/// Launch a transform container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerJob {
    pub name: String,
    pub image: String,
    pub env_vars: BTreeMap<String, String>,
    pub resources: ResourceHints,
    pub startup_timeout: Duration,
    pub image_pull_policy: PullPolicy,
}

/// Load CSV objects into a warehouse table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableLoad {
    pub bucket: String,
    pub source_objects: Vec<String>,
    pub destination_table: TableId,
    pub schema: ColumnSchema,
    pub skip_leading_rows: u64,
    pub write_mode: WriteMode,
    pub allow_quoted_newlines: bool,
}

/// Move objects matching `source_object` (optionally containing one `*`)
/// into `destination_bucket` under `destination_object`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectMove {
    pub source_bucket: String,
    pub source_object: String,
    pub destination_bucket: String,
    pub destination_object: String,
}

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Advisory resource requests/limits for a container job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ephemeral_storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_cpu: Option<String>,
}

impl ResourceHints {
    /// Memory bound handed to the container runtime, limit before request.
    pub fn memory(&self) -> Option<&str> {
        self.limit_memory.as_deref().or(self.request_memory.as_deref())
    }

    /// CPU count, accepting both whole cores (`"1"`) and millicores (`"200m"`).
    pub fn cpus(&self) -> Option<f64> {
        let raw = self.limit_cpu.as_deref().or(self.request_cpu.as_deref())?.trim();
        match raw.strip_suffix('m') {
            Some(milli) => milli.parse::<f64>().ok().map(|m| m / 1000.0),
            None => raw.parse::<f64>().ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

/// Whether a load replaces or extends the table's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteMode {
    #[default]
    #[serde(rename = "WRITE_TRUNCATE", alias = "TRUNCATE")]
    Truncate,
    #[serde(rename = "WRITE_APPEND", alias = "APPEND")]
    Append,
}

/// `dataset.table` (optionally `project.dataset.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableId {
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
}

impl FromStr for TableId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("invalid table identifier '{s}'"));
        }
        match parts.as_slice() {
            [dataset, table] => Ok(Self {
                project: None,
                dataset: (*dataset).to_owned(),
                table: (*table).to_owned(),
            }),
            [project, dataset, table] => Ok(Self {
                project: Some((*project).to_owned()),
                dataset: (*dataset).to_owned(),
                table: (*table).to_owned(),
            }),
            _ => Err(format!(
                "invalid table identifier '{s}': expected dataset.table"
            )),
        }
    }
}

impl TryFrom<String> for TableId {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TableId> for String {
    fn from(value: TableId) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{project}.{}.{}", self.dataset, self.table),
            None => write!(f, "{}.{}", self.dataset, self.table),
        }
    }
}
