//! Pipeline declaration models.
//!
//! A [`PipelineDeclaration`] is what lives in `pipelines/*.json`: tasks with
//! templated parameters plus ordering edges. [`crate::dag::build_pipeline`]
//! validates it into an immutable [`PipelineSpec`]. Run state never lives
//! here; each run renders fresh [`Operation`]s from the same descriptors.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use nodes::operation::{self, PullPolicy, ResourceHints, TableId, WriteMode};
use nodes::{ColumnSchema, Operation, OperationKind};

use crate::template::{RenderContext, Template};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Task parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellCommandParams {
    pub command: Template,
    #[serde(default)]
    pub env: BTreeMap<String, Template>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerJobParams {
    /// Container name prefix; a unique suffix is added per launch.
    pub name: String,
    pub image: Template,
    #[serde(default)]
    pub env_vars: BTreeMap<String, Template>,
    #[serde(default)]
    pub resources: ResourceHints,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub image_pull_policy: PullPolicy,
}

fn default_startup_timeout_secs() -> u64 {
    operation::DEFAULT_STARTUP_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLoadParams {
    pub bucket: Template,
    pub source_objects: Vec<Template>,
    /// Kept as text so a malformed identifier is reported as
    /// [`EngineError::InvalidDeclaration`] by the builder.
    pub destination_table: String,
    pub schema: ColumnSchema,
    #[serde(default)]
    pub skip_leading_rows: u64,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default)]
    pub allow_quoted_newlines: bool,
    #[serde(default = "default_source_format")]
    pub source_format: String,
}

fn default_source_format() -> String {
    "CSV".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMoveParams {
    pub source_bucket: Template,
    pub source_object: Template,
    pub destination_bucket: Template,
    pub destination_object: Template,
}

/// What a task does, with every value still templated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    ShellCommand(ShellCommandParams),
    ContainerJob(ContainerJobParams),
    TableLoad(TableLoadParams),
    ObjectMove(ObjectMoveParams),
}

// ---------------------------------------------------------------------------
// TaskDescriptor
// ---------------------------------------------------------------------------

/// One unit of work within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Unique identifier within the pipeline (referenced by edges).
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            description: None,
            kind,
        }
    }

    pub fn operation_kind(&self) -> OperationKind {
        match &self.kind {
            TaskKind::ShellCommand(_) => OperationKind::ShellCommand,
            TaskKind::ContainerJob(_) => OperationKind::ContainerJob,
            TaskKind::TableLoad(_)    => OperationKind::TableLoad,
            TaskKind::ObjectMove(_)   => OperationKind::ObjectMove,
        }
    }

    pub fn resources(&self) -> Option<&ResourceHints> {
        match &self.kind {
            TaskKind::ContainerJob(job) => Some(&job.resources),
            _ => None,
        }
    }

    /// Every templated parameter, keyed by its path within the task.
    pub fn parameters(&self) -> Vec<(String, &Template)> {
        let mut params = Vec::new();
        match &self.kind {
            TaskKind::ShellCommand(p) => {
                params.push(("command".to_owned(), &p.command));
                params.extend(p.env.iter().map(|(k, v)| (format!("env.{k}"), v)));
            }
            TaskKind::ContainerJob(p) => {
                params.push(("image".to_owned(), &p.image));
                params.extend(p.env_vars.iter().map(|(k, v)| (format!("env_vars.{k}"), v)));
            }
            TaskKind::TableLoad(p) => {
                params.push(("bucket".to_owned(), &p.bucket));
                params.extend(
                    p.source_objects
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (format!("source_objects[{i}]"), v)),
                );
            }
            TaskKind::ObjectMove(p) => {
                params.push(("source_bucket".to_owned(), &p.source_bucket));
                params.push(("source_object".to_owned(), &p.source_object));
                params.push(("destination_bucket".to_owned(), &p.destination_bucket));
                params.push(("destination_object".to_owned(), &p.destination_object));
            }
        }
        params
    }

    /// Resolve every template against one run's date and variables.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<Operation, EngineError> {
        let render_map =
            |map: &BTreeMap<String, Template>| -> Result<BTreeMap<String, String>, EngineError> {
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.render(ctx)?)))
                    .collect()
            };

        let op = match &self.kind {
            TaskKind::ShellCommand(p) => Operation::ShellCommand(operation::ShellCommand {
                command: p.command.render(ctx)?,
                env: render_map(&p.env)?,
            }),
            TaskKind::ContainerJob(p) => Operation::ContainerJob(operation::ContainerJob {
                name: p.name.clone(),
                image: p.image.render(ctx)?,
                env_vars: render_map(&p.env_vars)?,
                resources: p.resources.clone(),
                startup_timeout: Duration::from_secs(p.startup_timeout_secs),
                image_pull_policy: p.image_pull_policy,
            }),
            TaskKind::TableLoad(p) => Operation::TableLoad(operation::TableLoad {
                bucket: p.bucket.render(ctx)?,
                source_objects: p
                    .source_objects
                    .iter()
                    .map(|t| t.render(ctx))
                    .collect::<Result<_, _>>()?,
                destination_table: parse_table_id(&self.id, &p.destination_table)?,
                schema: p.schema.clone(),
                skip_leading_rows: p.skip_leading_rows,
                write_mode: p.write_mode,
                allow_quoted_newlines: p.allow_quoted_newlines,
            }),
            TaskKind::ObjectMove(p) => Operation::ObjectMove(operation::ObjectMove {
                source_bucket: p.source_bucket.render(ctx)?,
                source_object: p.source_object.render(ctx)?,
                destination_bucket: p.destination_bucket.render(ctx)?,
                destination_object: p.destination_object.render(ctx)?,
            }),
        };
        Ok(op)
    }
}

pub(crate) fn parse_table_id(task_id: &str, raw: &str) -> Result<TableId, EngineError> {
    raw.parse()
        .map_err(|e| EngineError::InvalidDeclaration(format!("task '{task_id}': {e}")))
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// `from` must succeed before `to` may start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineDeclaration
// ---------------------------------------------------------------------------

/// A pipeline as written in a declaration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDeclaration {
    pub dataset: String,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Advisory schedule such as `@once`, `@daily` or `@weekly`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    pub tasks: Vec<TaskDescriptor>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Shorthand: each id feeds the next.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl PipelineDeclaration {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Every declaration under `dir` (`**/*.json`), sorted by path.
    /// `variables*.json` files are skipped.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<(PathBuf, Self)>, EngineError> {
        let pattern = dir.as_ref().join("**").join("*.json");
        let paths = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| EngineError::InvalidDeclaration(format!("bad declaration path: {e}")))?;

        let mut found = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| EngineError::Io(e.into()))?;
            let is_variables = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("variables"));
            if !is_variables {
                let declaration = Self::from_path(&path)?;
                found.push((path, declaration));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    pub fn key(&self) -> String {
        format!("{}.{}", self.dataset, self.pipeline)
    }

    /// Explicit edges followed by the ones implied by `chain`.
    pub fn all_edges(&self) -> Vec<Edge> {
        let mut edges = self.edges.clone();
        edges.extend(self.chain.windows(2).map(|w| Edge::new(&w[0], &w[1])));
        edges
    }
}

// ---------------------------------------------------------------------------
// PipelineSpec
// ---------------------------------------------------------------------------

/// A validated, immutable pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub(crate) dataset: String,
    pub(crate) pipeline: String,
    pub(crate) description: Option<String>,
    pub(crate) schedule: Option<String>,
    pub(crate) start_date: Option<NaiveDate>,
    pub(crate) tasks: Vec<TaskDescriptor>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) order: Vec<String>,
    pub(crate) upstream: HashMap<String, Vec<String>>,
    pub(crate) downstream: HashMap<String, Vec<String>>,
}

impl PipelineSpec {
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// `dataset.pipeline`, the identity used for the single-active-run rule.
    pub fn key(&self) -> String {
        format!("{}.{}", self.dataset, self.pipeline)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Task ids in dispatch order; ties follow declaration order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn upstream(&self, id: &str) -> &[String] {
        self.upstream.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn downstream(&self, id: &str) -> &[String] {
        self.downstream.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every task reachable from `id`, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self.downstream(id).iter().map(String::as_str).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.to_owned()) {
                queue.extend(self.downstream(next).iter().map(String::as_str));
            }
        }
        seen
    }
}
