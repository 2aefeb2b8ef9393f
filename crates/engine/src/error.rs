//! Engine-level error types.

use thiserror::Error;

/// Errors produced by the engine (construction, rendering, execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Construction errors ------

    /// Two or more tasks share the same ID.
    #[error("duplicate task ID: '{0}'")]
    DuplicateTaskId(String),

    /// An edge references a task ID that doesn't exist in the pipeline.
    #[error("edge references unknown task '{task_id}' ({side} side)")]
    UnknownTaskReference {
        task_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("pipeline graph contains a cycle")]
    CycleDetected,

    /// A table schema names the same column twice.
    #[error("task '{task_id}': duplicate column '{column}' in schema")]
    DuplicateColumn {
        task_id: String,
        column: String,
    },

    /// A templated value could not be parsed.
    #[error("invalid template '{template}': {reason}")]
    InvalidTemplate {
        template: String,
        reason: String,
    },

    /// A template references a variable missing from the configuration store.
    #[error("unresolved variable '{0}'")]
    UnresolvedVariable(String),

    /// The declaration is structurally invalid.
    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    // ------ Execution errors ------

    /// Another run of this pipeline is still active (max active runs = 1).
    #[error("pipeline '{0}' already has an active run")]
    RunAlreadyActive(String),

    /// A task failed with a non-retryable error.
    #[error("task '{task_id}' failed fatally: {message}")]
    TaskFatal {
        task_id: String,
        message: String,
    },

    /// A task's retryable error persisted past the retry limit.
    #[error("task '{task_id}' exceeded retry limit after {attempts} attempts: {message}")]
    TaskRetryExhausted {
        task_id: String,
        attempts: u32,
        message: String,
    },

    /// Persistence error from the db crate.
    #[error("run store error: {0}")]
    Store(#[from] db::DbError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
