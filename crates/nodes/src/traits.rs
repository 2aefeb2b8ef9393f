//! The `TaskHandler` trait: the contract every task kind must fulfil.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{NodeError, Operation};

/// Shared context passed to a handler for one task dispatch.
///
/// Defined here (in the nodes crate) so both the engine and individual
/// handler implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// `dataset.pipeline` of the owning pipeline.
    pub pipeline: String,
    /// ID of the current run.
    pub run_id: uuid::Uuid,
    /// ID of the task being dispatched.
    pub task_id: String,
    /// Logical date the run was triggered for.
    pub logical_date: NaiveDate,
    /// Scoped working directory for this task; exists before dispatch.
    pub work_dir: PathBuf,
    /// Cancelled when the run is aborted. Handlers that spawn external
    /// processes must kill them when this fires.
    pub cancel: CancellationToken,
}

/// The core handler trait.
///
/// Handlers receive a fully rendered [`Operation`] and return a JSON summary
/// of what they did, which the runner records with the task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError>;
}

/// Error for a handler registered under the wrong kind.
pub(crate) fn unexpected_operation(expected: &str, got: &Operation) -> NodeError {
    NodeError::Fatal(format!("{expected} handler cannot execute a {} operation", got.kind()))
}
