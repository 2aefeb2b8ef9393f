//! Pipeline execution engine.
//!
//! `PipelineRunner` runs one instance of a [`PipelineSpec`] for a logical date:
//! 1. Claims the pipeline's single run slot in the [`RunStore`].
//! 2. Dispatches every task whose predecessors all succeeded; independent
//!    branches run concurrently on a `JoinSet`.
//! 3. Renders each task's templates against the logical date at dispatch.
//! 4. Retries retryable handler errors (up to `max_retries`) with exponential
//!    back-off; other errors fail the task at once.
//! 5. Marks the downstream subgraph of a failed task `upstream_failed` while
//!    unrelated branches carry on.
//! 6. Records every task transition and releases the slot when done.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use db::models::{RunStatus, TaskRunRow, TaskStatus};
use db::{DbError, RunStore};
use nodes::container::ContainerHandler;
use nodes::object_move::ObjectMoveHandler;
use nodes::shell::ShellHandler;
use nodes::table_load::TableLoadHandler;
use nodes::{
    ExecutionContext, NodeError, ObjectStore, Operation, OperationKind, TaskHandler, Warehouse,
};

use crate::config::RunnerConfig;
use crate::models::PipelineSpec;
use crate::template::RenderContext;
use crate::variables::Variables;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

/// Maps operation kinds (and optionally single task ids) to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    kinds: HashMap<OperationKind, Arc<dyn TaskHandler>>,
    tasks: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in handlers wired to the given store and warehouse.
    pub fn builtin(
        config: &RunnerConfig,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self::new()
            .with_kind(OperationKind::ShellCommand, Arc::new(ShellHandler::default()))
            .with_kind(
                OperationKind::ContainerJob,
                Arc::new(ContainerHandler::new(config.container_runtime.clone())),
            )
            .with_kind(
                OperationKind::TableLoad,
                Arc::new(TableLoadHandler::new(Arc::clone(&store), warehouse)),
            )
            .with_kind(OperationKind::ObjectMove, Arc::new(ObjectMoveHandler::new(store)))
    }

    pub fn with_kind(mut self, kind: OperationKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.kinds.insert(kind, handler);
        self
    }

    /// Route one task to `handler` regardless of its kind.
    pub fn with_task(mut self, task_id: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.tasks.insert(task_id.into(), handler);
        self
    }

    fn resolve(&self, task_id: &str, kind: OperationKind) -> Option<Arc<dyn TaskHandler>> {
        self.tasks
            .get(task_id)
            .or_else(|| self.kinds.get(&kind))
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Final state of one task within a run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub output: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskReport {
    fn pending(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_owned(),
            status: TaskStatus::Pending,
            attempts: 0,
            error: None,
            output: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// The result of running a pipeline once.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub logical_date: NaiveDate,
    pub status: RunStatus,
    /// Tasks in topological order.
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn task(&self, task_id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.task_id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Per-run bookkeeping
// ---------------------------------------------------------------------------

enum Outcome {
    Succeeded(Value),
    Cancelled,
    Failed(EngineError),
}

struct Finished {
    task_id: String,
    attempts: u32,
    outcome: Outcome,
}

struct RunState {
    run_id: Uuid,
    reports: HashMap<String, TaskReport>,
    /// Predecessors not yet succeeded, per task.
    remaining: HashMap<String, usize>,
    ready: VecDeque<String>,
}

impl RunState {
    fn new(spec: &PipelineSpec, run_id: Uuid) -> Self {
        let order = spec.topological_order();
        let reports = order.iter().map(|id| (id.clone(), TaskReport::pending(id))).collect();
        let remaining: HashMap<String, usize> = order
            .iter()
            .map(|id| (id.clone(), spec.upstream(id).len()))
            .collect();
        let ready = order.iter().filter(|id| remaining[id.as_str()] == 0).cloned().collect();
        Self {
            run_id,
            reports,
            remaining,
            ready,
        }
    }

    fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.reports.get(task_id).map(|r| r.status)
    }
}

// ---------------------------------------------------------------------------
// Run slot
// ---------------------------------------------------------------------------

/// The pipeline's claimed run slot.
///
/// When the run future is dropped, or finishing the run fails, the slot is
/// released in the background: with the decided status if the run got that
/// far, otherwise as an abandoned run whose unfinished tasks are cancelled.
struct RunSlot {
    store: Arc<dyn RunStore>,
    run_id: Uuid,
    status: Option<RunStatus>,
    released: bool,
}

impl RunSlot {
    fn new(store: Arc<dyn RunStore>, run_id: Uuid) -> Self {
        Self {
            store,
            run_id,
            status: None,
            released: false,
        }
    }

    async fn release(&mut self, status: RunStatus) -> Result<(), DbError> {
        self.status = Some(status);
        self.store.finish_run(self.run_id, status).await?;
        self.released = true;
        Ok(())
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let (run_id, status) = (self.run_id, self.status);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!("run {} is still marked running: no runtime to release it on", run_id);
            return;
        };
        warn!("run {} ended without being finished, releasing its slot", run_id);
        handle.spawn(async move {
            let released = match status {
                Some(status) => store.finish_run(run_id, status).await,
                None => store.release_run(run_id).await,
            };
            if let Err(e) = released {
                error!("could not release run {}: {}", run_id, e);
            }
        });
    }
}

/// Aborts a handler task once nothing is waiting for it.
struct AbortOnDrop(JoinHandle<Finished>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

/// Runs pipelines against a run store and a set of task handlers.
pub struct PipelineRunner {
    store: Arc<dyn RunStore>,
    registry: HandlerRegistry,
    variables: Arc<Variables>,
    config: RunnerConfig,
}

impl PipelineRunner {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: HandlerRegistry,
        variables: Arc<Variables>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            variables,
            config,
        }
    }

    /// Run `spec` for `logical_date` until every task is terminal.
    ///
    /// Task failures are reported in the returned [`RunReport`], not as
    /// errors.
    ///
    /// # Errors
    /// [`EngineError::RunAlreadyActive`] if another run of the same pipeline
    /// is active, or [`EngineError::Store`] if the run cannot be recorded.
    #[instrument(skip_all, fields(pipeline = %spec.key(), %logical_date))]
    pub async fn run(
        &self,
        spec: &PipelineSpec,
        logical_date: NaiveDate,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let key = spec.key();
        let run = self
            .store
            .begin_run(&key, logical_date)
            .await
            .map_err(|e| match e {
                DbError::RunAlreadyActive(key) => EngineError::RunAlreadyActive(key),
                other => EngineError::Store(other),
            })?;
        let mut slot = RunSlot::new(Arc::clone(&self.store), run.id);
        info!("run {} started with {} tasks", run.id, spec.tasks().len());

        let mut state = RunState::new(spec, run.id);
        for task_id in spec.topological_order() {
            self.record(&state, task_id).await;
        }

        let render_ctx = RenderContext::new(logical_date, &self.variables);
        let mut in_flight: JoinSet<Finished> = JoinSet::new();
        let mut cancel_seen = false;

        loop {
            if !cancel.is_cancelled() {
                while let Some(task_id) = state.ready.pop_front() {
                    self.dispatch(spec, &mut state, &task_id, &render_ctx, &cancel, &mut in_flight)
                        .await;
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok(finished)) => self.complete(spec, &mut state, finished).await,
                    Some(Err(e)) => error!("task future did not complete: {e}"),
                    None => break,
                },
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!(
                        "run {} cancelled, waiting for {} in-flight tasks",
                        run.id,
                        in_flight.len()
                    );
                }
            }
        }

        // Anything never dispatched (only possible after cancellation).
        for task_id in spec.topological_order() {
            if state.status(task_id) == Some(TaskStatus::Pending) {
                self.transition(&mut state, task_id, TaskStatus::Cancelled, None).await;
            }
        }

        let statuses: Vec<TaskStatus> = state.reports.values().map(|r| r.status).collect();
        let status = if statuses.iter().all(|s| *s == TaskStatus::Succeeded) {
            RunStatus::Succeeded
        } else if cancel.is_cancelled() || statuses.contains(&TaskStatus::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };

        slot.release(status).await?;
        info!("run {} finished: {}", run.id, status);

        let mut reports = state.reports;
        let tasks = spec
            .topological_order()
            .iter()
            .filter_map(|id| reports.remove(id))
            .collect();

        Ok(RunReport {
            run_id: run.id,
            pipeline: key,
            logical_date,
            status,
            tasks,
        })
    }

    // -----------------------------------------------------------------------
    // Internal: dispatch and completion
    // -----------------------------------------------------------------------

    async fn dispatch(
        &self,
        spec: &PipelineSpec,
        state: &mut RunState,
        task_id: &str,
        render_ctx: &RenderContext<'_>,
        cancel: &CancellationToken,
        in_flight: &mut JoinSet<Finished>,
    ) {
        if state.status(task_id) != Some(TaskStatus::Pending) {
            return;
        }
        let Some(task) = spec.task(task_id) else {
            return;
        };

        let Some(handler) = self.registry.resolve(task_id, task.operation_kind()) else {
            let message = format!("no handler registered for {} tasks", task.operation_kind());
            self.fail(spec, state, task_id, 0, message).await;
            return;
        };

        let operation: Operation = match task.render(render_ctx) {
            Ok(op) => op,
            Err(e) => {
                self.fail(spec, state, task_id, 0, e.to_string()).await;
                return;
            }
        };

        let work_dir = self
            .config
            .work_root
            .join(spec.dataset())
            .join(spec.pipeline())
            .join(state.run_id.to_string())
            .join(task_id);
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            let message = format!("cannot create work dir {}: {e}", work_dir.display());
            self.fail(spec, state, task_id, 0, message).await;
            return;
        }

        let ctx = ExecutionContext {
            pipeline: spec.key(),
            run_id: state.run_id,
            task_id: task_id.to_owned(),
            logical_date: render_ctx.logical_date,
            work_dir,
            cancel: cancel.clone(),
        };

        if let Some(report) = state.reports.get_mut(task_id) {
            report.started_at = Some(Utc::now());
        }
        self.transition(state, task_id, TaskStatus::Running, None).await;
        info!("dispatching task '{}' ({})", task_id, task.operation_kind());

        let config = self.config.clone();
        in_flight.spawn(async move {
            let task_id = ctx.task_id.clone();
            // Run the handler on its own task so a panic fails only this task.
            let mut handler_task =
                AbortOnDrop(tokio::spawn(execute_with_retry(handler, operation, ctx, config)));
            match (&mut handler_task.0).await {
                Ok(finished) => finished,
                Err(e) => Finished {
                    task_id: task_id.clone(),
                    attempts: 1,
                    outcome: Outcome::Failed(EngineError::TaskFatal {
                        task_id,
                        message: format!("handler panicked: {e}"),
                    }),
                },
            }
        });
    }

    async fn complete(&self, spec: &PipelineSpec, state: &mut RunState, finished: Finished) {
        let Finished {
            task_id,
            attempts,
            outcome,
        } = finished;
        if let Some(report) = state.reports.get_mut(&task_id) {
            report.attempts = attempts;
        }

        match outcome {
            Outcome::Succeeded(output) => {
                info!("task '{}' succeeded after {} attempt(s)", task_id, attempts);
                self.transition(state, &task_id, TaskStatus::Succeeded, Some(output)).await;

                for next in spec.downstream(&task_id) {
                    if let Some(count) = state.remaining.get_mut(next) {
                        *count = count.saturating_sub(1);
                        if *count == 0 && state.status(next) == Some(TaskStatus::Pending) {
                            state.ready.push_back(next.clone());
                        }
                    }
                }
            }
            Outcome::Cancelled => {
                warn!("task '{}' cancelled", task_id);
                self.transition(state, &task_id, TaskStatus::Cancelled, None).await;
            }
            Outcome::Failed(err) => {
                self.fail(spec, state, &task_id, attempts, err.to_string()).await;
            }
        }
    }

    /// Fail `task_id` and mark its pending downstream subgraph.
    async fn fail(
        &self,
        spec: &PipelineSpec,
        state: &mut RunState,
        task_id: &str,
        attempts: u32,
        message: String,
    ) {
        error!("task '{}' failed: {}", task_id, message);
        if let Some(report) = state.reports.get_mut(task_id) {
            report.attempts = report.attempts.max(attempts);
            report.error = Some(message);
        }
        self.transition(state, task_id, TaskStatus::Failed, None).await;

        let descendants = spec.descendants(task_id);
        for id in spec.topological_order() {
            if descendants.contains(id) && state.status(id) == Some(TaskStatus::Pending) {
                if let Some(report) = state.reports.get_mut(id.as_str()) {
                    report.error = Some(format!("upstream task '{task_id}' failed"));
                }
                self.transition(state, id, TaskStatus::UpstreamFailed, None).await;
            }
        }
    }

    async fn transition(
        &self,
        state: &mut RunState,
        task_id: &str,
        status: TaskStatus,
        output: Option<Value>,
    ) {
        if let Some(report) = state.reports.get_mut(task_id) {
            report.status = status;
            if output.is_some() {
                report.output = output;
            }
            if status.is_terminal() {
                report.finished_at = Some(Utc::now());
            }
        }
        self.record(state, task_id).await;
    }

    /// Persist the current state of one task. Store failures are logged and
    /// do not interrupt the run.
    async fn record(&self, state: &RunState, task_id: &str) {
        let Some(report) = state.reports.get(task_id) else {
            return;
        };
        let mut row = TaskRunRow::new(state.run_id, task_id, report.status);
        row.attempts = i32::try_from(report.attempts).unwrap_or(i32::MAX);
        row.message = report.error.clone();
        row.output = report.output.clone();
        row.started_at = report.started_at;
        row.finished_at = report.finished_at;

        if let Err(e) = self.store.record_task(&row).await {
            warn!("could not record task '{}' as {}: {}", task_id, report.status, e);
        }
    }
}

// ---------------------------------------------------------------------------
// Internal: execute a single task with retry logic.
// ---------------------------------------------------------------------------

async fn execute_with_retry(
    handler: Arc<dyn TaskHandler>,
    operation: Operation,
    ctx: ExecutionContext,
    config: RunnerConfig,
) -> Finished {
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let outcome = match handler.execute(&operation, &ctx).await {
            Ok(output) => Outcome::Succeeded(output),

            Err(NodeError::Cancelled) => Outcome::Cancelled,
            Err(_) if ctx.cancel.is_cancelled() => Outcome::Cancelled,

            Err(err) if err.is_retryable() => {
                if attempts > config.max_retries {
                    Outcome::Failed(EngineError::TaskRetryExhausted {
                        task_id: ctx.task_id.clone(),
                        attempts,
                        message: err.to_string(),
                    })
                } else {
                    let delay = config.retry_delay(attempts);
                    warn!(
                        "task '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        ctx.task_id,
                        attempts,
                        config.max_retries + 1,
                        delay,
                        err
                    );

                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = ctx.cancel.cancelled() => true,
                    };
                    if !cancelled {
                        continue;
                    }
                    Outcome::Cancelled
                }
            }

            Err(err) => Outcome::Failed(EngineError::TaskFatal {
                task_id: ctx.task_id.clone(),
                message: err.to_string(),
            }),
        };

        return Finished {
            task_id: ctx.task_id,
            attempts,
            outcome,
        };
    }
}
