//! `MockHandler`: a test double for `TaskHandler`.
//!
//! Useful in unit and integration tests where a real handler would need a
//! container runtime, network access or a warehouse.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{NodeError, Operation, TaskHandler, traits::ExecutionContext};

/// Behaviour injected into `MockHandler` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with the given error every time.
    Fail(NodeError),
    /// Fail with the given error for the first `n` calls, then succeed.
    FailTimes(usize, NodeError),
    /// Sleep for the duration (honouring cancellation), then succeed.
    Sleep(Duration),
}

/// A mock handler that records every task it receives and returns a
/// programmer-specified result.
pub struct MockHandler {
    /// What the handler will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// Task ids seen by this handler, in call order.
    pub calls: Arc<Mutex<Vec<String>>>,
    attempts: AtomicUsize,
}

impl MockHandler {
    fn with(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self::with(MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with `error`.
    pub fn failing(error: NodeError) -> Self {
        Self::with(MockBehaviour::Fail(error))
    }

    /// Create a mock that fails `times` times before succeeding.
    pub fn failing_times(times: usize, error: NodeError) -> Self {
        Self::with(MockBehaviour::FailTimes(times, error))
    }

    /// Create a mock that takes `duration` to complete.
    pub fn sleeping(duration: Duration) -> Self {
        Self::with(MockBehaviour::Sleep(duration))
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Task ids in call order.
    pub fn called_tasks(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TaskHandler for MockHandler {
    async fn execute(
        &self,
        _operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ctx.task_id.clone());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(json!({ "task": ctx.task_id, "value": v })),
            MockBehaviour::Fail(err) => Err(err.clone()),
            MockBehaviour::FailTimes(n, err) if attempt < *n => Err(err.clone()),
            MockBehaviour::FailTimes(..) => {
                Ok(json!({ "task": ctx.task_id, "attempt": attempt + 1 }))
            }
            MockBehaviour::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => Ok(json!({ "task": ctx.task_id })),
                    _ = ctx.cancel.cancelled() => Err(NodeError::Cancelled),
                }
            }
        }
    }
}
