//! `ShellHandler`: runs a command string with `bash -c`.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::traits::{unexpected_operation, ExecutionContext};
use crate::{NodeError, Operation, TaskHandler};

/// Lines of output kept in task summaries and error messages.
pub(crate) const OUTPUT_TAIL_LINES: usize = 20;

pub struct ShellHandler {
    shell: String,
}

impl ShellHandler {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }
}

impl Default for ShellHandler {
    fn default() -> Self {
        Self::new("bash")
    }
}

#[async_trait]
impl TaskHandler for ShellHandler {
    #[instrument(skip_all, fields(task_id = %ctx.task_id))]
    async fn execute(
        &self,
        operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        let Operation::ShellCommand(cmd) = operation else {
            return Err(unexpected_operation("shell", operation));
        };

        debug!("running in {}: {}", ctx.work_dir.display(), cmd.command);

        // The task env is layered over the inherited one so PATH etc. survive.
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&cmd.command)
            .current_dir(&ctx.work_dir)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NodeError::Fatal(format!("failed to spawn {}: {e}", self.shell)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| NodeError::Retryable(format!("waiting for command: {e}")))?,
            _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(NodeError::NonZeroExit {
                code: output.status.code(),
                stderr: tail(&stderr, OUTPUT_TAIL_LINES),
            });
        }

        if !stderr.trim().is_empty() {
            debug!("stderr: {}", stderr.trim());
        }

        Ok(json!({
            "exit_code": 0,
            "stdout": tail(&stdout, OUTPUT_TAIL_LINES),
        }))
    }
}

/// Last `lines` lines of `text`, trimmed.
pub(crate) fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
