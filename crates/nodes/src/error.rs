//! Node-level error type.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a handler's `execute` method.
///
/// The engine uses [`NodeError::is_retryable`] to decide retry behaviour:
/// process and container failures are re-tried with exponential back-off,
/// everything else marks the task as failed immediately.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// A shell command exited with a non-zero status.
    #[error("command exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// The container did not reach the running state in time.
    #[error("container '{container}' did not start within {timeout:?}")]
    PodStartupTimeout { container: String, timeout: Duration },

    /// The container ran but exited with a non-zero status.
    #[error("container '{container}' exited with status {code}: {logs}")]
    ContainerNonZeroExit {
        container: String,
        code: i64,
        logs: String,
    },

    /// The loaded file does not line up positionally with the column schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A source object or file does not exist.
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// Writing to the destination location failed.
    #[error("destination write error: {0}")]
    DestinationWriteError(String),

    /// The operation's parameters violate the handler's input contract.
    #[error("invalid contract: {0}")]
    InvalidContract(String),

    /// The run was cancelled while the task was in flight.
    #[error("cancelled")]
    Cancelled,

    /// Transient failure; the engine should re-try the task.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

impl NodeError {
    /// Whether the engine may re-dispatch the task after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NonZeroExit { .. }
                | Self::PodStartupTimeout { .. }
                | Self::ContainerNonZeroExit { .. }
                | Self::Retryable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_failures_are_retryable() {
        assert!(NodeError::NonZeroExit { code: Some(1), stderr: String::new() }.is_retryable());
        assert!(NodeError::PodStartupTimeout {
            container: "c".into(),
            timeout: Duration::from_secs(600),
        }
        .is_retryable());
        assert!(NodeError::ContainerNonZeroExit {
            container: "c".into(),
            code: 2,
            logs: String::new(),
        }
        .is_retryable());
    }

    #[test]
    fn data_failures_are_fatal() {
        assert!(!NodeError::SchemaMismatch("3 vs 4".into()).is_retryable());
        assert!(!NodeError::SourceNotFound("x".into()).is_retryable());
        assert!(!NodeError::DestinationWriteError("x".into()).is_retryable());
        assert!(!NodeError::InvalidContract("x".into()).is_retryable());
        assert!(!NodeError::Cancelled.is_retryable());
    }
}
