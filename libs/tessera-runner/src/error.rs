use std::time::Duration;
use tessera_common::spec::SpecError;
use tessera_common::types::JobId;
use thiserror::Error;

/// A fault reported by the host adapter: a transport failure, a missing
/// class, or an uncaught error inside host code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HostFault {
    pub message: String,
}

impl HostFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outcome of a guarded host call that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("timed out after {}ms", .deadline.as_millis())]
    Timeout { deadline: Duration },
    #[error(transparent)]
    Fault(#[from] HostFault),
    #[error("host adapter aborted: {0}")]
    Aborted(String),
}

/// Errors visible to callers of the runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("validation error: {0}")]
    Validation(#[from] SpecError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("`{call}` timed out after {deadline_ms}ms")]
    Timeout { call: String, deadline_ms: u64 },

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("execution fault in {location}: {message}")]
    ExecutionFault { location: String, message: String },

    #[error("run bookkeeping out of order: {0}")]
    Context(String),

    #[error("job queue is shut down")]
    Closed,
}

impl RunnerError {
    /// Discovery-phase conversion: timeouts keep their own variant so the
    /// deadline survives into the job's error message.
    pub fn from_discovery_call(call: impl Into<String>, err: CallError) -> Self {
        let call = call.into();
        match err {
            CallError::Timeout { deadline } => RunnerError::Timeout {
                call,
                deadline_ms: deadline.as_millis() as u64,
            },
            other => RunnerError::Discovery(format!("{}: {}", call, other)),
        }
    }
}
