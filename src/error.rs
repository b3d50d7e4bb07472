//! Orchestrator error kinds.
//!
//! Mirrors the shape of `agents::orchestrator::OrchestratorError` in the
//! teacher crate: a `thiserror`-derived enum at the public API boundary,
//! with `anyhow::Result` used internally for operations that can fail for
//! several structural reasons (serialization, I/O, broker transport).

use thiserror::Error;

/// Typed, user-facing error kinds returned by the facade (§7 of the spec).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("no available agents for class {0}")]
    AgentUnavailable(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already terminal: {0}")]
    TaskAlreadyTerminal(String),

    #[error("task timed out: {0}")]
    TaskTimeout(String),

    #[error("task execution error: {0}")]
    TaskExecutionError(String),

    #[error("dependency failure: task {task} blocked on failed dependency {dependency}")]
    DependencyFailure { task: String, dependency: String },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow not retryable: {0}")]
    WorkflowNotRetryable(String),

    #[error("orchestrator used before initialize()")]
    NotInitialized,
}

impl OrchestratorError {
    /// Stable machine-readable kind string, e.g. for mapping to transport
    /// codes in a controller layer (out of scope here, see §7).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BrokerUnavailable(_) => "BrokerUnavailable",
            Self::AgentNotFound(_) => "AgentNotFound",
            Self::AgentUnavailable(_) => "AgentUnavailable",
            Self::TaskNotFound(_) => "TaskNotFound",
            Self::TaskAlreadyTerminal(_) => "TaskAlreadyTerminal",
            Self::TaskTimeout(_) => "TaskTimeout",
            Self::TaskExecutionError(_) => "TaskExecutionError",
            Self::DependencyFailure { .. } => "DependencyFailure",
            Self::WorkflowNotFound(_) => "WorkflowNotFound",
            Self::WorkflowNotRetryable(_) => "WorkflowNotRetryable",
            Self::NotInitialized => "NotInitialized",
        }
    }
}
