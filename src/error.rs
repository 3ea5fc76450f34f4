//! Error types for taskhive.
//!
//! The fault taxonomy is deliberately narrow: claim-race losses, routing
//! ambiguity and critic vetoes are *signals*, not errors, and never surface
//! here. Only conditions that stop a task or workflow from making forward
//! progress (missing records, malformed configuration, exhausted retries,
//! storage faults) are raised as `HiveError`.

use thiserror::Error;

/// Top-level error type for store and orchestration operations.
#[derive(Debug, Error)]
pub enum HiveError {
    /// A referenced task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(uuid::Uuid),

    /// A referenced workflow does not exist in the durable store.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(uuid::Uuid),

    /// A referenced agent has never registered.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// A named workflow template is missing from the template registry.
    #[error("unknown workflow template: {0}")]
    UnknownTemplate(String),

    /// The workflow exists durably but has no in-memory execution state
    /// (completed, or the process restarted since it started).
    #[error("workflow not active: {0}")]
    WorkflowNotActive(uuid::Uuid),

    /// A named step does not exist in the workflow.
    #[error("step '{step}' not found in workflow {workflow}")]
    StepNotFound { workflow: uuid::Uuid, step: String },

    /// A gate resolution arrived but nothing is waiting.
    #[error("no waiting gate in workflow {0}")]
    NoWaitingGate(uuid::Uuid),

    /// A state transition was requested from the wrong starting state.
    #[error("invalid transition: task is '{actual}', expected '{expected}'")]
    InvalidTransition {
        expected: &'static str,
        actual: String,
    },

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Underlying storage fault.
    #[error("store error: {0}")]
    Store(String),

    /// JSON (de)serialization fault.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HiveError>;
