//! Workflow orchestration: templates, the DAG executor, critic chain
//! validation and acceptance criteria.

pub mod acceptance;
pub mod critic;
pub mod executor;
pub mod template;

pub use critic::{
    ChainRegistry, CriticChain, CriticEngine, CriticInvoker, CriticLayer, CriticVerdict, Decision,
    FinalReject, QueuedCriticInvoker, ValidationOutcome,
};
pub use executor::{GateAction, StateSnapshot, WorkflowExecutor, WorkflowState};
pub use template::{StepAction, StepSpec, StepState, TemplateRegistry, WorkflowTemplate};
