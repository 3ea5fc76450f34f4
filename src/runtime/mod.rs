//! Per-agent worker runtime: poll/claim/execute loops, heartbeat, patrol
//! and the unsolicited-message budget.

pub mod noise;
pub mod patrol;
pub mod worker;

pub use noise::NoiseBudget;
pub use patrol::{Patrol, PatrolFinding, PatrolRunner, Severity};
pub use worker::{AckProcessor, TaskProcessor, WorkerConfig, WorkerRuntime};
