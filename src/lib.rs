//! # taskhive
//!
//! Fleet coordination for autonomous worker agents: a shared task queue
//! with an atomic claim protocol, an adaptive message-routing scorer that
//! learns from outcomes, and a DAG workflow executor with human gates and
//! critic veto-and-retry.
//!
//! The durable store is the single source of truth; every component takes
//! an injected [`store::Store`] handle. See the `server` and `worker`
//! binaries for the two process roles.

pub mod config;
pub mod error;
pub mod notify;
pub mod routing;
pub mod runtime;
pub mod server;
pub mod store;
pub mod workflow;

pub use config::Settings;
pub use error::{HiveError, Result};
pub use routing::{AgentProfile, OutcomeTracker, RouteDispatcher};
pub use runtime::{TaskProcessor, WorkerConfig, WorkerRuntime};
pub use store::{MemoryStore, Store, Task, TaskStatus};
pub use workflow::WorkflowExecutor;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
