//! Durable store interface.
//!
//! The store is the single source of truth and the sole arbiter of task
//! ownership. Everything else in the crate takes an explicitly constructed
//! `Arc<dyn Store>` handle; nothing holds a module-level connection.
//!
//! Two implementations ship: [`MemoryStore`], a complete in-process store
//! used by tests and single-node deployments, and [`postgres::PgStore`]
//! behind the `postgres` feature.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod task;

pub use memory::MemoryStore;
pub use task::{NewTask, Priority, Task, TaskStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// A registered agent as seen by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub endpoint: Option<String>,
    pub location: Option<String>,
    /// Reported status: online, busy, offline, ...
    pub status: String,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

/// Statuses under which an agent is considered dispatchable.
pub const LIVE_AGENT_STATUSES: [&str; 4] = ["online", "healthy", "idle", "active"];

/// An inbound message awaiting (or holding) a routing outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one routing decision, appended to the tracker's rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub message_id: Uuid,
    pub agent_id: String,
    pub score: f64,
    pub outcome: DecisionOutcome,
    pub response_time_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionOutcome {
    Success,
    Failure,
}

/// A durable workflow row. Step-level state lives in `metadata` under
/// `step_status` / `step_task_ids` / `step_results`, written on every
/// transition so the row alone describes the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub steps: Value,
    pub status: String,
    pub current_step: i32,
    pub result: Option<Value>,
    pub created_by: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Async store interface consumed by every component.
///
/// Implementations must make [`Store::claim_task`] a single atomic
/// conditional update: among N concurrent claims on one pending task,
/// exactly one returns `true`.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- Tasks -----------------------------------------------------------

    /// Insert a task and return the stored row.
    async fn insert_task(&self, new: NewTask) -> Result<Task>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    /// At most one claimable candidate for `agent_id`: status pending,
    /// lowest priority value first, oldest first.
    async fn poll_pending(&self, agent_id: &str) -> Result<Option<Task>>;

    /// Atomic claim: set `in_progress`, stamp `started_at` and claim
    /// metadata, guarded by `status = pending`. Returns `false` when the
    /// race was lost; that is not an error.
    async fn claim_task(&self, id: Uuid, agent_id: &str) -> Result<bool>;

    /// Mark completed with a result payload and optional summary.
    async fn complete_task(&self, id: Uuid, result: Value, summary: Option<&str>) -> Result<()>;

    /// Mark failed, store the error message, bump `retry_count`.
    async fn fail_task(&self, id: Uuid, error_message: &str) -> Result<()>;

    /// Unconditional status update (approval/cancellation transitions).
    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()>;

    /// Shallow-merge a JSON object into the task's metadata.
    async fn merge_task_metadata(&self, id: Uuid, patch: Value) -> Result<()>;

    /// Record that an agent participated in a task (idempotent).
    async fn add_participant(&self, id: Uuid, agent_id: &str) -> Result<()>;

    /// List tasks newest-first, optionally filtered by status, excluding
    /// archived rows unless asked.
    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        include_archived: bool,
        limit: usize,
    ) -> Result<Vec<Task>>;

    /// Stamp `archived_at`.
    async fn mark_archived(&self, id: Uuid) -> Result<()>;

    // ---- Workflows -------------------------------------------------------

    async fn insert_workflow(
        &self,
        name: &str,
        description: Option<&str>,
        steps: Value,
        metadata: Value,
    ) -> Result<Uuid>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>>;

    async fn list_workflows(&self, limit: usize) -> Result<Vec<WorkflowRecord>>;

    /// Merge `patch` into the workflow metadata, optionally advancing the
    /// `current_step` marker.
    async fn update_workflow_meta(
        &self,
        id: Uuid,
        current_step: Option<i32>,
        patch: Value,
    ) -> Result<()>;

    /// Terminal update: status + result payload.
    async fn finish_workflow(&self, id: Uuid, status: &str, result: Value) -> Result<()>;

    // ---- Messages --------------------------------------------------------

    async fn insert_message(&self, content: &str, metadata: Value) -> Result<Uuid>;

    /// Oldest-first messages that have neither a routing outcome nor a
    /// routing-failed marker.
    async fn fetch_unrouted(&self, batch: usize) -> Result<Vec<MessageRecord>>;

    /// Record the routing outcome on the message. Exactly-once per message
    /// is enforced by the dispatcher; the store just writes the fields.
    async fn mark_routed(
        &self,
        message_id: Uuid,
        agent_id: &str,
        score: f64,
        fallback: bool,
    ) -> Result<()>;

    // ---- Agents ----------------------------------------------------------

    /// Insert or refresh an agent registration, stamping a heartbeat.
    async fn upsert_agent(&self, agent: AgentRecord) -> Result<()>;

    /// Stamp a heartbeat and merge the reported payload into agent
    /// metadata. Returns `false` when the agent was never registered.
    async fn record_heartbeat(
        &self,
        agent_id: &str,
        status: Option<&str>,
        payload: Value,
    ) -> Result<bool>;

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>>;

    async fn list_agents(&self) -> Result<Vec<AgentRecord>>;

    /// First of `candidates` whose status is live. With an empty candidate
    /// list, the live agent with the freshest heartbeat.
    async fn find_live_agent(&self, candidates: &[String]) -> Result<Option<String>>;

    // ---- Routing decisions ----------------------------------------------

    /// Append-persist a batch of decisions (flush from the tracker).
    async fn save_decisions(&self, decisions: &[RoutingDecision]) -> Result<()>;

    /// Most recent persisted decisions, returned oldest-first, capped at
    /// `limit`.
    async fn load_recent_decisions(&self, limit: usize) -> Result<Vec<RoutingDecision>>;

    // ---- Activity log ----------------------------------------------------

    /// Append an activity/telemetry record. Callers treat failures as
    /// best-effort.
    async fn record_activity(&self, event_type: &str, agent_id: &str, details: Value)
        -> Result<()>;
}

/// Shallow-merge `patch` (an object) into `base` in place.
///
/// Non-object patches replace `base` wholesale, mirroring the JSONB `||`
/// operator the Postgres store relies on.
pub fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                base_map.insert(k, v);
            }
        }
        (base_slot, patch) => *base_slot = patch,
    }
}
