//! Task records and their lifecycle states.
//!
//! A task is the unit of work a worker runtime claims from the shared queue.
//! Status transitions are monotonic with one exception: `pending` is left via
//! the atomic claim, and a lost claim race simply leaves the row untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Stable string form, matching the stored column values.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a stored status string. Unknown values return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "awaiting_approval" => Some(TaskStatus::AwaitingApproval),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether the task can still make forward progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Lower values are claimed first.
///
/// The control plane accepts either a bare integer or one of the named
/// levels `critical`/`high`/`medium`/`low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const CRITICAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    pub const MEDIUM: Priority = Priority(5);
    pub const LOW: Priority = Priority(8);

    /// Interpret a request-supplied priority value.
    ///
    /// Numbers pass through; named levels map to their integer; anything
    /// else (including absent) is `MEDIUM`.
    pub fn from_value(value: Option<&Value>) -> Priority {
        match value {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(|v| Priority(v as i32))
                .unwrap_or(Priority::MEDIUM),
            Some(Value::String(s)) => match s.to_lowercase().as_str() {
                "critical" => Priority::CRITICAL,
                "high" => Priority::HIGH,
                "medium" => Priority::MEDIUM,
                "low" => Priority::LOW,
                _ => Priority::MEDIUM,
            },
            _ => Priority::MEDIUM,
        }
    }

    /// Display label used in side-channel notifications.
    pub fn label(&self) -> String {
        match self.0 {
            1 => "P0-CRITICAL".to_string(),
            2 => "P1-HIGH".to_string(),
            5 => "P2-MEDIUM".to_string(),
            8 => "P3-LOW".to_string(),
            n => format!("P{}", n),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

/// A task row as held by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// Agent the task is assigned to (the only agent allowed to claim it).
    pub assigned_agent: String,
    /// Agent accountable for the outcome; usually the assignee.
    pub lead_agent: Option<String>,
    /// Short task name.
    pub name: String,
    /// Longer description, if any.
    pub description: Option<String>,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Claim ordering priority (lower first).
    pub priority: Priority,
    /// Result payload recorded on completion.
    pub result: Option<Value>,
    /// Error recorded on failure.
    pub error_message: Option<String>,
    /// How many times execution has failed or been vetoed.
    pub retry_count: i32,
    /// Free-form JSON object: workflow linkage, critic state, acceptance
    /// criteria, claim stamps.
    pub metadata: Value,
    /// One-line summary recorded on completion.
    pub completion_summary: Option<String>,
    /// Agents that touched this task.
    pub participating_agents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Read a string field out of the metadata object.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Read a bool field out of the metadata object.
    pub fn meta_bool(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Fields for inserting a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub assigned_agent: String,
    pub lead_agent: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub metadata: Value,
}

impl NewTask {
    /// A pending task for `agent` with empty metadata.
    pub fn pending(agent: impl Into<String>, name: impl Into<String>) -> Self {
        let agent = agent.into();
        Self {
            assigned_agent: agent.clone(),
            lead_agent: Some(agent),
            name: name.into(),
            description: None,
            status: TaskStatus::Pending,
            priority: Priority::MEDIUM,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
