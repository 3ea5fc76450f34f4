//! Workflow templates.
//!
//! A template is a named, static list of steps with dependencies and
//! actions, loaded from a JSON config file shaped as
//! `{"workflow_templates": {"name": {"name": ..., "steps": [...]}}}`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

/// What executing a step means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    /// Create a subtask for the step's agent and wait for it.
    Dispatch,
    /// Pause for an external (human) decision.
    Gate,
    /// Post a notification and complete immediately.
    Alert,
}

/// Runtime state of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress,
    WaitingGate,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Skipped
        )
    }

    /// Whether a dependent step may treat this dependency as satisfied.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::InProgress => "in_progress",
            StepState::WaitingGate => "waiting_gate",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
        }
    }
}

/// One step in a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Ordinal position, used for the workflow's `current_step` marker.
    #[serde(default)]
    pub step: i32,
    pub name: String,
    pub action: StepAction,
    pub agent: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Step names that must be completed or skipped first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Critic chain validating this step's output, if any.
    #[serde(default)]
    pub critic_chain: Option<String>,
    /// Whether a critic veto holds this step for retry.
    #[serde(default)]
    pub can_veto: bool,
    /// What the gate asks the human to do.
    #[serde(default)]
    pub gate_action: Option<String>,
    /// Optional steps skip instead of failing.
    #[serde(default)]
    pub optional: bool,
}

/// A named workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    pub steps: Vec<StepSpec>,
}

/// Named template collection.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, WorkflowTemplate>,
}

impl TemplateRegistry {
    pub fn new(templates: HashMap<String, WorkflowTemplate>) -> Self {
        Self { templates }
    }

    /// Load from a JSON file with a top-level `workflow_templates` object.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| HiveError::Config(format!("cannot read {}: {e}", path.display())))?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let templates = value
            .get("workflow_templates")
            .cloned()
            .ok_or_else(|| HiveError::Config("missing workflow_templates object".to_string()))?;
        Ok(Self {
            templates: serde_json::from_value(templates)?,
        })
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    pub fn insert(&mut self, key: impl Into<String>, template: WorkflowTemplate) {
        self.templates.insert(key.into(), template);
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }
}
