//! In-process store.
//!
//! A complete implementation of [`Store`] over mutex-guarded maps. All
//! operations take the same lock, which makes the claim a true
//! compare-and-set: among N concurrent claims exactly one observes
//! `pending`. Used by the test suite and by single-node deployments that
//! don't need durability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{HiveError, Result};
use crate::store::task::{NewTask, Task, TaskStatus};
use crate::store::{
    merge_json, AgentRecord, MessageRecord, RoutingDecision, Store, WorkflowRecord,
    LIVE_AGENT_STATUSES,
};

/// One appended activity/telemetry record.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub event_type: String,
    pub agent_id: String,
    pub details: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    /// Monotonic insertion counter, tie-break for equal timestamps.
    task_seq: HashMap<Uuid, u64>,
    next_seq: u64,
    workflows: HashMap<Uuid, WorkflowRecord>,
    messages: Vec<MessageRecord>,
    agents: HashMap<String, AgentRecord>,
    decisions: Vec<RoutingDecision>,
    activities: Vec<ActivityEntry>,
}

/// Shared in-memory store handle. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the activity log, oldest first. Test/inspection helper.
    pub fn activity_log(&self) -> Vec<ActivityEntry> {
        self.inner.lock().activities.clone()
    }

    /// Number of persisted routing decisions. Test/inspection helper.
    pub fn decision_count(&self) -> usize {
        self.inner.lock().decisions.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_task(&self, new: NewTask) -> Result<Task> {
        let mut inner = self.inner.lock();
        let id = Uuid::new_v4();
        let task = Task {
            id,
            assigned_agent: new.assigned_agent,
            lead_agent: new.lead_agent,
            name: new.name,
            description: new.description,
            status: new.status,
            priority: new.priority,
            result: None,
            error_message: None,
            retry_count: 0,
            metadata: new.metadata,
            completion_summary: None,
            participating_agents: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            archived_at: None,
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.task_seq.insert(id, seq);
        inner.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.inner.lock().tasks.get(&id).cloned())
    }

    async fn poll_pending(&self, agent_id: &str) -> Result<Option<Task>> {
        let inner = self.inner.lock();
        let mut candidates: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.assigned_agent == agent_id)
            .collect();
        candidates.sort_by_key(|t| {
            (
                t.priority,
                t.created_at,
                inner.task_seq.get(&t.id).copied().unwrap_or(u64::MAX),
            )
        });
        Ok(candidates.first().map(|t| (*t).clone()))
    }

    async fn claim_task(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            // Lost the race; leave the row untouched.
            return Ok(false);
        }
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        merge_json(
            &mut task.metadata,
            json!({
                "claimed_by": agent_id,
                "claimed_at": Utc::now().to_rfc3339(),
            }),
        );
        Ok(true)
    }

    async fn complete_task(&self, id: Uuid, result: Value, summary: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(HiveError::TaskNotFound(id))?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.completed_at = Some(Utc::now());
        if let Some(summary) = summary {
            task.completion_summary = Some(summary.to_string());
        }
        Ok(())
    }

    async fn fail_task(&self, id: Uuid, error_message: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(HiveError::TaskNotFound(id))?;
        task.status = TaskStatus::Failed;
        task.error_message = Some(error_message.to_string());
        task.retry_count += 1;
        Ok(())
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(HiveError::TaskNotFound(id))?;
        task.status = status;
        Ok(())
    }

    async fn merge_task_metadata(&self, id: Uuid, patch: Value) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(HiveError::TaskNotFound(id))?;
        merge_json(&mut task.metadata, patch);
        Ok(())
    }

    async fn add_participant(&self, id: Uuid, agent_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(HiveError::TaskNotFound(id))?;
        if !task.participating_agents.iter().any(|a| a == agent_id) {
            task.participating_agents.push(agent_id.to_string());
        }
        Ok(())
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        include_archived: bool,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| include_archived || t.archived_at.is_none())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.created_at.cmp(&a.created_at).then_with(|| {
                let sa = inner.task_seq.get(&a.id).copied().unwrap_or(0);
                let sb = inner.task_seq.get(&b.id).copied().unwrap_or(0);
                sb.cmp(&sa)
            })
        });
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn mark_archived(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(HiveError::TaskNotFound(id))?;
        task.archived_at = Some(Utc::now());
        Ok(())
    }

    async fn insert_workflow(
        &self,
        name: &str,
        description: Option<&str>,
        steps: Value,
        metadata: Value,
    ) -> Result<Uuid> {
        let mut inner = self.inner.lock();
        let id = Uuid::new_v4();
        let now = Utc::now();
        inner.workflows.insert(
            id,
            WorkflowRecord {
                id,
                name: name.to_string(),
                description: description.map(str::to_string),
                steps,
                status: "in_progress".to_string(),
                current_step: 0,
                result: None,
                created_by: "hive".to_string(),
                metadata,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>> {
        Ok(self.inner.lock().workflows.get(&id).cloned())
    }

    async fn list_workflows(&self, limit: usize) -> Result<Vec<WorkflowRecord>> {
        let inner = self.inner.lock();
        let mut rows: Vec<WorkflowRecord> = inner.workflows.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn update_workflow_meta(
        &self,
        id: Uuid,
        current_step: Option<i32>,
        patch: Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let wf = inner
            .workflows
            .get_mut(&id)
            .ok_or(HiveError::WorkflowNotFound(id))?;
        if let Some(step) = current_step {
            wf.current_step = step;
        }
        merge_json(&mut wf.metadata, patch);
        wf.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_workflow(&self, id: Uuid, status: &str, result: Value) -> Result<()> {
        let mut inner = self.inner.lock();
        let wf = inner
            .workflows
            .get_mut(&id)
            .ok_or(HiveError::WorkflowNotFound(id))?;
        wf.status = status.to_string();
        wf.result = Some(result);
        wf.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_message(&self, content: &str, metadata: Value) -> Result<Uuid> {
        let mut inner = self.inner.lock();
        let id = Uuid::new_v4();
        inner.messages.push(MessageRecord {
            id,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn fetch_unrouted(&self, batch: usize) -> Result<Vec<MessageRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                m.metadata.get("routed_to").is_none() && m.metadata.get("routing_failed").is_none()
            })
            .take(batch)
            .cloned()
            .collect())
    }

    async fn mark_routed(
        &self,
        message_id: Uuid,
        agent_id: &str,
        score: f64,
        fallback: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(msg) = inner.messages.iter_mut().find(|m| m.id == message_id) {
            let mut patch = json!({
                "routed_to": agent_id,
                "routing_score": score,
                "routed_at": Utc::now().to_rfc3339(),
            });
            if fallback {
                patch["routing_fallback"] = json!(true);
            }
            merge_json(&mut msg.metadata, patch);
        }
        Ok(())
    }

    async fn upsert_agent(&self, mut agent: AgentRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        agent.last_heartbeat = Utc::now();
        inner.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        agent_id: &str,
        status: Option<&str>,
        payload: Value,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(agent) = inner.agents.get_mut(agent_id) else {
            return Ok(false);
        };
        agent.last_heartbeat = Utc::now();
        if let Some(status) = status {
            agent.status = status.to_string();
        }
        merge_json(&mut agent.metadata, json!({ "heartbeat": payload }));
        Ok(true)
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.inner.lock().agents.get(agent_id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let inner = self.inner.lock();
        let mut agents: Vec<AgentRecord> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(agents)
    }

    async fn find_live_agent(&self, candidates: &[String]) -> Result<Option<String>> {
        let inner = self.inner.lock();
        let is_live = |a: &AgentRecord| LIVE_AGENT_STATUSES.contains(&a.status.as_str());
        if candidates.is_empty() {
            let mut live: Vec<&AgentRecord> =
                inner.agents.values().filter(|a| is_live(a)).collect();
            live.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
            return Ok(live.first().map(|a| a.id.clone()));
        }
        for candidate in candidates {
            if let Some(agent) = inner.agents.get(candidate) {
                if is_live(agent) {
                    return Ok(Some(agent.id.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn save_decisions(&self, decisions: &[RoutingDecision]) -> Result<()> {
        self.inner.lock().decisions.extend_from_slice(decisions);
        Ok(())
    }

    async fn load_recent_decisions(&self, limit: usize) -> Result<Vec<RoutingDecision>> {
        let inner = self.inner.lock();
        let start = inner.decisions.len().saturating_sub(limit);
        Ok(inner.decisions[start..].to_vec())
    }

    async fn record_activity(
        &self,
        event_type: &str,
        agent_id: &str,
        details: Value,
    ) -> Result<()> {
        self.inner.lock().activities.push(ActivityEntry {
            event_type: event_type.to_string(),
            agent_id: agent_id.to_string(),
            details,
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
