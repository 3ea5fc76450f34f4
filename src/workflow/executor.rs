//! Workflow DAG executor.
//!
//! Drives a workflow execution as a step-dependency state machine: ready
//! steps (all dependencies completed or skipped) are dispatched as tasks,
//! gates pause until a human resolves them, and alerts fire and complete
//! inline. Subtask completions re-enter through
//! [`WorkflowExecutor::on_subtask_complete`], which honors critic vetoes
//! by leaving the step in progress for retry.
//!
//! Execution state lives in an in-memory arena keyed by workflow id, with
//! one async mutex per workflow so step mutations never interleave. Every
//! transition is also persisted into the workflow row's metadata; the
//! arena is not rebuilt after a restart, so status callers must tolerate
//! "durable record only".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{HiveError, Result};
use crate::notify::{MessageKind, Notifier};
use crate::store::{NewTask, Priority, Store, TaskStatus};
use crate::workflow::template::{StepAction, StepSpec, StepState, TemplateRegistry};

/// Agent identity the executor posts under.
const ORCHESTRATOR: &str = "hive";

/// Steps dispatched by the executor sit between `high` and `medium`.
const DISPATCH_PRIORITY: Priority = Priority(3);

/// Completed workflows archive their parent task after this long.
pub const DEFAULT_ARCHIVE_DELAY: Duration = Duration::from_secs(36 * 60 * 60);

/// In-memory execution state for one workflow.
#[derive(Debug)]
pub struct WorkflowState {
    pub id: Uuid,
    pub parent_task_id: Uuid,
    pub template_name: String,
    pub steps: Vec<StepSpec>,
    pub step_status: HashMap<String, StepState>,
    pub step_task_ids: HashMap<String, Uuid>,
    pub step_results: HashMap<String, Value>,
    pub thread_id: Option<String>,
}

impl WorkflowState {
    fn deps_ready(&self, step: &StepSpec) -> bool {
        step.depends_on.iter().all(|dep| {
            self.step_status
                .get(dep)
                .is_some_and(StepState::satisfies_dependency)
        })
    }

    fn ready_steps(&self) -> Vec<StepSpec> {
        self.steps
            .iter()
            .filter(|s| self.step_status.get(&s.name) == Some(&StepState::Pending))
            .filter(|s| self.deps_ready(s))
            .cloned()
            .collect()
    }

    fn all_terminal(&self) -> bool {
        self.steps.iter().all(|s| {
            self.step_status
                .get(&s.name)
                .is_some_and(StepState::is_terminal)
        })
    }

    fn failed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| self.step_status.get(&s.name) == Some(&StepState::Failed))
            .map(|s| s.name.clone())
            .collect()
    }
}

/// Serializable view of the in-memory state, merged into status responses.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub parent_task_id: Uuid,
    pub template: String,
    pub step_status: HashMap<String, StepState>,
    pub step_task_ids: HashMap<String, Uuid>,
    pub step_results: HashMap<String, Value>,
}

/// How a human resolved a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Done,
    Skip,
    Fail,
}

impl GateAction {
    /// Parse a request action; anything unrecognized means `done`.
    pub fn parse(action: Option<&str>) -> Self {
        match action.map(str::to_lowercase).as_deref() {
            Some("skip") => GateAction::Skip,
            Some("fail") => GateAction::Fail,
            _ => GateAction::Done,
        }
    }
}

/// The executor. Cheap to clone via `Arc`; hold one per process.
pub struct WorkflowExecutor {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    templates: TemplateRegistry,
    active: DashMap<Uuid, Arc<Mutex<WorkflowState>>>,
    archive_delay: Duration,
    scheduled_archivals: Arc<DashMap<Uuid, ()>>,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        templates: TemplateRegistry,
    ) -> Self {
        Self {
            store,
            notifier,
            templates,
            active: DashMap::new(),
            archive_delay: DEFAULT_ARCHIVE_DELAY,
            scheduled_archivals: Arc::new(DashMap::new()),
        }
    }

    pub fn with_archive_delay(mut self, delay: Duration) -> Self {
        self.archive_delay = delay;
        self
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Number of executions currently held in memory.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// In-memory state for a workflow, if this process is executing it.
    pub async fn snapshot(&self, workflow_id: Uuid) -> Option<StateSnapshot> {
        let entry = self.active.get(&workflow_id).map(|e| e.value().clone())?;
        let state = entry.lock().await;
        Some(StateSnapshot {
            parent_task_id: state.parent_task_id,
            template: state.template_name.clone(),
            step_status: state.step_status.clone(),
            step_task_ids: state.step_task_ids.clone(),
            step_results: state.step_results.clone(),
        })
    }

    // ---- Lifecycle -------------------------------------------------------

    /// Start executing `template_name` under `parent_task_id`.
    ///
    /// Creates the durable workflow row, seeds every step as pending (the
    /// synthetic `intake` step is pre-completed — that was the preflight),
    /// links the parent task, and advances.
    pub async fn start(
        &self,
        parent_task_id: Uuid,
        template_name: &str,
        thread_id: Option<String>,
    ) -> Result<Uuid> {
        let template = self
            .templates
            .get(template_name)
            .ok_or_else(|| HiveError::UnknownTemplate(template_name.to_string()))?
            .clone();

        let workflow_id = self
            .store
            .insert_workflow(
                &template.name,
                Some(&format!("Workflow for task {parent_task_id}")),
                serde_json::to_value(&template.steps)?,
                json!({
                    "parent_task_id": parent_task_id,
                    "template": template_name,
                }),
            )
            .await?;

        let mut step_status = HashMap::new();
        for step in &template.steps {
            let initial = if step.name == "intake" {
                StepState::Completed
            } else {
                StepState::Pending
            };
            step_status.insert(step.name.clone(), initial);
        }

        let state = WorkflowState {
            id: workflow_id,
            parent_task_id,
            template_name: template_name.to_string(),
            steps: template.steps.clone(),
            step_status,
            step_task_ids: HashMap::new(),
            step_results: HashMap::new(),
            thread_id: thread_id.clone(),
        };
        self.active
            .insert(workflow_id, Arc::new(Mutex::new(state)));

        self.store
            .merge_task_metadata(parent_task_id, json!({ "workflow_id": workflow_id }))
            .await?;

        if let Some(thread) = &thread_id {
            let step_list = template
                .steps
                .iter()
                .filter(|s| s.name != "intake")
                .enumerate()
                .map(|(i, s)| {
                    format!(
                        "{}. {} -> {} — {}",
                        i + 1,
                        s.name,
                        s.agent,
                        s.description.as_deref().unwrap_or("dispatch")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            self.notifier
                .post_update(
                    thread,
                    ORCHESTRATOR,
                    MessageKind::Status,
                    &format!(
                        "Workflow started: {}\n{step_list}\nExecuting steps in dependency order.",
                        template.name
                    ),
                )
                .await;
        }

        tracing::info!(workflow = %workflow_id, template = template_name, "workflow started");
        self.advance(workflow_id).await?;
        Ok(workflow_id)
    }

    /// Find and execute every ready step; detect completion.
    ///
    /// Alerts complete inline, so the ready set is recomputed until it
    /// stops moving. Mutations for one workflow are serialized by its
    /// arena mutex.
    pub async fn advance(&self, workflow_id: Uuid) -> Result<()> {
        let Some(entry) = self.active.get(&workflow_id).map(|e| e.value().clone()) else {
            return Ok(());
        };
        let mut state = entry.lock().await;

        loop {
            let ready = state.ready_steps();
            if ready.is_empty() {
                if state.all_terminal() {
                    self.complete_workflow(&mut state).await?;
                }
                // Otherwise blocked on in-progress or gated steps.
                return Ok(());
            }

            let mut progressed = false;
            for step in ready {
                match step.action {
                    StepAction::Gate => self.enter_gate(&mut state, &step).await?,
                    StepAction::Dispatch => self.dispatch_step(&mut state, &step).await?,
                    StepAction::Alert => {
                        self.fire_alert(&mut state, &step).await?;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    async fn enter_gate(&self, state: &mut WorkflowState, step: &StepSpec) -> Result<()> {
        state
            .step_status
            .insert(step.name.clone(), StepState::WaitingGate);
        self.persist(state, Some(step.step)).await?;

        if let Some(thread) = &state.thread_id {
            let gate_action = step.gate_action.as_deref().unwrap_or("approve");
            self.notifier
                .post_update(
                    thread,
                    ORCHESTRATOR,
                    MessageKind::Question,
                    &format!(
                        "Human gate: {}\n{}\nWorkflow paused. Reply \"done\" when {gate_action} is complete, or \"skip\" to skip this step.",
                        step.name,
                        step.description.as_deref().unwrap_or("action required"),
                    ),
                )
                .await;
        }

        if let Err(e) = self
            .store
            .record_activity(
                "workflow_gate",
                ORCHESTRATOR,
                json!({
                    "workflow_id": state.id,
                    "step": step.name,
                    "gate_action": step.gate_action,
                    "parent_task_id": state.parent_task_id,
                }),
            )
            .await
        {
            tracing::debug!(error = %e, "gate activity not recorded");
        }
        Ok(())
    }

    async fn dispatch_step(&self, state: &mut WorkflowState, step: &StepSpec) -> Result<()> {
        state
            .step_status
            .insert(step.name.clone(), StepState::InProgress);

        let task = self
            .store
            .insert_task(
                NewTask::pending(
                    step.agent.clone(),
                    format!(
                        "[{}] {}: {}",
                        state.template_name,
                        step.name,
                        step.description.as_deref().unwrap_or(&step.name)
                    ),
                )
                .priority(DISPATCH_PRIORITY)
                .metadata(json!({
                    "workflow_id": state.id,
                    "workflow_step": step.name,
                    "parent_task_id": state.parent_task_id,
                    "critic_chain": step.critic_chain,
                    "can_veto": step.can_veto,
                })),
            )
            .await?;

        state.step_task_ids.insert(step.name.clone(), task.id);
        self.persist(state, Some(step.step)).await?;

        if let Some(thread) = &state.thread_id {
            self.notifier
                .post_update(
                    thread,
                    ORCHESTRATOR,
                    MessageKind::Handoff,
                    &format!(
                        "Step {} -> dispatched to {}\n{}",
                        step.name,
                        step.agent,
                        step.description.as_deref().unwrap_or("")
                    ),
                )
                .await;
        }
        tracing::info!(workflow = %state.id, step = %step.name, agent = %step.agent, task = %task.id, "step dispatched");
        Ok(())
    }

    async fn fire_alert(&self, state: &mut WorkflowState, step: &StepSpec) -> Result<()> {
        if let Some(thread) = &state.thread_id {
            self.notifier
                .post_update(
                    thread,
                    &step.agent,
                    MessageKind::Status,
                    &format!(
                        "Alert: {}\n{}",
                        step.name,
                        step.description.as_deref().unwrap_or("notification sent")
                    ),
                )
                .await;
        }
        state
            .step_status
            .insert(step.name.clone(), StepState::Completed);
        self.persist(state, None).await?;
        Ok(())
    }

    // ---- Completion feedback --------------------------------------------

    /// Hook for completed tasks: advance the owning workflow, unless a
    /// critic veto is holding the step for retry.
    pub async fn on_subtask_complete(&self, task_id: Uuid, result: Value) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        let Some(workflow_id) = task
            .meta_str("workflow_id")
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return Ok(());
        };
        let Some(step_name) = task.meta_str("workflow_step").map(str::to_string) else {
            return Ok(());
        };

        let Some(entry) = self.active.get(&workflow_id).map(|e| e.value().clone()) else {
            // Durable record exists but this process isn't executing it;
            // rehydration is an open question, so only note it.
            tracing::warn!(workflow = %workflow_id, "completed subtask for workflow not held in memory");
            return Ok(());
        };

        {
            let mut state = entry.lock().await;
            let Some(step) = state.steps.iter().find(|s| s.name == step_name).cloned() else {
                return Ok(());
            };

            if step.critic_chain.is_some() && step.can_veto {
                let vetoed = task
                    .metadata
                    .get("critic_veto")
                    .is_some_and(|v| !v.is_null());
                if vetoed {
                    if let Some(thread) = &state.thread_id {
                        let reasons = task.metadata["critic_veto"]["reasons"]
                            .as_array()
                            .map(|rs| {
                                rs.iter()
                                    .map(|r| {
                                        format!(
                                            "- {}: {}",
                                            r["agent"].as_str().unwrap_or("?"),
                                            r["reason"].as_str().unwrap_or("no reason")
                                        )
                                    })
                                    .collect::<Vec<_>>()
                                    .join("\n")
                            })
                            .unwrap_or_default();
                        self.notifier
                            .post_update(
                                thread,
                                &step.agent,
                                MessageKind::Veto,
                                &format!(
                                    "Veto on step {step_name}\n{reasons}\nReturning to agent for revision."
                                ),
                            )
                            .await;
                    }
                    // Step stays in_progress; the agent retries.
                    return Ok(());
                }
            }

            state
                .step_status
                .insert(step_name.clone(), StepState::Completed);
            state.step_results.insert(step_name.clone(), result);
            self.persist(&state, None).await?;

            if let Some(thread) = &state.thread_id {
                self.notifier
                    .post_update(
                        thread,
                        &step.agent,
                        MessageKind::Approval,
                        &format!("Step completed: {step_name}"),
                    )
                    .await;
            }
        }

        self.advance(workflow_id).await
    }

    /// Force a step into a terminal state: optional steps skip, mandatory
    /// steps fail. Sibling branches keep going either way.
    pub async fn fail_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
        reason: Option<&str>,
    ) -> Result<StepState> {
        let Some(entry) = self.active.get(&workflow_id).map(|e| e.value().clone()) else {
            return Err(HiveError::WorkflowNotActive(workflow_id));
        };

        let new_state = {
            let mut state = entry.lock().await;
            let Some(step) = state.steps.iter().find(|s| s.name == step_name).cloned() else {
                return Err(HiveError::StepNotFound {
                    workflow: workflow_id,
                    step: step_name.to_string(),
                });
            };
            let new_state = if step.optional {
                StepState::Skipped
            } else {
                StepState::Failed
            };
            state.step_status.insert(step.name.clone(), new_state);
            self.persist(&state, None).await?;

            if let Some(thread) = &state.thread_id {
                let kind = if step.optional {
                    MessageKind::Status
                } else {
                    MessageKind::Veto
                };
                let reason_line = reason.map(|r| format!("\nReason: {r}")).unwrap_or_default();
                self.notifier
                    .post_update(
                        thread,
                        &step.agent,
                        kind,
                        &format!("Step {}: {step_name}{reason_line}", new_state.as_str()),
                    )
                    .await;
            }
            new_state
        };

        self.advance(workflow_id).await?;
        Ok(new_state)
    }

    /// Resolve a waiting gate. With no step name, the first waiting gate
    /// is taken.
    pub async fn resolve_gate(
        &self,
        workflow_id: Uuid,
        action: GateAction,
        step_name: Option<&str>,
    ) -> Result<String> {
        let Some(entry) = self.active.get(&workflow_id).map(|e| e.value().clone()) else {
            return Err(HiveError::WorkflowNotActive(workflow_id));
        };

        let resolved = {
            let mut state = entry.lock().await;
            let gated = state
                .steps
                .iter()
                .find(|s| {
                    state.step_status.get(&s.name) == Some(&StepState::WaitingGate)
                        && step_name.is_none_or(|n| n == s.name)
                })
                .cloned()
                .ok_or(HiveError::NoWaitingGate(workflow_id))?;

            let (new_state, kind, verb) = match action {
                GateAction::Done => (StepState::Completed, MessageKind::Approval, "resolved"),
                GateAction::Skip => (StepState::Skipped, MessageKind::Status, "skipped"),
                GateAction::Fail => (StepState::Failed, MessageKind::Veto, "failed"),
            };
            state.step_status.insert(gated.name.clone(), new_state);
            self.persist(&state, None).await?;

            if let Some(thread) = &state.thread_id {
                self.notifier
                    .post_update(
                        thread,
                        ORCHESTRATOR,
                        kind,
                        &format!("Gate {verb}: {} — continuing workflow", gated.name),
                    )
                    .await;
            }
            gated.name
        };

        self.advance(workflow_id).await?;
        Ok(resolved)
    }

    // ---- Completion ------------------------------------------------------

    async fn complete_workflow(&self, state: &mut WorkflowState) -> Result<()> {
        let failed = state.failed_steps();
        let final_status = if failed.is_empty() {
            "completed"
        } else {
            "failed"
        };

        self.store
            .finish_workflow(
                state.id,
                final_status,
                json!({
                    "step_status": state.step_status,
                    "step_results": state.step_results,
                    "failed_steps": failed,
                }),
            )
            .await?;

        if failed.is_empty() {
            let summary = format!(
                "Workflow '{}' completed — {} steps executed",
                state.template_name,
                state.steps.len()
            );
            self.store
                .complete_task(
                    state.parent_task_id,
                    json!({ "workflow_id": state.id }),
                    Some(&summary),
                )
                .await?;
        } else {
            self.store
                .fail_task(
                    state.parent_task_id,
                    &format!(
                        "Workflow '{}' failed — steps: {}",
                        state.template_name,
                        failed.join(", ")
                    ),
                )
                .await?;
        }

        if let Some(thread) = &state.thread_id {
            let summary = state
                .steps
                .iter()
                .filter(|s| s.name != "intake")
                .map(|s| {
                    let status = state
                        .step_status
                        .get(&s.name)
                        .map(StepState::as_str)
                        .unwrap_or("unknown");
                    format!("{} ({}) — {status}", s.name, s.agent)
                })
                .collect::<Vec<_>>()
                .join("\n");
            self.notifier
                .post_update(
                    thread,
                    ORCHESTRATOR,
                    MessageKind::CompletionSummary,
                    &format!(
                        "Workflow {}: {}\n{summary}",
                        if failed.is_empty() { "complete" } else { "failed" },
                        state.template_name
                    ),
                )
                .await;
        }

        self.schedule_archival(state.parent_task_id);

        if let Err(e) = self
            .store
            .record_activity(
                "workflow_completed",
                ORCHESTRATOR,
                json!({
                    "workflow_id": state.id,
                    "template": state.template_name,
                    "parent_task_id": state.parent_task_id,
                    "status": final_status,
                    "steps_completed": state
                        .step_status
                        .values()
                        .filter(|s| **s == StepState::Completed)
                        .count(),
                    "steps_total": state.steps.len(),
                }),
            )
            .await
        {
            tracing::debug!(error = %e, "completion activity not recorded");
        }

        tracing::info!(workflow = %state.id, status = final_status, "workflow finished");
        self.active.remove(&state.id);
        Ok(())
    }

    // ---- Archival --------------------------------------------------------

    /// Schedule the parent task for archival after the configured delay.
    /// Idempotent per task.
    pub fn schedule_archival(&self, task_id: Uuid) {
        if self.scheduled_archivals.contains_key(&task_id) {
            return;
        }
        self.scheduled_archivals.insert(task_id, ());

        let store = self.store.clone();
        let notifier = self.notifier.clone();
        let scheduled = self.scheduled_archivals.clone();
        let delay = self.archive_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            archive_task(store, notifier, task_id).await;
            scheduled.remove(&task_id);
        });
    }

    /// Archive immediately (manual archival endpoint).
    pub async fn archive_now(&self, task_id: Uuid) -> Result<()> {
        archive_task(self.store.clone(), self.notifier.clone(), task_id).await;
        self.scheduled_archivals.remove(&task_id);
        Ok(())
    }

    /// How many archival timers are outstanding.
    pub fn pending_archivals(&self) -> usize {
        self.scheduled_archivals.len()
    }

    async fn persist(&self, state: &WorkflowState, current_step: Option<i32>) -> Result<()> {
        self.store
            .update_workflow_meta(
                state.id,
                current_step,
                json!({
                    "step_status": state.step_status,
                    "step_task_ids": state.step_task_ids,
                    "step_results": state.step_results,
                }),
            )
            .await
    }
}

async fn archive_task(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, task_id: Uuid) {
    let task = match store.get_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(task = %task_id, error = %e, "archival lookup failed");
            return;
        }
    };
    if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
        tracing::debug!(task = %task_id, status = %task.status, "skipping archival of live task");
        return;
    }
    if let Some(thread) = task.meta_str("thread_id") {
        notifier.archive_thread(thread).await;
    }
    if let Err(e) = store.mark_archived(task_id).await {
        tracing::error!(task = %task_id, error = %e, "archival failed");
    } else {
        tracing::info!(task = %task_id, "task archived");
    }
}
