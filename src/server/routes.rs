//! Axum route handlers for the taskhive control plane.
//!
//! # Routes
//!
//! - `GET  /health` — liveness probe
//! - `POST /register` / `POST /heartbeat` / `GET /agents` — fleet liveness
//! - `POST /dispatch` — create a task, with fallback-agent selection
//! - `POST /preflight`, `POST /preflight/{id}/approve` — plan approval gate
//! - `POST /complete` — finish a task against its acceptance criteria
//! - `POST /validate` — run a critic chain over a task output
//! - `GET  /tasks`, `GET /task/{id}`, `POST /task/{id}/archive`
//! - `GET  /workflow/{id}`, `GET /workflows` — merged durable + in-memory state
//! - `POST /workflow/{id}/gate`, `POST /workflow/{id}/step/{name}/fail`
//! - `GET  /status` — aggregate counts

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::HiveError;
use crate::notify::{MessageKind, Notifier, NullNotifier, WebhookNotifier};
use crate::routing::OutcomeTracker;
use crate::store::{AgentRecord, NewTask, Priority, Store, Task, TaskStatus};
use crate::workflow::{
    acceptance, ChainRegistry, CriticEngine, GateAction, QueuedCriticInvoker, TemplateRegistry,
    ValidationOutcome, WorkflowExecutor,
};

/// Shared application state for the control plane.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub executor: Arc<WorkflowExecutor>,
    pub critic: Arc<CriticEngine>,
    pub tracker: OutcomeTracker,
    pub notifier: Arc<dyn Notifier>,
    pub settings: Settings,
}

impl AppState {
    /// Wire up the full state from settings: notifier, template and chain
    /// registries, executor, critic engine and outcome tracker.
    pub fn new(store: Arc<dyn Store>, settings: Settings) -> Self {
        let notifier: Arc<dyn Notifier> = match &settings.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(NullNotifier),
        };

        let templates = match &settings.workflows_path {
            Some(path) => TemplateRegistry::load(path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "workflow templates unavailable");
                TemplateRegistry::default()
            }),
            None => TemplateRegistry::default(),
        };
        let chains = match &settings.critic_chains_path {
            Some(path) => ChainRegistry::load_or_default(path),
            None => ChainRegistry::default(),
        };

        let executor = Arc::new(
            WorkflowExecutor::new(store.clone(), notifier.clone(), templates)
                .with_archive_delay(settings.archive_delay),
        );
        let critic = Arc::new(CriticEngine::new(
            store.clone(),
            chains,
            Arc::new(QueuedCriticInvoker::new(
                store.clone(),
                Duration::from_secs(30),
            )),
        ));
        let tracker = OutcomeTracker::with_debounce(store.clone(), settings.outcome_save_interval);

        Self {
            store,
            executor,
            critic,
            tracker,
            notifier,
            settings,
        }
    }
}

type HandlerError = (StatusCode, Json<Value>);
type HandlerResult = Result<Json<Value>, HandlerError>;

fn bad_request(message: impl Into<String>) -> HandlerError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

fn not_found(message: impl Into<String>) -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": message.into() })),
    )
}

fn internal(error: HiveError) -> HandlerError {
    tracing::error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
}

fn parse_uuid(raw: &str) -> Result<Uuid, HandlerError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid id: {raw}")))
}

fn body_str<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/agents", get(agents_handler))
        .route("/dispatch", post(dispatch_handler))
        .route("/preflight", post(preflight_handler))
        .route("/preflight/{id}/approve", post(preflight_approve_handler))
        .route("/complete", post(complete_handler))
        .route("/validate", post(validate_handler))
        .route("/tasks", get(list_tasks_handler))
        .route("/task/{id}", get(get_task_handler))
        .route("/task/{id}/archive", post(archive_task_handler))
        .route("/workflow/{id}", get(get_workflow_handler))
        .route("/workflows", get(list_workflows_handler))
        .route("/workflow/{id}/gate", post(gate_handler))
        .route("/workflow/{id}/step/{name}/fail", post(fail_step_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health — liveness probe.
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "taskhive",
        "version": crate::VERSION,
    }))
}

// ---------------------------------------------------------------------------
// Fleet registration + liveness
// ---------------------------------------------------------------------------

/// POST /register — an agent announces itself.
async fn register_handler(State(state): State<AppState>, Json(body): Json<Value>) -> HandlerResult {
    let agent_id = body_str(&body, "agent_id")
        .ok_or_else(|| bad_request("agent_id, name, and role are required"))?;
    let name = body_str(&body, "name")
        .ok_or_else(|| bad_request("agent_id, name, and role are required"))?;
    let role = body_str(&body, "role")
        .ok_or_else(|| bad_request("agent_id, name, and role are required"))?;

    let record = AgentRecord {
        id: agent_id.to_string(),
        name: name.to_string(),
        role: role.to_string(),
        capabilities: body
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        endpoint: body_str(&body, "endpoint").map(str::to_string),
        location: body_str(&body, "location").map(str::to_string),
        status: body_str(&body, "status").unwrap_or("online").to_string(),
        last_heartbeat: Utc::now(),
        metadata: body.get("metadata").cloned().unwrap_or_else(|| json!({})),
    };
    state.store.upsert_agent(record).await.map_err(internal)?;

    Ok(Json(json!({
        "registered": true,
        "session_token": format!("hive_{}", Uuid::new_v4().simple()),
        "heartbeat_interval": state.settings.heartbeat_interval.as_secs(),
    })))
}

/// POST /heartbeat — an agent reports status.
async fn heartbeat_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let agent_id =
        body_str(&body, "agent_id").ok_or_else(|| bad_request("agent_id is required"))?;
    let status = body_str(&body, "status");

    let payload = json!({
        "session_token": body.get("session_token"),
        "current_task": body.get("current_task"),
        "metrics": body.get("metrics"),
        "received_at": Utc::now().to_rfc3339(),
    });

    let known = state
        .store
        .record_heartbeat(agent_id, status, payload)
        .await
        .map_err(internal)?;
    if !known {
        return Err(not_found("Agent not found. Register first."));
    }

    Ok(Json(json!({
        "acknowledged": true,
        "agent_id": agent_id,
    })))
}

/// GET /agents — list registered agents.
async fn agents_handler(State(state): State<AppState>) -> HandlerResult {
    let agents = state.store.list_agents().await.map_err(internal)?;
    Ok(Json(json!({
        "count": agents.len(),
        "agents": agents,
    })))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// POST /dispatch — create a task for the best available agent.
///
/// A named `preferred_agent` must be registered; when it isn't, the first
/// live `fallback_agents` entry takes the task. With no preference the
/// most recently heartbeating live agent is chosen.
async fn dispatch_handler(State(state): State<AppState>, Json(body): Json<Value>) -> HandlerResult {
    let task_name = body_str(&body, "task").ok_or_else(|| bad_request("task is required"))?;
    let fallback_agents: Vec<String> = body
        .get("fallback_agents")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let target = match body_str(&body, "preferred_agent") {
        Some(preferred) => match state.store.get_agent(preferred).await.map_err(internal)? {
            Some(agent) => agent.id,
            None => state
                .store
                .find_live_agent(&fallback_agents)
                .await
                .map_err(internal)?
                .ok_or_else(|| {
                    if fallback_agents.is_empty() {
                        not_found(format!("Preferred agent '{preferred}' not found"))
                    } else {
                        not_found("No available agents found (preferred and fallbacks unavailable)")
                    }
                })?,
        },
        None => state
            .store
            .find_live_agent(&[])
            .await
            .map_err(internal)?
            .ok_or_else(|| not_found("No available agents to dispatch to"))?,
    };

    let priority = Priority::from_value(body.get("priority"));
    let acceptance_criteria = body.get("acceptance_criteria").cloned();
    let task = state
        .store
        .insert_task(
            NewTask::pending(target.clone(), task_name)
                .priority(priority)
                .metadata(json!({
                    "fallback_agents": fallback_agents,
                    "acceptance_criteria": acceptance_criteria,
                    "dispatched_at": Utc::now().to_rfc3339(),
                })),
        )
        .await
        .map_err(internal)?;

    let thread = state
        .notifier
        .create_task_thread(&task.id.to_string(), task_name, &target, priority)
        .await;
    if let Some(thread) = &thread {
        let _ = state
            .store
            .merge_task_metadata(task.id, json!({ "thread_id": thread.thread_id }))
            .await;
    }

    if let Err(e) = state
        .store
        .record_activity(
            "task_created",
            &target,
            json!({ "task_id": task.id, "task_name": task_name, "priority": priority }),
        )
        .await
    {
        tracing::debug!(error = %e, "activity not recorded");
    }

    Ok(Json(json!({
        "dispatched": true,
        "task_id": task.id,
        "assigned_agent": task.assigned_agent,
        "priority": task.priority,
        "status": task.status,
        "created_at": task.created_at,
        "has_acceptance_criteria": acceptance_criteria.is_some(),
        "thread_id": thread.map(|t| t.thread_id),
    })))
}

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

/// POST /preflight — file a plan that waits for human approval.
async fn preflight_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let task_name =
        body_str(&body, "task").ok_or_else(|| bad_request("task and intent are required"))?;
    let intent =
        body_str(&body, "intent").ok_or_else(|| bad_request("task and intent are required"))?;

    let coordinator = state.settings.fallback_agent.clone();
    let priority = Priority::from_value(body.get("priority"));
    let task = state
        .store
        .insert_task(
            NewTask::pending(coordinator.clone(), task_name)
                .description(intent)
                .status(TaskStatus::AwaitingApproval)
                .priority(priority)
                .metadata(json!({
                    "preflight": {
                        "intent": intent,
                        "plan": body.get("plan").cloned().unwrap_or_else(|| json!([])),
                        "verification": body.get("verification"),
                        "risks": body.get("risks").cloned().unwrap_or_else(|| json!([])),
                        "estimated_agents": body.get("estimated_agents").cloned().unwrap_or_else(|| json!([])),
                        "workflow_template": body.get("workflow_template"),
                        "acceptance_criteria": body.get("acceptance_criteria"),
                    },
                    "dispatched_at": Utc::now().to_rfc3339(),
                })),
        )
        .await
        .map_err(internal)?;

    let thread = state
        .notifier
        .create_task_thread(&task.id.to_string(), task_name, &coordinator, priority)
        .await;
    if let Some(thread) = &thread {
        let _ = state
            .store
            .merge_task_metadata(task.id, json!({ "thread_id": thread.thread_id }))
            .await;
        state
            .notifier
            .post_update(
                &thread.thread_id,
                &coordinator,
                MessageKind::Status,
                &format!(
                    "Pre-flight check — awaiting approval\nIntent: {intent}\nReply \"go\" to approve, \"stop\" to cancel, or \"modify\" to adjust the plan."
                ),
            )
            .await;
    }

    Ok(Json(json!({
        "preflight_id": task.id,
        "status": "awaiting_approval",
        "task": task_name,
        "intent": intent,
        "next_action": format!("POST /preflight/{}/approve", task.id),
    })))
}

/// POST /preflight/{id}/approve — resolve a pre-flight plan.
///
/// `go` moves the task to pending and starts its workflow template, if
/// one was named. `stop` cancels. `modify` stores the modifications and
/// keeps waiting.
async fn preflight_approve_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let task_id = parse_uuid(&id)?;
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Task '{id}' not found")))?;

    if task.status != TaskStatus::AwaitingApproval {
        return Err(bad_request(format!(
            "Task is '{}', not awaiting_approval",
            task.status
        )));
    }

    let thread_id = task.meta_str("thread_id").map(str::to_string);
    let action = body_str(&body, "action").unwrap_or("go").to_lowercase();

    match action.as_str() {
        "stop" => {
            state
                .store
                .set_task_status(task_id, TaskStatus::Cancelled)
                .await
                .map_err(internal)?;
            state
                .store
                .merge_task_metadata(
                    task_id,
                    json!({ "cancelled": { "reason": "Human cancelled pre-flight", "at": Utc::now().to_rfc3339() } }),
                )
                .await
                .map_err(internal)?;
            if let Some(thread) = &thread_id {
                state
                    .notifier
                    .post_update(
                        thread,
                        &state.settings.fallback_agent,
                        MessageKind::Status,
                        "Cancelled — human stopped this task.",
                    )
                    .await;
                state.notifier.archive_thread(thread).await;
            }
            Ok(Json(json!({ "task_id": task_id, "status": "cancelled" })))
        }
        "modify" => {
            let mut preflight = task
                .metadata
                .get("preflight")
                .cloned()
                .unwrap_or_else(|| json!({}));
            preflight["modifications"] = body.get("modifications").cloned().unwrap_or(Value::Null);
            preflight["modified_at"] = json!(Utc::now().to_rfc3339());
            state
                .store
                .merge_task_metadata(task_id, json!({ "preflight": preflight }))
                .await
                .map_err(internal)?;
            Ok(Json(json!({
                "task_id": task_id,
                "status": "awaiting_approval",
                "modified": true,
            })))
        }
        _ => {
            // "go"
            state
                .store
                .set_task_status(task_id, TaskStatus::Pending)
                .await
                .map_err(internal)?;
            state
                .store
                .merge_task_metadata(
                    task_id,
                    json!({ "approved": { "by": "human", "at": Utc::now().to_rfc3339() } }),
                )
                .await
                .map_err(internal)?;
            if let Some(thread) = &thread_id {
                state
                    .notifier
                    .post_update(
                        thread,
                        &state.settings.fallback_agent,
                        MessageKind::Approval,
                        "Approved — workflow execution starting.",
                    )
                    .await;
            }

            let template = task
                .metadata
                .get("preflight")
                .and_then(|p| p.get("workflow_template"))
                .and_then(Value::as_str)
                .map(str::to_string);

            let workflow_id = match &template {
                Some(template) => match state.executor.start(task_id, template, thread_id).await {
                    Ok(id) => Some(id),
                    Err(HiveError::UnknownTemplate(name)) => {
                        tracing::warn!(template = %name, "approved preflight names unknown template");
                        None
                    }
                    Err(e) => return Err(internal(e)),
                },
                None => None,
            };

            Ok(Json(json!({
                "task_id": task_id,
                "status": "approved",
                "workflow_template": template,
                "workflow_id": workflow_id,
                "executing": workflow_id.is_some(),
            })))
        }
    }
}

// ---------------------------------------------------------------------------
// Completion + validation
// ---------------------------------------------------------------------------

/// POST /complete — finish a task, checking acceptance criteria.
///
/// Violations leave the task incomplete and are returned to the caller; a
/// clean result marks the task completed and feeds the workflow executor
/// and the routing outcome tracker.
async fn complete_handler(State(state): State<AppState>, Json(body): Json<Value>) -> HandlerResult {
    let task_id = body_str(&body, "task_id")
        .ok_or_else(|| bad_request("task_id and agent_id are required"))
        .and_then(|raw| parse_uuid(raw))?;
    let agent_id = body_str(&body, "agent_id")
        .ok_or_else(|| bad_request("task_id and agent_id are required"))?;
    let result = body.get("result").cloned();

    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Task '{task_id}' not found")))?;

    if let Some(criteria) = task
        .metadata
        .get("acceptance_criteria")
        .filter(|c| !c.is_null())
    {
        let violations = acceptance::validate(criteria, result.as_ref());
        if !violations.is_empty() {
            state
                .store
                .merge_task_metadata(task_id, json!({ "validation_failures": violations }))
                .await
                .map_err(internal)?;
            state.tracker.record(task_id, agent_id, 0.0, false);
            return Ok(Json(json!({
                "completed": false,
                "task_id": task_id,
                "violations": violations,
                "message": "Task result did not meet acceptance criteria",
            })));
        }
    }

    let summary = result
        .as_ref()
        .and_then(|r| r.get("summary"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Task completed by {agent_id}"));

    let result = result.unwrap_or_else(|| json!({}));
    state
        .store
        .complete_task(task_id, result.clone(), Some(&summary))
        .await
        .map_err(internal)?;
    if let Err(e) = state.store.add_participant(task_id, agent_id).await {
        tracing::debug!(error = %e, "participant not recorded");
    }

    if let Some(thread) = task.meta_str("thread_id") {
        state
            .notifier
            .post_update(thread, agent_id, MessageKind::CompletionSummary, &summary)
            .await;
        state.executor.schedule_archival(task_id);
    }

    // Feed the routing feedback loop.
    state.tracker.record(task_id, agent_id, 1.0, true);

    // Advance the owning workflow, if any.
    if let Err(e) = state.executor.on_subtask_complete(task_id, result).await {
        tracing::error!(task = %task_id, error = %e, "workflow advance after completion failed");
    }

    if let Err(e) = state
        .store
        .record_activity(
            "task_completed",
            agent_id,
            json!({ "task_id": task_id, "summary": summary }),
        )
        .await
    {
        tracing::debug!(error = %e, "activity not recorded");
    }

    Ok(Json(json!({
        "completed": true,
        "task_id": task_id,
        "agent_id": agent_id,
        "violations": [],
        "completion_summary": summary,
    })))
}

/// POST /validate — run a critic chain over a task output.
async fn validate_handler(State(state): State<AppState>, Json(body): Json<Value>) -> HandlerResult {
    let task_id = body_str(&body, "task_id")
        .ok_or_else(|| bad_request("task_id, chain_name, and output are required"))
        .and_then(|raw| parse_uuid(raw))?;
    let chain_name = body_str(&body, "chain_name")
        .ok_or_else(|| bad_request("task_id, chain_name, and output are required"))?;
    let output = body
        .get("output")
        .filter(|o| !o.is_null())
        .ok_or_else(|| bad_request("task_id, chain_name, and output are required"))?;
    let originating_agent = body_str(&body, "originating_agent");
    let retry_count = body
        .get("retry_count")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    let outcome = state
        .critic
        .validate(task_id, chain_name, output, originating_agent, retry_count)
        .await
        .map_err(|e| match e {
            HiveError::TaskNotFound(id) => not_found(format!("Task '{id}' not found")),
            other => internal(other),
        })?;

    let response = match outcome {
        ValidationOutcome::Approved { verdicts } => json!({
            "validated": true,
            "task_id": task_id,
            "chain": chain_name,
            "verdicts": verdicts,
        }),
        ValidationOutcome::Vetoed {
            verdicts,
            veto_reasons,
            return_to,
            retry_count,
            max_retries,
        } => json!({
            "validated": false,
            "task_id": task_id,
            "chain": chain_name,
            "verdicts": verdicts,
            "veto_reasons": veto_reasons,
            "return_to_agent": return_to,
            "retry_count": retry_count,
            "max_retries": max_retries,
        }),
        ValidationOutcome::Escalated {
            escalation,
            retry_count,
        } => json!({
            "validated": false,
            "task_id": task_id,
            "chain": chain_name,
            "retry_count": retry_count,
            "max_retries_exceeded": true,
            "escalation": escalation,
        }),
    };
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    #[serde(default)]
    include_archived: bool,
    limit: Option<usize>,
}

/// GET /tasks — list tasks, newest first.
async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> HandlerResult {
    let status = match &query.status {
        Some(raw) => Some(
            TaskStatus::parse(raw).ok_or_else(|| bad_request(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    let tasks = state
        .store
        .list_tasks(status, query.include_archived, query.limit.unwrap_or(50))
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "count": tasks.len(), "tasks": tasks })))
}

/// GET /task/{id} — fetch one task.
async fn get_task_handler(State(state): State<AppState>, Path(id): Path<String>) -> HandlerResult {
    let task_id = parse_uuid(&id)?;
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Task '{id}' not found")))?;
    Ok(Json(json!({ "task": task })))
}

/// POST /task/{id}/archive — archive a finished task immediately.
async fn archive_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let task_id = parse_uuid(&id)?;
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Task '{id}' not found")))?;

    if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
        return Err(bad_request(format!(
            "Can only archive completed or failed tasks (current: {})",
            task.status
        )));
    }

    state
        .executor
        .archive_now(task_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "archived": true, "task_id": task_id })))
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

fn merged_workflow_view(
    record: &crate::store::WorkflowRecord,
    snapshot: Option<&crate::workflow::StateSnapshot>,
) -> Value {
    let meta = &record.metadata;
    json!({
        "id": record.id,
        "name": record.name,
        "status": record.status,
        "current_step": record.current_step,
        "steps": record.steps,
        "step_status": snapshot
            .map(|s| json!(s.step_status))
            .unwrap_or_else(|| meta.get("step_status").cloned().unwrap_or_else(|| json!({}))),
        "step_task_ids": snapshot
            .map(|s| json!(s.step_task_ids))
            .unwrap_or_else(|| meta.get("step_task_ids").cloned().unwrap_or_else(|| json!({}))),
        "parent_task_id": meta.get("parent_task_id"),
        "template": meta.get("template"),
        "created_at": record.created_at,
        "updated_at": record.updated_at,
        "result": record.result,
    })
}

/// GET /workflow/{id} — durable record merged with live step state.
async fn get_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let workflow_id = parse_uuid(&id)?;
    let record = state
        .store
        .get_workflow(workflow_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Workflow '{id}' not found")))?;
    let snapshot = state.executor.snapshot(workflow_id).await;

    // Subtasks spawned by this workflow, matched through their metadata.
    let workflow_key = workflow_id.to_string();
    let subtasks: Vec<Task> = state
        .store
        .list_tasks(None, true, 500)
        .await
        .map_err(internal)?
        .into_iter()
        .filter(|t| t.meta_str("workflow_id") == Some(workflow_key.as_str()))
        .collect();

    Ok(Json(json!({
        "workflow": merged_workflow_view(&record, snapshot.as_ref()),
        "subtasks": subtasks,
        "active_in_memory": snapshot.is_some(),
    })))
}

/// GET /workflows — recent workflows with merged state.
async fn list_workflows_handler(State(state): State<AppState>) -> HandlerResult {
    let records = state.store.list_workflows(50).await.map_err(internal)?;
    let mut workflows = Vec::with_capacity(records.len());
    for record in &records {
        let snapshot = state.executor.snapshot(record.id).await;
        workflows.push(merged_workflow_view(record, snapshot.as_ref()));
    }
    Ok(Json(json!({
        "count": workflows.len(),
        "workflows": workflows,
        "active_in_memory": state.executor.active_count(),
    })))
}

/// POST /workflow/{id}/gate — resolve a waiting human gate.
async fn gate_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let workflow_id = parse_uuid(&id)?;
    let action = GateAction::parse(body_str(&body, "action"));
    let step_name = body_str(&body, "step_name");

    let resolved = state
        .executor
        .resolve_gate(workflow_id, action, step_name)
        .await
        .map_err(|e| match e {
            HiveError::WorkflowNotActive(_) => not_found(
                "Workflow not found in active workflows (it may have completed or the server restarted)",
            ),
            HiveError::NoWaitingGate(_) => bad_request("No waiting gate found"),
            other => internal(other),
        })?;

    let snapshot = state.executor.snapshot(workflow_id).await;
    Ok(Json(json!({
        "workflow_id": workflow_id,
        "gate_step": resolved,
        "step_status": snapshot
            .map(|s| json!(s.step_status))
            .unwrap_or_else(|| json!({})),
    })))
}

/// POST /workflow/{id}/step/{name}/fail — force a step terminal.
async fn fail_step_handler(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let workflow_id = parse_uuid(&id)?;
    let reason = body_str(&body, "reason");

    let new_state = state
        .executor
        .fail_step(workflow_id, &name, reason)
        .await
        .map_err(|e| match e {
            HiveError::WorkflowNotActive(_) => not_found("Workflow not found in active workflows"),
            HiveError::StepNotFound { step, .. } => {
                not_found(format!("Step '{step}' not found in workflow"))
            }
            other => internal(other),
        })?;

    Ok(Json(json!({
        "workflow_id": workflow_id,
        "step": name,
        "status": new_state.as_str(),
        "reason": reason,
    })))
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// GET /status — fleet and queue counts.
async fn status_handler(State(state): State<AppState>) -> HandlerResult {
    let agents = state.store.list_agents().await.map_err(internal)?;
    let mut agents_by_status: serde_json::Map<String, Value> = serde_json::Map::new();
    let now = Utc::now();
    let mut online = 0usize;
    for agent in &agents {
        let counter = agents_by_status
            .entry(agent.status.clone())
            .or_insert_with(|| json!(0));
        *counter = json!(counter.as_u64().unwrap_or(0) + 1);
        if (now - agent.last_heartbeat).num_seconds() < 60 {
            online += 1;
        }
    }

    let tasks = state
        .store
        .list_tasks(None, true, 1000)
        .await
        .map_err(internal)?;
    let mut tasks_by_status: serde_json::Map<String, Value> = serde_json::Map::new();
    for task in &tasks {
        let counter = tasks_by_status
            .entry(task.status.as_str().to_string())
            .or_insert_with(|| json!(0));
        *counter = json!(counter.as_u64().unwrap_or(0) + 1);
    }

    Ok(Json(json!({
        "agents": {
            "total": agents.len(),
            "online": online,
            "by_status": agents_by_status,
        },
        "tasks": tasks_by_status,
        "workflows": { "active_in_memory": state.executor.active_count() },
        "timestamp": now.to_rfc3339(),
    })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::recording::RecordingNotifier;
    use crate::store::MemoryStore;
    use crate::workflow::{StepAction, StepSpec, WorkflowTemplate};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(store: MemoryStore) -> AppState {
        let notifier = Arc::new(RecordingNotifier::new());
        let mut templates = TemplateRegistry::default();
        templates.insert(
            "two-step",
            WorkflowTemplate {
                name: "Two step".to_string(),
                steps: vec![
                    StepSpec {
                        step: 1,
                        name: "work".to_string(),
                        action: StepAction::Dispatch,
                        agent: "ada".to_string(),
                        description: None,
                        depends_on: Vec::new(),
                        critic_chain: None,
                        can_veto: false,
                        gate_action: None,
                        optional: false,
                    },
                    StepSpec {
                        step: 2,
                        name: "signoff".to_string(),
                        action: StepAction::Gate,
                        agent: "human".to_string(),
                        description: None,
                        depends_on: vec!["work".to_string()],
                        critic_chain: None,
                        can_veto: false,
                        gate_action: Some("review".to_string()),
                        optional: false,
                    },
                ],
            },
        );

        let store: Arc<dyn Store> = Arc::new(store);
        let settings = Settings::default();
        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            notifier.clone(),
            templates,
        ));
        let critic = Arc::new(CriticEngine::new(
            store.clone(),
            ChainRegistry::default(),
            Arc::new(QueuedCriticInvoker::new(
                store.clone(),
                Duration::from_millis(50),
            )),
        ));
        let tracker = OutcomeTracker::with_debounce(store.clone(), Duration::from_millis(50));
        AppState {
            store,
            executor,
            critic,
            tracker,
            notifier,
            settings,
        }
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn register_agent(store: &MemoryStore, id: &str, status: &str) {
        store
            .upsert_agent(AgentRecord {
                id: id.to_string(),
                name: id.to_string(),
                role: "worker".to_string(),
                capabilities: Vec::new(),
                endpoint: None,
                location: None,
                status: status.to_string(),
                last_heartbeat: Utc::now(),
                metadata: json!({}),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_reports_service_identity() {
        let app = app_router(test_state(MemoryStore::new()));
        let (status, body) = send(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "taskhive");
    }

    #[tokio::test]
    async fn register_then_heartbeat_round_trip() {
        let store = MemoryStore::new();
        let app = app_router(test_state(store.clone()));

        let (status, body) = send(
            app.clone(),
            "POST",
            "/register",
            Some(json!({"agent_id": "ada", "name": "Ada", "role": "worker"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["session_token"].as_str().unwrap().starts_with("hive_"));

        let (status, body) = send(
            app.clone(),
            "POST",
            "/heartbeat",
            Some(json!({"agent_id": "ada", "status": "busy"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["acknowledged"], true);
        assert_eq!(store.get_agent("ada").await.unwrap().unwrap().status, "busy");

        let (status, _) = send(app, "POST", "/heartbeat", Some(json!({"agent_id": "ghost"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatch_maps_named_priority_to_integer() {
        let store = MemoryStore::new();
        register_agent(&store, "ada", "online").await;
        let app = app_router(test_state(store.clone()));

        let (status, body) = send(
            app,
            "POST",
            "/dispatch",
            Some(json!({"task": "rebuild index", "priority": "high", "preferred_agent": "ada"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["priority"], 2);

        let task_id = Uuid::parse_str(body["task_id"].as_str().unwrap()).unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.priority, Priority(2));
        assert_eq!(task.assigned_agent, "ada");
    }

    #[tokio::test]
    async fn dispatch_falls_back_when_preferred_is_unknown() {
        let store = MemoryStore::new();
        register_agent(&store, "grace", "online").await;
        let app = app_router(test_state(store.clone()));

        let (status, body) = send(
            app.clone(),
            "POST",
            "/dispatch",
            Some(json!({
                "task": "check backups",
                "preferred_agent": "nobody",
                "fallback_agents": ["grace"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["assigned_agent"], "grace");

        let (status, _) = send(
            app,
            "POST",
            "/dispatch",
            Some(json!({"task": "orphaned", "preferred_agent": "nobody"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatch_without_preference_needs_a_live_agent() {
        let store = MemoryStore::new();
        let app = app_router(test_state(store.clone()));
        let (status, _) = send(app.clone(), "POST", "/dispatch", Some(json!({"task": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        register_agent(&store, "ada", "offline").await;
        let (status, _) = send(app, "POST", "/dispatch", Some(json!({"task": "x"}))).await;
        assert_eq!(
            status,
            StatusCode::NOT_FOUND,
            "offline agents are not dispatchable"
        );
    }

    #[tokio::test]
    async fn preflight_approval_starts_the_workflow() {
        let store = MemoryStore::new();
        let app = app_router(test_state(store.clone()));

        let (status, body) = send(
            app.clone(),
            "POST",
            "/preflight",
            Some(json!({
                "task": "quarterly report",
                "intent": "produce the Q3 report",
                "workflow_template": "two-step",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let preflight_id = body["preflight_id"].as_str().unwrap().to_string();
        let task = store
            .get_task(Uuid::parse_str(&preflight_id).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::AwaitingApproval);

        let (status, body) = send(
            app.clone(),
            "POST",
            &format!("/preflight/{preflight_id}/approve"),
            Some(json!({"action": "go"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["executing"], true);
        let workflow_id = body["workflow_id"].as_str().unwrap();

        // First step dispatched to ada.
        assert!(store.poll_pending("ada").await.unwrap().is_some());

        let (status, body) = send(app, "GET", &format!("/workflow/{workflow_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_in_memory"], true);
        assert_eq!(body["workflow"]["step_status"]["work"], "in_progress");
        assert_eq!(body["subtasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn preflight_stop_cancels_and_modify_keeps_waiting() {
        let store = MemoryStore::new();
        let app = app_router(test_state(store.clone()));

        for (action, expected_status) in [("modify", "awaiting_approval"), ("stop", "cancelled")] {
            let (_, body) = send(
                app.clone(),
                "POST",
                "/preflight",
                Some(json!({"task": "t", "intent": "i"})),
            )
            .await;
            let id = body["preflight_id"].as_str().unwrap().to_string();
            let (status, body) = send(
                app.clone(),
                "POST",
                &format!("/preflight/{id}/approve"),
                Some(json!({"action": action, "modifications": "tighter scope"})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], expected_status);
        }
    }

    #[tokio::test]
    async fn approving_a_non_waiting_task_is_rejected() {
        let store = MemoryStore::new();
        let task = store
            .insert_task(NewTask::pending("ada", "already pending"))
            .await
            .unwrap();
        let app = app_router(test_state(store));
        let (status, body) = send(
            app,
            "POST",
            &format!("/preflight/{}/approve", task.id),
            Some(json!({"action": "go"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("pending"));
    }

    #[tokio::test]
    async fn completion_with_too_few_sources_is_held() {
        let store = MemoryStore::new();
        let task = store
            .insert_task(
                NewTask::pending("hari", "research")
                    .metadata(json!({"acceptance_criteria": {"min_sources": 3}})),
            )
            .await
            .unwrap();
        let app = app_router(test_state(store.clone()));

        let (status, body) = send(
            app,
            "POST",
            "/complete",
            Some(json!({
                "task_id": task.id,
                "agent_id": "hari",
                "result": {"sources": ["a", "b"]},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completed"], false);
        assert_eq!(body["violations"][0], "insufficient_sources: need 3");

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_ne!(stored.status, TaskStatus::Completed);
        assert!(stored.metadata.get("validation_failures").is_some());
    }

    #[tokio::test]
    async fn clean_completion_marks_the_task_done() {
        let store = MemoryStore::new();
        let task = store
            .insert_task(
                NewTask::pending("hari", "research")
                    .metadata(json!({"acceptance_criteria": {"min_sources": 1}})),
            )
            .await
            .unwrap();
        let app = app_router(test_state(store.clone()));

        let (status, body) = send(
            app,
            "POST",
            "/complete",
            Some(json!({
                "task_id": task.id,
                "agent_id": "hari",
                "result": {"sources": ["a"], "summary": "found it"},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completed"], true);
        assert_eq!(body["completion_summary"], "found it");

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.participating_agents, vec!["hari"]);
    }

    #[tokio::test]
    async fn validation_at_retry_budget_escalates() {
        let store = MemoryStore::new();
        let task = store
            .insert_task(NewTask::pending("hari", "draft"))
            .await
            .unwrap();
        let app = app_router(test_state(store.clone()));

        // Built-in default chain: max_retries = 3.
        let (status, body) = send(
            app,
            "POST",
            "/validate",
            Some(json!({
                "task_id": task.id,
                "chain_name": "default",
                "output": {"draft": "v4"},
                "retry_count": 3,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["validated"], false);
        assert_eq!(body["max_retries_exceeded"], true);
        assert!(body["escalation"]["action"].is_string());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn gate_endpoint_resolves_a_waiting_gate() {
        let store = MemoryStore::new();
        let state = test_state(store.clone());
        let app = app_router(state.clone());

        let parent = store
            .insert_task(NewTask::pending("overseer", "plan"))
            .await
            .unwrap();
        let workflow_id = state
            .executor
            .start(parent.id, "two-step", None)
            .await
            .unwrap();

        // Finish the dispatch step so the gate opens.
        let snapshot = state.executor.snapshot(workflow_id).await.unwrap();
        let work_task = snapshot.step_task_ids["work"];
        store.claim_task(work_task, "ada").await.unwrap();
        store
            .complete_task(work_task, json!({}), None)
            .await
            .unwrap();
        state
            .executor
            .on_subtask_complete(work_task, json!({}))
            .await
            .unwrap();

        let (status, body) = send(
            app.clone(),
            "POST",
            &format!("/workflow/{workflow_id}/gate"),
            Some(json!({"action": "done"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gate_step"], "signoff");

        // Workflow is now complete and evicted; the gate endpoint 404s.
        let (status, _) = send(
            app,
            "POST",
            &format!("/workflow/{workflow_id}/gate"),
            Some(json!({"action": "done"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn step_fail_endpoint_reports_the_new_state() {
        let store = MemoryStore::new();
        let state = test_state(store.clone());
        let app = app_router(state.clone());

        let parent = store
            .insert_task(NewTask::pending("overseer", "plan"))
            .await
            .unwrap();
        let workflow_id = state
            .executor
            .start(parent.id, "two-step", None)
            .await
            .unwrap();

        let (status, body) = send(
            app,
            "POST",
            &format!("/workflow/{workflow_id}/step/work/fail"),
            Some(json!({"reason": "agent crashed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["reason"], "agent crashed");
    }

    #[tokio::test]
    async fn archive_endpoint_rejects_live_tasks() {
        let store = MemoryStore::new();
        let task = store
            .insert_task(NewTask::pending("ada", "in flight"))
            .await
            .unwrap();
        let app = app_router(test_state(store.clone()));

        let (status, _) = send(
            app.clone(),
            "POST",
            &format!("/task/{}/archive", task.id),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        store.complete_task(task.id, json!({}), None).await.unwrap();
        let (status, body) = send(
            app,
            "POST",
            &format!("/task/{}/archive", task.id),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["archived"], true);
        assert!(store
            .get_task(task.id)
            .await
            .unwrap()
            .unwrap()
            .archived_at
            .is_some());
    }

    #[tokio::test]
    async fn status_aggregates_fleet_and_queue() {
        let store = MemoryStore::new();
        register_agent(&store, "ada", "online").await;
        register_agent(&store, "grace", "busy").await;
        store
            .insert_task(NewTask::pending("ada", "one"))
            .await
            .unwrap();
        let app = app_router(test_state(store));

        let (status, body) = send(app, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agents"]["total"], 2);
        assert_eq!(body["agents"]["by_status"]["online"], 1);
        assert_eq!(body["tasks"]["pending"], 1);
    }

    #[tokio::test]
    async fn list_tasks_filters_by_status() {
        let store = MemoryStore::new();
        let done = store
            .insert_task(NewTask::pending("ada", "done"))
            .await
            .unwrap();
        store.complete_task(done.id, json!({}), None).await.unwrap();
        store
            .insert_task(NewTask::pending("ada", "waiting"))
            .await
            .unwrap();
        let app = app_router(test_state(store));

        let (status, body) = send(app.clone(), "GET", "/tasks?status=completed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, _) = send(app, "GET", "/tasks?status=imaginary", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
