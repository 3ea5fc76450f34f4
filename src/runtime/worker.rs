//! Worker runtime.
//!
//! The shared loop every agent process runs:
//!
//! - **Poll**: check for pending tasks assigned to this agent (default 2s).
//! - **Claim**: atomic conditional update so one runtime owns the task;
//!   losing the race is a silent no-op.
//! - **Execute**: a pluggable [`TaskProcessor`] does the domain work; the
//!   runtime records completion or failure on the task.
//! - **Heartbeat**: report status every 15s; failures never interrupt the
//!   other loops.
//! - **Patrol**: optional periodic scanning (see [`crate::runtime::patrol`]).
//! - **Shutdown**: stop polling immediately, drain the current task for up
//!   to a bounded period, then deregister best-effort.
//!
//! Each loop is its own spawned task watching a shared shutdown channel, so
//! a hung store or HTTP call in one loop cannot starve the others.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use crate::runtime::noise::{NoiseBudget, DEFAULT_BUDGET_PER_HOUR};
use crate::runtime::patrol::{clamp_interval, Patrol, PatrolRunner};
use crate::store::{AgentRecord, Store, Task};

/// Static configuration for one worker runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub capabilities: Vec<String>,
    pub endpoint: Option<String>,
    pub location: Option<String>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// `None` disables the patrol loop.
    pub patrol_interval: Option<Duration>,
    pub noise_budget_per_hour: usize,
    /// How long shutdown waits for the in-flight task.
    pub drain_timeout: Duration,
    /// When set, registration and heartbeats go to the control plane over
    /// HTTP; otherwise they are written to the store directly.
    pub control_plane_url: Option<String>,
}

impl WorkerConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            role: "worker".to_string(),
            agent_id,
            capabilities: Vec::new(),
            endpoint: None,
            location: None,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
            patrol_interval: None,
            noise_budget_per_hour: DEFAULT_BUDGET_PER_HOUR,
            drain_timeout: Duration::from_secs(30),
            control_plane_url: None,
        }
    }
}

/// Domain-specific task execution. The runtime owns the lifecycle; the
/// processor owns the work.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Execute one claimed task. `Err` marks the task failed with the
    /// message; the runtime never retries on its own.
    async fn process(&self, task: &Task) -> std::result::Result<Value, String>;
}

/// Processor that acknowledges the task without doing domain work.
pub struct AckProcessor;

#[async_trait]
impl TaskProcessor for AckProcessor {
    async fn process(&self, task: &Task) -> std::result::Result<Value, String> {
        tracing::info!(task = %task.id, name = %task.name, "processing task");
        Ok(json!({ "status": "completed", "task_id": task.id }))
    }
}

/// Per-agent runtime instance.
pub struct WorkerRuntime {
    config: WorkerConfig,
    store: Arc<dyn Store>,
    processor: Arc<dyn TaskProcessor>,
    patrol: Option<Arc<dyn Patrol>>,
    noise: NoiseBudget,
    is_processing: AtomicBool,
    current_task: Mutex<Option<(Uuid, String)>>,
    session_token: Mutex<Option<String>>,
    http: Option<reqwest::Client>,
    started: Instant,
}

impl WorkerRuntime {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn Store>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Arc<Self> {
        let http = config.control_plane_url.as_ref().map(|_| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default()
        });
        Arc::new(Self {
            noise: NoiseBudget::new(config.noise_budget_per_hour),
            config,
            store,
            processor,
            patrol: None,
            is_processing: AtomicBool::new(false),
            current_task: Mutex::new(None),
            session_token: Mutex::new(None),
            http,
            started: Instant::now(),
        })
    }

    /// Attach a patrol implementation. Call before [`WorkerRuntime::run`].
    pub fn with_patrol(self: Arc<Self>, patrol: Arc<dyn Patrol>) -> Arc<Self> {
        let mut this = Arc::try_unwrap(self).unwrap_or_else(|arc| {
            // Another handle exists; rebuild with the same parts.
            WorkerRuntime {
                config: arc.config.clone(),
                store: arc.store.clone(),
                processor: arc.processor.clone(),
                patrol: arc.patrol.clone(),
                noise: NoiseBudget::new(arc.config.noise_budget_per_hour),
                is_processing: AtomicBool::new(false),
                current_task: Mutex::new(None),
                session_token: Mutex::new(None),
                http: arc.http.clone(),
                started: arc.started,
            }
        });
        this.patrol = Some(patrol);
        Arc::new(this)
    }

    // ---- Lifecycle -------------------------------------------------------

    /// Run until the shutdown channel flips to `true`.
    ///
    /// Registers, spawns the heartbeat and patrol loops, polls for tasks,
    /// and on shutdown drains the in-flight task before deregistering.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.register().await;

        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop(shutdown.clone()));
        let patrol = self
            .patrol
            .clone()
            .zip(self.config.patrol_interval)
            .map(|(patrol, interval)| {
                tokio::spawn(Arc::clone(&self).patrol_loop(patrol, interval, shutdown.clone()))
            });

        tracing::info!(
            agent = %self.config.agent_id,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            "agent runtime running"
        );

        Arc::clone(&self).poll_loop(shutdown).await;

        // Shutdown: polls have stopped; drain whatever is still running.
        if self.is_processing.load(Ordering::SeqCst) {
            if let Some((id, _)) = self.current_task.lock().clone() {
                tracing::info!(agent = %self.config.agent_id, task = %id, "draining current task");
            }
            let deadline = Instant::now() + self.config.drain_timeout;
            while self.is_processing.load(Ordering::SeqCst) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if self.is_processing.load(Ordering::SeqCst) {
                tracing::warn!(
                    agent = %self.config.agent_id,
                    "drain timeout: task abandoned in_progress for external recovery"
                );
            }
        }

        self.send_heartbeat("offline").await;
        heartbeat.abort();
        if let Some(patrol) = patrol {
            patrol.abort();
        }
        tracing::info!(agent = %self.config.agent_id, "shutdown complete");
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    Self::poll_tick(&self).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One poll: fetch at most one candidate and run it on its own task so
    /// a long execution never blocks the loop.
    async fn poll_tick(this: &Arc<Self>) {
        if this.is_processing.load(Ordering::SeqCst) {
            return;
        }
        let task = match this.store.poll_pending(&this.config.agent_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(agent = %this.config.agent_id, error = %e, "poll error");
                return;
            }
        };
        if this
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let runtime = Arc::clone(this);
        tokio::spawn(async move {
            runtime.claim_and_process(task).await;
            runtime.is_processing.store(false, Ordering::SeqCst);
            *runtime.current_task.lock() = None;
        });
    }

    // ---- Claim + execute -------------------------------------------------

    /// Atomically claim `task` and, on success, execute it. A lost race
    /// leaves the task untouched and returns quietly.
    pub async fn claim_and_process(&self, task: Task) {
        match self.store.claim_task(task.id, &self.config.agent_id).await {
            Ok(true) => {}
            Ok(false) => return, // another runtime won
            Err(e) => {
                tracing::error!(task = %task.id, error = %e, "claim failed");
                return;
            }
        }

        tracing::info!(agent = %self.config.agent_id, task = %task.id, name = %task.name, "claimed task");
        *self.current_task.lock() = Some((task.id, task.name.clone()));

        match self.processor.process(&task).await {
            Ok(result) => {
                if let Err(e) = self.store.complete_task(task.id, result, None).await {
                    tracing::error!(task = %task.id, error = %e, "failed to record completion");
                } else {
                    tracing::info!(agent = %self.config.agent_id, task = %task.id, "completed task");
                }
            }
            Err(message) => {
                if let Err(e) = self.store.fail_task(task.id, &message).await {
                    tracing::error!(task = %task.id, error = %e, "failed to record failure");
                } else {
                    tracing::error!(agent = %self.config.agent_id, task = %task.id, error = %message, "task failed");
                }
            }
        }

        *self.current_task.lock() = None;
    }

    // ---- Registration + heartbeat ---------------------------------------

    async fn register(&self) {
        if let (Some(url), Some(client)) = (&self.config.control_plane_url, &self.http) {
            let body = json!({
                "agent_id": self.config.agent_id,
                "name": self.config.name,
                "role": self.config.role,
                "capabilities": self.config.capabilities,
                "endpoint": self.config.endpoint,
                "location": self.config.location,
                "status": "online",
            });
            match client.post(format!("{url}/register")).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    let token = response
                        .json::<Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("session_token").and_then(Value::as_str).map(str::to_string));
                    *self.session_token.lock() = token;
                    tracing::info!(agent = %self.config.agent_id, "registered with control plane");
                }
                Ok(response) => {
                    tracing::error!(agent = %self.config.agent_id, status = %response.status(), "registration rejected");
                }
                Err(e) => {
                    tracing::error!(agent = %self.config.agent_id, error = %e, "registration error");
                }
            }
            return;
        }

        let record = AgentRecord {
            id: self.config.agent_id.clone(),
            name: self.config.name.clone(),
            role: self.config.role.clone(),
            capabilities: self.config.capabilities.clone(),
            endpoint: self.config.endpoint.clone(),
            location: self.config.location.clone(),
            status: "online".to_string(),
            last_heartbeat: chrono::Utc::now(),
            metadata: json!({}),
        };
        if let Err(e) = self.store.upsert_agent(record).await {
            tracing::error!(agent = %self.config.agent_id, error = %e, "registration error");
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await; // the immediate first tick; registration just ran
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = if self.is_processing.load(Ordering::SeqCst) { "busy" } else { "online" };
                    self.send_heartbeat(status).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Send one heartbeat. Always best-effort: failures are logged and
    /// never interrupt the loops.
    async fn send_heartbeat(&self, status: &str) {
        let current = self.current_task.lock().clone();
        let payload = json!({
            "session_token": *self.session_token.lock(),
            "current_task": current.map(|(id, name)| json!({"id": id, "name": name})),
            "metrics": { "uptime_seconds": self.started.elapsed().as_secs() },
        });

        if let (Some(url), Some(client)) = (&self.config.control_plane_url, &self.http) {
            let mut body = payload;
            body["agent_id"] = json!(self.config.agent_id);
            body["status"] = json!(status);
            if let Err(e) = client.post(format!("{url}/heartbeat")).json(&body).send().await {
                tracing::debug!(agent = %self.config.agent_id, error = %e, "heartbeat delivery failed");
            }
            return;
        }

        match self
            .store
            .record_heartbeat(&self.config.agent_id, Some(status), payload)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(agent = %self.config.agent_id, "heartbeat before registration")
            }
            Err(e) => tracing::debug!(agent = %self.config.agent_id, error = %e, "heartbeat failed"),
        }
    }

    async fn patrol_loop(
        self: Arc<Self>,
        patrol: Arc<dyn Patrol>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = clamp_interval(interval);
        tracing::info!(
            agent = %self.config.agent_id,
            interval_s = interval.as_secs(),
            "patrol enabled"
        );
        let runner = PatrolRunner::new(self.config.agent_id.clone(), self.store.clone(), patrol);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    runner.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    // ---- Noise budget ----------------------------------------------------

    /// Gate for self-initiated messages. Records the send and returns true
    /// when within budget; callers do the actual delivery. Never applies to
    /// direct responses.
    pub fn try_send_unsolicited(&self) -> bool {
        if self.noise.try_send() {
            tracing::debug!(
                agent = %self.config.agent_id,
                remaining = self.noise.remaining(),
                "unsolicited message permitted"
            );
            true
        } else {
            tracing::info!(
                agent = %self.config.agent_id,
                "noise budget exhausted, dropping unsolicited message"
            );
            false
        }
    }

    /// Remaining unsolicited sends this hour.
    pub fn remaining_noise_budget(&self) -> usize {
        self.noise.remaining()
    }
}
