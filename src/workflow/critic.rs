//! Critic chain validation.
//!
//! A critic chain is an ordered set of review layers that must approve a
//! step's output before the workflow accepts it. A veto is not a failure —
//! it is a structured retry signal, bounded by the chain's retry budget;
//! when the budget runs out the task fails and an escalation record is
//! attached per the chain's `on_final_reject` policy.
//!
//! Each layer's verdict comes from a [`CriticInvoker`], an asynchronous
//! message-passing seam: the shipped implementation files a review task on
//! the critic agent's own queue and waits for an answer, approving when
//! none arrives in time.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{NewTask, Priority, Store, TaskStatus};

/// One review layer: which agent reviews, and for what.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticLayer {
    pub agent: String,
    pub scope: String,
}

/// What happens when the retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalReject {
    EscalateToHuman,
    ReturnError,
}

/// Static configuration of one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticChain {
    pub layers: Vec<CriticLayer>,
    #[serde(default)]
    pub require_unanimous: bool,
    pub max_retries: u32,
    pub on_final_reject: FinalReject,
}

/// One layer's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticVerdict {
    pub agent: String,
    pub scope: String,
    pub decision: Decision,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Veto,
}

/// Escalation attached to a task after retries are exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub action: FinalReject,
    pub message: String,
}

/// Result of running a chain over a task's output.
#[derive(Debug, Clone, Serialize)]
#[allow(clippy::large_enum_variant)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Every required layer approved; the caller may advance.
    Approved { verdicts: Vec<CriticVerdict> },
    /// Rejected with retries remaining; the caller should retry, not
    /// advance.
    Vetoed {
        verdicts: Vec<CriticVerdict>,
        veto_reasons: Vec<CriticVerdict>,
        return_to: Option<String>,
        retry_count: u32,
        max_retries: u32,
    },
    /// Retry budget exhausted; the task has been failed.
    Escalated {
        escalation: Escalation,
        retry_count: u32,
    },
}

static DEFAULT_CHAIN: Lazy<CriticChain> = Lazy::new(|| CriticChain {
    layers: vec![
        CriticLayer {
            agent: "overseer".to_string(),
            scope: "format".to_string(),
        },
        CriticLayer {
            agent: "warden".to_string(),
            scope: "safety".to_string(),
        },
    ],
    require_unanimous: false,
    max_retries: 3,
    on_final_reject: FinalReject::ReturnError,
});

/// Named chain collection with a built-in default.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<String, CriticChain>,
}

impl ChainRegistry {
    pub fn new(chains: HashMap<String, CriticChain>) -> Self {
        Self { chains }
    }

    /// Load from a JSON file with a top-level `critic_chains` object. A
    /// missing or unreadable file yields an empty registry; lookups then
    /// fall back to the default chain.
    pub fn load_or_default(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| v.get("critic_chains").cloned())
                .and_then(|v| serde_json::from_value(v).ok())
            {
                Some(chains) => Self { chains },
                None => {
                    tracing::warn!(path = %path.display(), "malformed critic chain config, using default");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Look up a chain by name, falling back to the default chain.
    pub fn get(&self, name: &str) -> &CriticChain {
        self.chains
            .get(name)
            .or_else(|| self.chains.get("default"))
            .unwrap_or(&DEFAULT_CHAIN)
    }

    pub fn insert(&mut self, name: impl Into<String>, chain: CriticChain) {
        self.chains.insert(name.into(), chain);
    }
}

/// Asynchronous review seam. Implementations deliver the layer's question
/// to the critic agent however they like and return its verdict.
#[async_trait]
pub trait CriticInvoker: Send + Sync {
    async fn review(&self, layer: &CriticLayer, task_id: Uuid, output: &Value) -> CriticVerdict;
}

/// Files a review task on the critic agent's own queue and polls for its
/// answer. When no verdict arrives within the timeout the layer approves,
/// so a slow critic degrades to a no-op rather than wedging the workflow.
pub struct QueuedCriticInvoker {
    store: Arc<dyn Store>,
    timeout: Duration,
    poll: Duration,
}

impl QueuedCriticInvoker {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            poll: Duration::from_millis(250),
        }
    }
}

#[async_trait]
impl CriticInvoker for QueuedCriticInvoker {
    async fn review(&self, layer: &CriticLayer, task_id: Uuid, output: &Value) -> CriticVerdict {
        let approve = |reason: Option<String>| CriticVerdict {
            agent: layer.agent.clone(),
            scope: layer.scope.clone(),
            decision: Decision::Approve,
            reason,
        };

        let review_task = NewTask::pending(
            layer.agent.clone(),
            format!("critic review ({}) of task {task_id}", layer.scope),
        )
        .priority(Priority::HIGH)
        .metadata(json!({
            "critic_review": {
                "task_id": task_id,
                "scope": layer.scope,
                "output": output,
            }
        }));

        let review = match self.store.insert_task(review_task).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(error = %e, agent = %layer.agent, "could not file critic review");
                return approve(Some("review could not be filed".to_string()));
            }
        };

        let deadline = tokio::time::Instant::now() + self.timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.poll).await;
            let Ok(Some(task)) = self.store.get_task(review.id).await else {
                continue;
            };
            if task.status != TaskStatus::Completed {
                continue;
            }
            let Some(result) = task.result else {
                return approve(None);
            };
            let decision = match result.get("decision").and_then(Value::as_str) {
                Some("veto") => Decision::Veto,
                _ => Decision::Approve,
            };
            return CriticVerdict {
                agent: layer.agent.clone(),
                scope: layer.scope.clone(),
                decision,
                reason: result
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
        }

        tracing::debug!(agent = %layer.agent, scope = %layer.scope, "critic review timed out, approving");
        approve(Some("review timed out".to_string()))
    }
}

/// Runs chains and records their outcomes on the task.
pub struct CriticEngine {
    store: Arc<dyn Store>,
    registry: ChainRegistry,
    invoker: Arc<dyn CriticInvoker>,
}

impl CriticEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ChainRegistry,
        invoker: Arc<dyn CriticInvoker>,
    ) -> Self {
        Self {
            store,
            registry,
            invoker,
        }
    }

    /// Validate a task's output through the named chain.
    ///
    /// With `retry_count` at or past the chain's budget, the task is
    /// failed and an escalation record attached — no further retries. On a
    /// veto, the task metadata records the reasons, the agent to return
    /// the work to, and the incremented retry counter.
    pub async fn validate(
        &self,
        task_id: Uuid,
        chain_name: &str,
        output: &Value,
        originating_agent: Option<&str>,
        retry_count: u32,
    ) -> Result<ValidationOutcome> {
        let chain = self.registry.get(chain_name).clone();

        if retry_count >= chain.max_retries {
            let escalation = Escalation {
                action: chain.on_final_reject,
                message: match chain.on_final_reject {
                    FinalReject::EscalateToHuman => format!(
                        "Task {task_id} failed critic review after {} retries",
                        chain.max_retries
                    ),
                    FinalReject::ReturnError => format!(
                        "Task {task_id} rejected after {} retries",
                        chain.max_retries
                    ),
                },
            };
            self.store.fail_task(task_id, &escalation.message).await?;
            self.store
                .merge_task_metadata(task_id, json!({ "escalation": &escalation }))
                .await?;
            return Ok(ValidationOutcome::Escalated {
                escalation,
                retry_count,
            });
        }

        let mut verdicts: Vec<CriticVerdict> = Vec::new();
        let mut any_veto = false;
        for layer in &chain.layers {
            let verdict = self.invoker.review(layer, task_id, output).await;
            let vetoed = verdict.decision == Decision::Veto;
            verdicts.push(verdict);
            if vetoed {
                any_veto = true;
                // Unanimity off: one veto decides, skip the rest.
                if !chain.require_unanimous {
                    break;
                }
            }
        }

        let all_approved = verdicts.iter().all(|v| v.decision == Decision::Approve);
        let approved = if chain.require_unanimous {
            all_approved
        } else {
            !any_veto
        };

        if !approved {
            let veto_reasons: Vec<CriticVerdict> = verdicts
                .iter()
                .filter(|v| v.decision == Decision::Veto)
                .cloned()
                .collect();
            self.store
                .merge_task_metadata(
                    task_id,
                    json!({
                        "critic_veto": {
                            "retry": retry_count + 1,
                            "reasons": &veto_reasons,
                            "return_to": originating_agent,
                        }
                    }),
                )
                .await?;
            return Ok(ValidationOutcome::Vetoed {
                verdicts: verdicts.clone(),
                veto_reasons,
                return_to: originating_agent.map(str::to_string),
                retry_count: retry_count + 1,
                max_retries: chain.max_retries,
            });
        }

        self.store
            .merge_task_metadata(
                task_id,
                json!({
                    "critic_approved": {
                        "chain": chain_name,
                        "verdicts": &verdicts,
                        "approved_at": Utc::now().to_rfc3339(),
                    },
                    // Clear any veto left by an earlier round so the
                    // completion hook sees the step as accepted.
                    "critic_veto": null,
                }),
            )
            .await?;
        Ok(ValidationOutcome::Approved { verdicts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    /// Scripted invoker: pops one pre-programmed decision per review call.
    struct ScriptedInvoker {
        script: Mutex<Vec<Decision>>,
        calls: Mutex<u32>,
    }

    impl ScriptedInvoker {
        fn new(script: Vec<Decision>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl CriticInvoker for ScriptedInvoker {
        async fn review(&self, layer: &CriticLayer, _task_id: Uuid, _output: &Value) -> CriticVerdict {
            *self.calls.lock() += 1;
            let decision = {
                let mut script = self.script.lock();
                if script.is_empty() {
                    Decision::Approve
                } else {
                    script.remove(0)
                }
            };
            CriticVerdict {
                agent: layer.agent.clone(),
                scope: layer.scope.clone(),
                decision,
                reason: matches!(decision, Decision::Veto).then(|| "not good enough".to_string()),
            }
        }
    }

    fn chain(require_unanimous: bool) -> CriticChain {
        CriticChain {
            layers: vec![
                CriticLayer {
                    agent: "overseer".to_string(),
                    scope: "format".to_string(),
                },
                CriticLayer {
                    agent: "warden".to_string(),
                    scope: "safety".to_string(),
                },
            ],
            require_unanimous,
            max_retries: 3,
            on_final_reject: FinalReject::EscalateToHuman,
        }
    }

    async fn engine_with(
        store: &MemoryStore,
        chain: CriticChain,
        invoker: Arc<dyn CriticInvoker>,
    ) -> CriticEngine {
        let mut registry = ChainRegistry::default();
        registry.insert("review", chain);
        CriticEngine::new(Arc::new(store.clone()), registry, invoker)
    }

    async fn seeded_task(store: &MemoryStore) -> Uuid {
        store
            .insert_task(NewTask::pending("hari", "draft report"))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn approval_records_metadata_and_advances() {
        let store = MemoryStore::new();
        let task_id = seeded_task(&store).await;
        let engine = engine_with(&store, chain(false), ScriptedInvoker::new(vec![])).await;

        let outcome = engine
            .validate(task_id, "review", &json!({"ok": true}), Some("hari"), 0)
            .await
            .unwrap();

        assert!(matches!(outcome, ValidationOutcome::Approved { ref verdicts } if verdicts.len() == 2));
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert!(task.metadata.get("critic_approved").is_some());
    }

    #[tokio::test]
    async fn single_veto_short_circuits_when_not_unanimous() {
        let store = MemoryStore::new();
        let task_id = seeded_task(&store).await;
        let invoker = ScriptedInvoker::new(vec![Decision::Veto]);
        let engine = engine_with(&store, chain(false), invoker.clone()).await;

        let outcome = engine
            .validate(task_id, "review", &json!({}), Some("hari"), 1)
            .await
            .unwrap();

        match outcome {
            ValidationOutcome::Vetoed {
                retry_count,
                return_to,
                veto_reasons,
                ..
            } => {
                assert_eq!(retry_count, 2);
                assert_eq!(return_to.as_deref(), Some("hari"));
                assert_eq!(veto_reasons.len(), 1);
            }
            other => panic!("expected veto, got {other:?}"),
        }
        assert_eq!(invoker.call_count(), 1, "second layer never consulted");

        let task = store.get_task(task_id).await.unwrap().unwrap();
        let veto = task.metadata.get("critic_veto").unwrap();
        assert_eq!(veto["retry"], 2);
    }

    #[tokio::test]
    async fn unanimity_consults_every_layer() {
        let store = MemoryStore::new();
        let task_id = seeded_task(&store).await;
        let invoker = ScriptedInvoker::new(vec![Decision::Veto, Decision::Approve]);
        let engine = engine_with(&store, chain(true), invoker.clone()).await;

        let outcome = engine
            .validate(task_id, "review", &json!({}), None, 0)
            .await
            .unwrap();

        assert!(matches!(outcome, ValidationOutcome::Vetoed { .. }));
        assert_eq!(invoker.call_count(), 2);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_escalates_and_fails_the_task() {
        let store = MemoryStore::new();
        let task_id = seeded_task(&store).await;
        // Even an all-approve script must not run: exhaustion comes first.
        let invoker = ScriptedInvoker::new(vec![]);
        let engine = engine_with(&store, chain(false), invoker.clone()).await;

        let outcome = engine
            .validate(task_id, "review", &json!({}), None, 3)
            .await
            .unwrap();

        match outcome {
            ValidationOutcome::Escalated { escalation, .. } => {
                assert_eq!(escalation.action, FinalReject::EscalateToHuman);
            }
            other => panic!("expected escalation, got {other:?}"),
        }
        assert_eq!(invoker.call_count(), 0);

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.metadata.get("escalation").is_some());
    }

    #[tokio::test]
    async fn unknown_chain_falls_back_to_the_default() {
        let store = MemoryStore::new();
        let task_id = seeded_task(&store).await;
        let engine = CriticEngine::new(
            Arc::new(store.clone()),
            ChainRegistry::default(),
            ScriptedInvoker::new(vec![]),
        );

        let outcome = engine
            .validate(task_id, "never-configured", &json!({}), None, 0)
            .await
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::Approved { ref verdicts } if verdicts.len() == 2));
    }

    #[tokio::test]
    async fn queued_invoker_approves_on_timeout() {
        let store = MemoryStore::new();
        let invoker = QueuedCriticInvoker {
            store: Arc::new(store.clone()),
            timeout: Duration::from_millis(40),
            poll: Duration::from_millis(10),
        };
        let layer = CriticLayer {
            agent: "warden".to_string(),
            scope: "safety".to_string(),
        };

        let verdict = invoker.review(&layer, Uuid::new_v4(), &json!({})).await;
        assert_eq!(verdict.decision, Decision::Approve);
        // The review task landed on the critic's queue either way.
        assert!(store.poll_pending("warden").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queued_invoker_honors_a_delivered_veto() {
        let store = MemoryStore::new();
        let invoker = QueuedCriticInvoker {
            store: Arc::new(store.clone()),
            timeout: Duration::from_millis(500),
            poll: Duration::from_millis(10),
        };
        let layer = CriticLayer {
            agent: "warden".to_string(),
            scope: "safety".to_string(),
        };

        let critic_store = store.clone();
        let answer = tokio::spawn(async move {
            // Play the critic agent: claim the review and veto it.
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if let Some(task) = critic_store.poll_pending("warden").await.unwrap() {
                    critic_store.claim_task(task.id, "warden").await.unwrap();
                    critic_store
                        .complete_task(
                            task.id,
                            json!({"decision": "veto", "reason": "unsafe output"}),
                            None,
                        )
                        .await
                        .unwrap();
                    break;
                }
            }
        });

        let verdict = invoker.review(&layer, Uuid::new_v4(), &json!({})).await;
        answer.await.unwrap();
        assert_eq!(verdict.decision, Decision::Veto);
        assert_eq!(verdict.reason.as_deref(), Some("unsafe output"));
    }
}
