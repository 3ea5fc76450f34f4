//! Routing dispatcher.
//!
//! Polls the store for messages without a routing outcome, scores each one
//! against the agent profiles (multipliers refreshed from the outcome
//! tracker every cycle), and writes the decision back: the best agent when
//! its final score clears the confidence threshold, otherwise the fallback
//! coordinator with `fallback = true`. Every message is marked exactly
//! once; an in-memory processed-id set guards against double routing
//! within the process.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Result;
use crate::routing::outcome::OutcomeTracker;
use crate::routing::profile::AgentProfile;
use crate::routing::scorer::{route_message, RoutingMessage};
use crate::store::{MessageRecord, Store};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_SCORE_THRESHOLD: f64 = 0.15;
const MAX_PROCESSED_IDS: usize = 10_000;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Minimum final score for a direct route.
    pub score_threshold: f64,
    /// Coordinator that receives everything below the threshold.
    pub fallback_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            fallback_agent: "overseer".to_string(),
        }
    }
}

/// Insertion-ordered id set with a hard capacity; when full, the oldest
/// half is pruned.
struct ProcessedIds {
    set: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    cap: usize,
}

impl ProcessedIds {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if self.set.insert(id) {
            self.order.push_back(id);
        }
        if self.set.len() > self.cap {
            for _ in 0..self.cap / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.set.len()
    }
}

/// Poll-driven message router.
pub struct RouteDispatcher {
    store: Arc<dyn Store>,
    tracker: OutcomeTracker,
    profiles: Vec<AgentProfile>,
    config: DispatcherConfig,
    processed: Mutex<ProcessedIds>,
}

impl RouteDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        tracker: OutcomeTracker,
        profiles: Vec<AgentProfile>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            profiles,
            config,
            processed: Mutex::new(ProcessedIds::new(MAX_PROCESSED_IDS)),
        }
    }

    /// One poll cycle: fetch, score and mark a batch of unrouted messages.
    /// Returns how many were processed.
    pub async fn poll_once(&self) -> Result<usize> {
        let messages = self.store.fetch_unrouted(self.config.batch_size).await?;
        if messages.is_empty() {
            return Ok(0);
        }

        // Multipliers move between cycles; re-stamp a working copy.
        let mut profiles = self.profiles.clone();
        self.tracker.apply_to(&mut profiles);

        let mut processed = 0;
        for message in messages {
            if self.processed.lock().contains(&message.id) {
                continue;
            }
            self.process_message(&message, &profiles).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_message(
        &self,
        message: &MessageRecord,
        profiles: &[AgentProfile],
    ) -> Result<()> {
        let routing_message = RoutingMessage {
            text: message.content.clone(),
            intents: message
                .metadata
                .get("intents")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            division: message
                .metadata
                .get("division")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };

        let result = route_message(&routing_message, profiles);
        match result.best_agent {
            Some(best) if best.final_score >= self.config.score_threshold => {
                self.store
                    .mark_routed(message.id, &best.agent_id, best.final_score, false)
                    .await?;
                tracing::info!(
                    message_id = %message.id,
                    agent = %best.agent_id,
                    score = format!("{:.3}", best.final_score),
                    "routed"
                );
            }
            other => {
                let score = other.map(|b| b.final_score).unwrap_or(0.0);
                self.store
                    .mark_routed(message.id, &self.config.fallback_agent, score, true)
                    .await?;
                tracing::info!(
                    message_id = %message.id,
                    agent = %self.config.fallback_agent,
                    score = format!("{:.3}", score),
                    threshold = self.config.score_threshold,
                    "fallback route"
                );
            }
        }

        self.processed.lock().insert(message.id);
        Ok(())
    }

    /// Run the poll loop until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            threshold = self.config.score_threshold,
            fallback = %self.config.fallback_agent,
            "route dispatcher starting"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(count = n, "routed messages"),
                        Err(e) => tracing::error!(error = %e, "routing poll failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("route dispatcher stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Number of message ids currently deduplicated.
    pub fn processed_len(&self) -> usize {
        self.processed.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn profiles() -> Vec<AgentProfile> {
        vec![
            AgentProfile::named("daneel").with_keywords(&[("disk", 0.8), ("backup", 0.6)]),
            AgentProfile::named("hari").with_keywords(&[("market", 0.9)]),
        ]
    }

    fn dispatcher(store: &MemoryStore) -> RouteDispatcher {
        let tracker = OutcomeTracker::new(Arc::new(store.clone()));
        RouteDispatcher::new(
            Arc::new(store.clone()),
            tracker,
            profiles(),
            DispatcherConfig::default(),
        )
    }

    #[tokio::test]
    async fn confident_messages_route_to_the_best_agent() {
        let store = MemoryStore::new();
        let id = store
            .insert_message("@daneel the disk is almost full", json!({}))
            .await
            .unwrap();

        let d = dispatcher(&store);
        assert_eq!(d.poll_once().await.unwrap(), 1);

        let remaining = store.fetch_unrouted(10).await.unwrap();
        assert!(remaining.is_empty());
        let _ = id;
    }

    #[tokio::test]
    async fn ambiguous_messages_fall_back_to_the_coordinator() {
        let store = MemoryStore::new();
        store
            .insert_message("Hi, how's it going?", json!({}))
            .await
            .unwrap();

        let d = dispatcher(&store);
        d.poll_once().await.unwrap();

        // The message is marked, so it never comes back unrouted.
        assert!(store.fetch_unrouted(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn each_message_is_marked_exactly_once() {
        let store = MemoryStore::new();
        store
            .insert_message("check the backup disk", json!({}))
            .await
            .unwrap();

        let d = dispatcher(&store);
        assert_eq!(d.poll_once().await.unwrap(), 1);
        assert_eq!(d.poll_once().await.unwrap(), 0);
        assert_eq!(d.processed_len(), 1);
    }

    #[tokio::test]
    async fn division_hint_is_read_from_metadata() {
        let store = MemoryStore::new();
        store
            .insert_message(
                "routine check please",
                json!({"division": "operations", "intents": ["ops"]}),
            )
            .await
            .unwrap();

        let mut profs = profiles();
        profs[0] = profs[0].clone().with_division("operations").with_intents(&["ops"]);
        let tracker = OutcomeTracker::new(Arc::new(store.clone()));
        let d = RouteDispatcher::new(
            Arc::new(store.clone()),
            tracker,
            profs,
            DispatcherConfig::default(),
        );
        assert_eq!(d.poll_once().await.unwrap(), 1);
    }

    #[test]
    fn processed_ids_prune_oldest_half_at_capacity() {
        let mut ids = ProcessedIds::new(8);
        let all: Vec<Uuid> = (0..9).map(|_| Uuid::new_v4()).collect();
        for id in &all {
            ids.insert(*id);
        }
        assert_eq!(ids.len(), 5);
        assert!(!ids.contains(&all[0]), "oldest pruned");
        assert!(ids.contains(&all[8]), "newest kept");
    }
}
