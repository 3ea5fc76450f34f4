//! Outcome tracker.
//!
//! Records routing decisions in a bounded rolling window and feeds a
//! per-agent success multiplier back into the scorer: 0% success → 0.7,
//! 50% → 1.0, 100% → 1.3, linear in between, and exactly 1.0 until an
//! agent has at least five recorded decisions. Persistence is debounced so
//! a burst of decisions coalesces into one write.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routing::scorer::{MULTIPLIER_MAX, MULTIPLIER_MIN};
use crate::store::{DecisionOutcome, RoutingDecision, Store};

/// Rolling window capacity; oldest entries are evicted first.
pub const ROLLING_WINDOW_SIZE: usize = 5000;
/// Below this many decisions the multiplier stays neutral.
pub const MIN_DECISIONS_FOR_MULTIPLIER: usize = 5;

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);

/// Computed multiplier with its supporting counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMultiplier {
    pub agent_id: String,
    pub multiplier: f64,
    pub total_decisions: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub success_rate: f64,
}

struct WindowState {
    decisions: VecDeque<RoutingDecision>,
    /// Recorded but not yet persisted.
    pending_save: Vec<RoutingDecision>,
    flush_scheduled: bool,
}

/// Shared outcome tracker handle. Cloning shares the window.
#[derive(Clone)]
pub struct OutcomeTracker {
    store: Arc<dyn Store>,
    state: Arc<Mutex<WindowState>>,
    debounce: Duration,
}

impl OutcomeTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_debounce(store, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(store: Arc<dyn Store>, debounce: Duration) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(WindowState {
                decisions: VecDeque::new(),
                pending_save: Vec::new(),
                flush_scheduled: false,
            })),
            debounce,
        }
    }

    /// Append a decision to the rolling window and schedule a debounced
    /// flush to the store.
    pub fn record_decision(&self, decision: RoutingDecision) {
        let schedule = {
            let mut state = self.state.lock();
            state.decisions.push_back(decision.clone());
            while state.decisions.len() > ROLLING_WINDOW_SIZE {
                state.decisions.pop_front();
            }
            state.pending_save.push(decision);
            if state.flush_scheduled {
                false
            } else {
                state.flush_scheduled = true;
                true
            }
        };

        if schedule {
            // Outside a runtime (plain unit tests) the flush waits for an
            // explicit `flush()` call.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let tracker = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(tracker.debounce).await;
                    tracker.state.lock().flush_scheduled = false;
                    tracker.flush().await;
                });
            } else {
                self.state.lock().flush_scheduled = false;
            }
        }
    }

    /// Shorthand used by the dispatcher when marking an outcome.
    pub fn record(&self, message_id: Uuid, agent_id: &str, score: f64, success: bool) {
        self.record_decision(RoutingDecision {
            message_id,
            agent_id: agent_id.to_string(),
            score,
            outcome: if success {
                DecisionOutcome::Success
            } else {
                DecisionOutcome::Failure
            },
            response_time_ms: 0,
            recorded_at: Utc::now(),
        });
    }

    /// Multiplier for one agent over the current window.
    pub fn multiplier(&self, agent_id: &str) -> AgentMultiplier {
        let state = self.state.lock();
        let total = state
            .decisions
            .iter()
            .filter(|d| d.agent_id == agent_id)
            .count();
        let successes = state
            .decisions
            .iter()
            .filter(|d| d.agent_id == agent_id && d.outcome == DecisionOutcome::Success)
            .count();
        let success_rate = if total > 0 {
            successes as f64 / total as f64
        } else {
            0.0
        };

        let multiplier = if total >= MIN_DECISIONS_FOR_MULTIPLIER {
            (MULTIPLIER_MIN + success_rate * (MULTIPLIER_MAX - MULTIPLIER_MIN))
                .clamp(MULTIPLIER_MIN, MULTIPLIER_MAX)
        } else {
            1.0
        };

        AgentMultiplier {
            agent_id: agent_id.to_string(),
            multiplier,
            total_decisions: total,
            success_count: successes,
            failure_count: total - successes,
            success_rate,
        }
    }

    /// Multipliers for every agent present in the window.
    pub fn all_multipliers(&self) -> Vec<AgentMultiplier> {
        let agent_ids: Vec<String> = {
            let state = self.state.lock();
            let mut ids: Vec<String> = state
                .decisions
                .iter()
                .map(|d| d.agent_id.clone())
                .collect();
            ids.sort();
            ids.dedup();
            ids
        };
        agent_ids.iter().map(|id| self.multiplier(id)).collect()
    }

    /// Persist every pending decision. Failures are logged and the batch is
    /// requeued for the next flush.
    pub async fn flush(&self) {
        let pending: Vec<RoutingDecision> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending_save)
        };
        if pending.is_empty() {
            return;
        }
        if let Err(e) = self.store.save_decisions(&pending).await {
            tracing::warn!(error = %e, count = pending.len(), "decision flush failed, requeueing");
            let mut state = self.state.lock();
            let mut requeued = pending;
            requeued.extend(std::mem::take(&mut state.pending_save));
            state.pending_save = requeued;
        } else {
            tracing::debug!(count = pending.len(), "flushed routing decisions");
        }
    }

    /// Seed the window from the most recent persisted decisions, preserving
    /// their original order. Returns how many were loaded.
    pub async fn load_from_store(&self) -> usize {
        match self.store.load_recent_decisions(ROLLING_WINDOW_SIZE).await {
            Ok(decisions) => {
                let count = decisions.len();
                let mut state = self.state.lock();
                for decision in decisions {
                    state.decisions.push_back(decision);
                }
                while state.decisions.len() > ROLLING_WINDOW_SIZE {
                    state.decisions.pop_front();
                }
                count
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not seed outcome window");
                0
            }
        }
    }

    /// Stamp each profile's `outcome_multiplier` from the current window.
    pub fn apply_to(&self, profiles: &mut [crate::routing::profile::AgentProfile]) {
        for profile in profiles {
            profile.outcome_multiplier = self.multiplier(&profile.id).multiplier;
        }
    }

    /// Current window length.
    pub fn window_len(&self) -> usize {
        self.state.lock().decisions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> (OutcomeTracker, MemoryStore) {
        let store = MemoryStore::new();
        let tracker =
            OutcomeTracker::with_debounce(Arc::new(store.clone()), Duration::from_millis(10));
        (tracker, store)
    }

    fn feed(tracker: &OutcomeTracker, agent: &str, successes: usize, failures: usize) {
        for _ in 0..successes {
            tracker.record(Uuid::new_v4(), agent, 0.5, true);
        }
        for _ in 0..failures {
            tracker.record(Uuid::new_v4(), agent, 0.5, false);
        }
    }

    #[test]
    fn neutral_below_minimum_sample() {
        let (tracker, _) = tracker();
        feed(&tracker, "ada", 0, 4);
        assert_eq!(tracker.multiplier("ada").multiplier, 1.0);
        assert_eq!(tracker.multiplier("nobody").multiplier, 1.0);
    }

    #[test]
    fn multiplier_endpoints_and_midpoint() {
        let (tracker, _) = tracker();
        feed(&tracker, "perfect", 10, 0);
        feed(&tracker, "hopeless", 0, 10);
        feed(&tracker, "coinflip", 5, 5);

        let perfect = tracker.multiplier("perfect").multiplier;
        assert!(perfect >= 1.29 && perfect <= 1.3);

        let hopeless = tracker.multiplier("hopeless").multiplier;
        assert!(hopeless >= 0.7 && hopeless <= 0.71);

        let coinflip = tracker.multiplier("coinflip").multiplier;
        assert!(coinflip >= 0.97 && coinflip <= 1.03);
    }

    #[test]
    fn window_evicts_oldest_beyond_capacity() {
        let (tracker, _) = tracker();
        for _ in 0..ROLLING_WINDOW_SIZE + 50 {
            tracker.record(Uuid::new_v4(), "busy", 0.3, true);
        }
        assert_eq!(tracker.window_len(), ROLLING_WINDOW_SIZE);
    }

    #[tokio::test]
    async fn debounced_flush_coalesces_a_burst() {
        let (tracker, store) = tracker();
        feed(&tracker, "ada", 7, 0);
        assert_eq!(store.decision_count(), 0, "nothing persisted before debounce");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.decision_count(), 7);
    }

    #[tokio::test]
    async fn explicit_flush_drains_pending() {
        let (tracker, store) = tracker();
        feed(&tracker, "ada", 3, 1);
        tracker.flush().await;
        assert_eq!(store.decision_count(), 4);
        tracker.flush().await;
        assert_eq!(store.decision_count(), 4, "nothing new to flush");
    }

    #[tokio::test]
    async fn seeding_restores_the_window() {
        let (tracker, store) = tracker();
        feed(&tracker, "ada", 6, 0);
        tracker.flush().await;

        let fresh =
            OutcomeTracker::with_debounce(Arc::new(store.clone()), Duration::from_millis(10));
        let loaded = fresh.load_from_store().await;
        assert_eq!(loaded, 6);
        assert!(fresh.multiplier("ada").multiplier > 1.29);
    }

    #[test]
    fn apply_to_stamps_profiles() {
        let (tracker, _) = tracker();
        feed(&tracker, "ada", 10, 0);
        let mut profiles = vec![
            crate::routing::profile::AgentProfile::named("ada"),
            crate::routing::profile::AgentProfile::named("grace"),
        ];
        tracker.apply_to(&mut profiles);
        assert!(profiles[0].outcome_multiplier > 1.29);
        assert_eq!(profiles[1].outcome_multiplier, 1.0);
    }
}
