//! Patrol: agent-specific periodic scanning.
//!
//! A runtime may carry a [`Patrol`] implementation (disk checks, market
//! scans, campaign health — whatever the agent watches). Findings are
//! published once each as activity records; repeated findings are
//! deduplicated by content. Patrol errors never stop the loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::Store;

/// Interval bounds: patrols run no more often than every 5 minutes and no
/// less often than every 2 hours.
pub const PATROL_INTERVAL_MIN: Duration = Duration::from_secs(5 * 60);
pub const PATROL_INTERVAL_MAX: Duration = Duration::from_secs(2 * 60 * 60);

const MAX_FINDING_HASHES: usize = 1000;
const PRUNE_COUNT: usize = 500;

/// Severity of a patrol finding, mapped to a confidence value when
/// published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn confidence(&self) -> f64 {
        match self {
            Severity::Critical => 1.0,
            Severity::Warning => 0.8,
            Severity::Info => 0.5,
        }
    }
}

/// One insight discovered during a patrol pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolFinding {
    pub subject: String,
    pub predicate: String,
    pub description: String,
    pub severity: Severity,
}

impl PatrolFinding {
    fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.subject, self.predicate, self.description)
    }
}

/// Agent-specific periodic scan.
#[async_trait]
pub trait Patrol: Send + Sync {
    /// Run one patrol pass and return any findings.
    async fn run(&self) -> Vec<PatrolFinding>;
}

/// Drives a [`Patrol`] and publishes deduplicated findings.
pub struct PatrolRunner {
    agent_id: String,
    store: Arc<dyn Store>,
    patrol: Arc<dyn Patrol>,
    seen: Mutex<SeenFindings>,
}

struct SeenFindings {
    set: HashSet<String>,
    order: Vec<String>,
}

/// Clamp a configured patrol interval into the allowed range.
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(PATROL_INTERVAL_MIN, PATROL_INTERVAL_MAX)
}

impl PatrolRunner {
    pub fn new(agent_id: impl Into<String>, store: Arc<dyn Store>, patrol: Arc<dyn Patrol>) -> Self {
        Self {
            agent_id: agent_id.into(),
            store,
            patrol,
            seen: Mutex::new(SeenFindings {
                set: HashSet::new(),
                order: Vec::new(),
            }),
        }
    }

    /// One patrol pass: scan, then publish anything not seen before.
    /// Returns the number of findings published.
    pub async fn run_once(&self) -> usize {
        let findings = self.patrol.run().await;
        if findings.is_empty() {
            return 0;
        }
        self.publish(findings).await
    }

    async fn publish(&self, findings: Vec<PatrolFinding>) -> usize {
        let mut published = 0;
        for finding in findings {
            let key = finding.dedup_key();
            if self.seen.lock().set.contains(&key) {
                continue;
            }

            let result = self
                .store
                .record_activity(
                    "patrol_finding",
                    &self.agent_id,
                    json!({
                        "subject": finding.subject,
                        "predicate": finding.predicate,
                        "description": finding.description,
                        "severity": finding.severity,
                        "confidence": finding.severity.confidence(),
                        "source": format!("patrol:{}", self.agent_id),
                    }),
                )
                .await;

            match result {
                Ok(()) => {
                    let mut seen = self.seen.lock();
                    seen.set.insert(key.clone());
                    seen.order.push(key);
                    if seen.set.len() > MAX_FINDING_HASHES {
                        let drained: Vec<String> = seen.order.drain(..PRUNE_COUNT).collect();
                        for old in drained {
                            seen.set.remove(&old);
                        }
                    }
                    published += 1;
                    tracing::info!(
                        agent = %self.agent_id,
                        subject = %finding.subject,
                        "patrol insight published"
                    );
                }
                Err(e) => {
                    tracing::error!(agent = %self.agent_id, error = %e, "failed to publish patrol finding");
                }
            }
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct FixedPatrol {
        findings: Vec<PatrolFinding>,
    }

    #[async_trait]
    impl Patrol for FixedPatrol {
        async fn run(&self) -> Vec<PatrolFinding> {
            self.findings.clone()
        }
    }

    fn finding(subject: &str) -> PatrolFinding {
        PatrolFinding {
            subject: subject.to_string(),
            predicate: "is_degraded".to_string(),
            description: "utilization above 90%".to_string(),
            severity: Severity::Warning,
        }
    }

    #[tokio::test]
    async fn repeated_findings_publish_once() {
        let store = MemoryStore::new();
        let runner = PatrolRunner::new(
            "daneel",
            Arc::new(store.clone()),
            Arc::new(FixedPatrol {
                findings: vec![finding("disk-sda")],
            }),
        );

        assert_eq!(runner.run_once().await, 1);
        assert_eq!(runner.run_once().await, 0);
        assert_eq!(store.activity_log().len(), 1);
        assert_eq!(store.activity_log()[0].event_type, "patrol_finding");
    }

    #[tokio::test]
    async fn distinct_findings_all_publish() {
        let store = MemoryStore::new();
        let runner = PatrolRunner::new(
            "daneel",
            Arc::new(store.clone()),
            Arc::new(FixedPatrol {
                findings: vec![finding("disk-sda"), finding("disk-sdb")],
            }),
        );
        assert_eq!(runner.run_once().await, 2);
    }

    #[test]
    fn interval_is_clamped_to_range() {
        assert_eq!(clamp_interval(Duration::from_secs(1)), PATROL_INTERVAL_MIN);
        assert_eq!(
            clamp_interval(Duration::from_secs(10 * 60 * 60)),
            PATROL_INTERVAL_MAX
        );
        let in_range = Duration::from_secs(30 * 60);
        assert_eq!(clamp_interval(in_range), in_range);
    }
}
