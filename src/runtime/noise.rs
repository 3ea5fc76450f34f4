//! Unsolicited-message rate limiter.
//!
//! Each runtime gets a sliding one-hour budget for self-initiated messages
//! (patrol alerts, proactive insights). Direct responses to explicit
//! questions are never limited — callers simply don't consult the budget
//! for those.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_BUDGET_PER_HOUR: usize = 5;

/// Sliding-window counter for unsolicited sends.
pub struct NoiseBudget {
    budget: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl NoiseBudget {
    pub fn new(budget: usize) -> Self {
        Self::with_window(budget, WINDOW)
    }

    /// Test hook: same semantics over a shorter window.
    pub fn with_window(budget: usize, window: Duration) -> Self {
        Self {
            budget,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>) {
        // Early in process life the clock may not reach back a full window.
        let Some(cutoff) = Instant::now().checked_sub(self.window) else {
            return;
        };
        while timestamps.front().is_some_and(|t| *t <= cutoff) {
            timestamps.pop_front();
        }
    }

    /// Whether another unsolicited message may be sent right now.
    pub fn can_send(&self) -> bool {
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps);
        timestamps.len() < self.budget
    }

    /// Record a send if under budget. Returns whether the send is permitted;
    /// on `false` nothing is recorded.
    pub fn try_send(&self) -> bool {
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps);
        if timestamps.len() >= self.budget {
            return false;
        }
        timestamps.push_back(Instant::now());
        true
    }

    /// How many unsolicited sends remain in the current window.
    pub fn remaining(&self) -> usize {
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps);
        self.budget.saturating_sub(timestamps.len())
    }
}

impl Default for NoiseBudget {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET_PER_HOUR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_up_to_budget_then_refuses() {
        let budget = NoiseBudget::new(3);
        assert!(budget.try_send());
        assert!(budget.try_send());
        assert!(budget.try_send());
        assert!(!budget.try_send());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn refused_sends_are_not_recorded() {
        let budget = NoiseBudget::new(1);
        assert!(budget.try_send());
        for _ in 0..10 {
            assert!(!budget.try_send());
        }
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn window_expiry_restores_budget() {
        let budget = NoiseBudget::with_window(2, Duration::from_millis(30));
        assert!(budget.try_send());
        assert!(budget.try_send());
        assert!(!budget.can_send());

        std::thread::sleep(Duration::from_millis(40));
        assert!(budget.can_send());
        assert_eq!(budget.remaining(), 2);
    }
}
