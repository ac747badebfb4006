use serde::{Deserialize, Serialize};

/// Per-stream distribution bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDistributionState {
    pub stream_id: String,
    pub energy: f64,
    pub last_distribution_time: f64,
    pub next_distribution_time: f64,
    pub message_count: usize,
    pub consecutive_failures: u32,
    pub is_active: bool,
    pub total_distributions: u64,
    pub total_failures: u64,
    pub avg_distribution_time: f64,
}

impl StreamDistributionState {
    pub fn new(stream_id: impl Into<String>, now: f64) -> Self {
        Self {
            stream_id: stream_id.into(),
            energy: 0.5,
            last_distribution_time: now,
            next_distribution_time: now,
            message_count: 0,
            consecutive_failures: 0,
            is_active: true,
            total_distributions: 0,
            total_failures: 0,
            avg_distribution_time: 0.0,
        }
    }

    pub fn should_distribute(&self, now: f64) -> bool {
        self.is_active && now >= self.next_distribution_time && self.message_count > 0
    }

    /// Record one execution. Success clears the pending count and the
    /// failure streak.
    pub fn record_outcome(&mut self, duration: f64, success: bool) {
        if success {
            self.total_distributions += 1;
            self.consecutive_failures = 0;
            self.message_count = 0;
        } else {
            self.total_failures += 1;
            self.consecutive_failures += 1;
        }

        let attempts = (self.total_distributions + self.total_failures) as f64;
        if attempts > 0.0 {
            self.avg_distribution_time =
                (self.avg_distribution_time * (attempts - 1.0) + duration) / attempts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_requires_active_due_and_pending() {
        let mut state = StreamDistributionState::new("s1", 100.0);
        assert!(!state.should_distribute(100.0), "no pending messages yet");

        state.message_count = 2;
        assert!(state.should_distribute(100.0));

        state.next_distribution_time = 150.0;
        assert!(!state.should_distribute(100.0), "not due yet");
        assert!(state.should_distribute(150.0));

        state.is_active = false;
        assert!(!state.should_distribute(200.0));
    }

    #[test]
    fn success_resets_pending_and_failure_streak() {
        let mut state = StreamDistributionState::new("s1", 0.0);
        state.message_count = 4;
        state.record_outcome(1.0, false);
        state.record_outcome(1.0, false);
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.message_count, 4, "failures keep the backlog");

        state.record_outcome(1.0, true);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.message_count, 0);
        assert_eq!(state.total_distributions, 1);
        assert_eq!(state.total_failures, 2);
    }

    #[test]
    fn average_duration_is_a_running_mean() {
        let mut state = StreamDistributionState::new("s1", 0.0);
        state.record_outcome(2.0, true);
        state.record_outcome(4.0, true);
        assert!((state.avg_distribution_time - 3.0).abs() < 1e-9);
    }
}
