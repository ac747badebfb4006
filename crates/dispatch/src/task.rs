use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch priority; lower discriminant pops first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

/// One unit of work: "process stream X". Queue order is priority
/// ascending, then energy descending, then creation time ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTask {
    pub stream_id: String,
    pub priority: DispatchPriority,
    pub energy: f64,
    pub message_count: usize,
    pub created_at: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub task_id: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DispatchTask {
    pub fn new(
        stream_id: impl Into<String>,
        priority: DispatchPriority,
        energy: f64,
        message_count: usize,
        created_at: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            priority,
            energy,
            message_count,
            created_at,
            retry_count: 0,
            max_retries,
            task_id: Uuid::new_v4().to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Exponential backoff, exponent capped at 3.
    pub fn retry_delay(&self, base_delay: f64) -> f64 {
        base_delay * 2_f64.powi(self.retry_count.min(3) as i32)
    }
}

// `BinaryHeap` is a max-heap: `Ordering::Greater` means "pops first".
impl Ord for DispatchTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.energy.total_cmp(&other.energy))
            .then_with(|| other.created_at.total_cmp(&self.created_at))
    }
}

impl PartialOrd for DispatchTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DispatchTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DispatchTask {}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    fn task(priority: DispatchPriority, energy: f64, created_at: f64) -> DispatchTask {
        DispatchTask::new("s", priority, energy, 1, created_at, 3)
    }

    #[test]
    fn critical_pops_before_low() {
        let mut heap = BinaryHeap::new();
        heap.push(task(DispatchPriority::Low, 0.9, 0.0));
        heap.push(task(DispatchPriority::Critical, 0.1, 5.0));
        heap.push(task(DispatchPriority::Normal, 0.5, 1.0));

        assert_eq!(heap.pop().unwrap().priority, DispatchPriority::Critical);
        assert_eq!(heap.pop().unwrap().priority, DispatchPriority::Normal);
        assert_eq!(heap.pop().unwrap().priority, DispatchPriority::Low);
    }

    #[test]
    fn equal_priority_breaks_ties_by_energy_then_age() {
        let mut heap = BinaryHeap::new();
        let low_energy_old = task(DispatchPriority::Normal, 0.2, 0.0);
        let high_energy = task(DispatchPriority::Normal, 0.9, 10.0);
        let low_energy_new = task(DispatchPriority::Normal, 0.2, 20.0);
        heap.push(low_energy_new.clone());
        heap.push(low_energy_old.clone());
        heap.push(high_energy.clone());

        assert_eq!(heap.pop().unwrap().task_id, high_energy.task_id);
        assert_eq!(heap.pop().unwrap().task_id, low_energy_old.task_id);
        assert_eq!(heap.pop().unwrap().task_id, low_energy_new.task_id);
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let mut t = task(DispatchPriority::Normal, 0.5, 0.0);
        assert_eq!(t.retry_delay(1.0), 1.0);
        t.retry_count = 1;
        assert_eq!(t.retry_delay(1.0), 2.0);
        t.retry_count = 2;
        assert_eq!(t.retry_delay(1.0), 4.0);
        t.retry_count = 10;
        assert_eq!(t.retry_delay(1.0), 8.0);
    }
}
