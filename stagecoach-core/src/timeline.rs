//! Per-worker stage timelines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded stage execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub stage_id: usize,
    pub stage_name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
}

/// Stage executions recorded by one worker (or the coordinator)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// Worker index, `None` for the coordinator's own timeline
    pub worker_index: Option<usize>,
    pub events: Vec<TimelineEvent>,
}

impl Timeline {
    pub fn for_worker(worker_index: usize) -> Self {
        Self {
            worker_index: Some(worker_index),
            events: Vec::new(),
        }
    }

    pub fn for_coordinator() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: TimelineEvent) {
        self.events.push(event);
    }

    /// Take the recorded events, leaving the timeline empty
    pub fn take(&mut self) -> Timeline {
        Timeline {
            worker_index: self.worker_index,
            events: std::mem::take(&mut self.events),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_clears_events() {
        let mut timeline = Timeline::for_worker(1);
        timeline.record(TimelineEvent {
            stage_id: 0,
            stage_name: "sleep".to_string(),
            started_at: Utc::now(),
            duration_ms: 5,
            success: true,
        });

        let taken = timeline.take();
        assert_eq!(taken.worker_index, Some(1));
        assert_eq!(taken.events.len(), 1);
        assert!(timeline.is_empty());
        assert_eq!(timeline.worker_index, Some(1));
    }
}
