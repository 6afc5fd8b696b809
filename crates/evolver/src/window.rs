use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use taskloom_core::{SemanticVersion, TaskErrorKind};

/// One failed task observed for a resolver version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub resolver_name: String,
    pub version: SemanticVersion,
    pub task_id: String,
    pub error_kind: TaskErrorKind,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        resolver_name: impl Into<String>,
        version: SemanticVersion,
        task_id: impl Into<String>,
        error_kind: TaskErrorKind,
    ) -> Self {
        Self {
            resolver_name: resolver_name.into(),
            version,
            task_id: task_id.into(),
            error_kind,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded, time-ordered ring of failure records for one resolver name.
/// Older entries fall off the front once the capacity is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureWindow {
    records: VecDeque<FailureRecord>,
    capacity: usize,
}

impl FailureWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: FailureRecord) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn records(&self) -> impl Iterator<Item = &FailureRecord> {
        self.records.iter()
    }

    /// Failures recorded against a specific version.
    pub fn count_for(&self, version: &SemanticVersion) -> usize {
        self.records.iter().filter(|r| &r.version == version).count()
    }

    pub fn snapshot(&self) -> Vec<FailureRecord> {
        self.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1() -> SemanticVersion {
        SemanticVersion::new(1, 0, 0)
    }

    #[test]
    fn window_is_bounded() {
        let mut window = FailureWindow::new(3);
        for i in 0..5 {
            window.push(FailureRecord::new(
                "r",
                v1(),
                format!("t{}", i),
                TaskErrorKind::Network,
            ));
        }
        assert_eq!(window.len(), 3);
        // Oldest records were discarded.
        let ids: Vec<&str> = window.records().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn counts_per_version() {
        let mut window = FailureWindow::new(16);
        window.push(FailureRecord::new("r", v1(), "a", TaskErrorKind::Network));
        window.push(FailureRecord::new(
            "r",
            SemanticVersion::new(2, 0, 0),
            "b",
            TaskErrorKind::Timeout,
        ));
        window.push(FailureRecord::new("r", v1(), "c", TaskErrorKind::Network));
        assert_eq!(window.count_for(&v1()), 2);
        assert_eq!(window.count_for(&SemanticVersion::new(2, 0, 0)), 1);
    }

    #[test]
    fn window_round_trip() {
        let mut window = FailureWindow::new(4);
        window.push(FailureRecord::new("r", v1(), "a", TaskErrorKind::Network));
        let raw = serde_json::to_string(&window).unwrap();
        let back: FailureWindow = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.snapshot(), window.snapshot());
    }
}
