use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::TaskError;

/// Status of a task moving through the fabric.
///
/// Transitions are one-way: Pending → InProgress → {Completed, Failed,
/// Cancelled}. Terminal states admit no further transitions; no observer
/// ever sees a regression.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::InProgress | TaskStatus::Cancelled | TaskStatus::Failed
            ),
            TaskStatus::InProgress => next.is_terminal(),
            // Terminal states admit nothing
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Output of a completed task. Attached at most once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskResult {
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TaskResult {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            metadata: HashMap::new(),
        }
    }
}

/// A unit of work routed through a resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Wall-clock budget for the whole task, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Task {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            input,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            timeout_secs: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Apply a status transition if the transition table allows it.
    /// Returns false (and leaves the task untouched) otherwise.
    pub fn update_status(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                task = %self.id,
                from = %self.status,
                to = %next,
                "Rejected invalid status transition"
            );
            return false;
        }
        if self.status != next {
            self.status = next;
            self.updated_at = Utc::now();
        }
        true
    }

    /// Attach a result, forcing the task into Completed.
    pub fn complete(&mut self, result: TaskResult) {
        self.result = Some(result);
        self.update_status(TaskStatus::Completed);
    }

    /// Attach an error, forcing the task into Failed.
    pub fn fail(&mut self, error: TaskError) {
        self.error = Some(error);
        self.update_status(TaskStatus::Failed);
    }

    pub fn cancel(&mut self) {
        self.update_status(TaskStatus::Cancelled);
    }

    /// Whether the per-task wall-clock budget has elapsed.
    pub fn is_expired(&self) -> bool {
        match self.timeout_secs {
            Some(secs) => {
                let elapsed = Utc::now().signed_duration_since(self.created_at);
                elapsed.num_seconds() >= secs as i64
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TaskError, TaskErrorKind};

    #[test]
    fn status_chain_is_monotone() {
        let mut task = Task::new("t", serde_json::json!({}));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.update_status(TaskStatus::InProgress));
        assert!(task.update_status(TaskStatus::Completed));
        // Terminal: nothing further
        assert!(!task.update_status(TaskStatus::InProgress));
        assert!(!task.update_status(TaskStatus::Failed));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn pending_cannot_jump_to_completed() {
        let mut task = Task::new("t", serde_json::json!({}));
        assert!(!task.update_status(TaskStatus::Completed));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn complete_sets_result_and_status() {
        let mut task = Task::new("t", serde_json::json!({"text": "hi"}));
        task.update_status(TaskStatus::InProgress);
        task.complete(TaskResult::new(serde_json::json!({"text": "hi"})));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap().data["text"], "hi");
    }

    #[test]
    fn fail_sets_error_and_status() {
        let mut task = Task::new("t", serde_json::json!({}));
        task.update_status(TaskStatus::InProgress);
        task.fail(TaskError::new(TaskErrorKind::Network, "boom"));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::Network);
    }

    #[test]
    fn task_round_trip() {
        let mut task = Task::new("echo", serde_json::json!({"text": "hi"}))
            .with_description("echoes input")
            .with_timeout_secs(30);
        task.metadata.insert("origin".into(), "test".into());
        let raw = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.status, TaskStatus::Pending);
        assert_eq!(back.timeout_secs, Some(30));
        assert_eq!(back.metadata.get("origin").map(String::as_str), Some("test"));
    }

    #[test]
    fn expiry_respects_budget() {
        let task = Task::new("t", serde_json::json!({}));
        assert!(!task.is_expired());
        let mut short = Task::new("t", serde_json::json!({})).with_timeout_secs(0);
        short.created_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(short.is_expired());
    }
}
