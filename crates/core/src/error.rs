use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-level error for fabric infrastructure (I/O, config, registries).
/// Failures of an individual task are data, not errors — see [`TaskError`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Composer error: {0}")]
    Composer(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Evolution error: {0}")]
    Evolution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("State conflict: {0}")]
    State(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failure kinds a resolver may attach to a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    NotFound,
    Validation,
    Network,
    Authentication,
    RateLimit,
    Timeout,
    Resource,
    Configuration,
    Dependency,
    State,
    BusinessLogic,
    Internal,
    Cancelled,
}

impl TaskErrorKind {
    /// Default retryability table. A retry policy may override per call.
    pub fn retryable_by_default(&self) -> bool {
        matches!(
            self,
            TaskErrorKind::Network
                | TaskErrorKind::RateLimit
                | TaskErrorKind::Timeout
                | TaskErrorKind::Resource
                | TaskErrorKind::Dependency
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::NotFound => "not_found",
            TaskErrorKind::Validation => "validation",
            TaskErrorKind::Network => "network",
            TaskErrorKind::Authentication => "authentication",
            TaskErrorKind::RateLimit => "rate_limit",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::Resource => "resource",
            TaskErrorKind::Configuration => "configuration",
            TaskErrorKind::Dependency => "dependency",
            TaskErrorKind::State => "state",
            TaskErrorKind::BusinessLogic => "business_logic",
            TaskErrorKind::Internal => "internal",
            TaskErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure attached to a task. At most one per task; attaching it
/// forces the task into `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub retryable: bool,
    /// Number of attempts made when the error became final (filled by the
    /// retry engine; 1 for a single direct call).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<TaskError>>,
}

fn default_attempts() -> u32 {
    1
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: serde_json::Value::Null,
            retryable: kind.retryable_by_default(),
            attempts: 1,
            cause: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_cause(mut self, cause: TaskError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn cancelled() -> Self {
        Self::new(TaskErrorKind::Cancelled, "cancelled")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Timeout, message)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_defaults() {
        assert!(TaskErrorKind::Network.retryable_by_default());
        assert!(TaskErrorKind::RateLimit.retryable_by_default());
        assert!(TaskErrorKind::Timeout.retryable_by_default());
        assert!(TaskErrorKind::Resource.retryable_by_default());
        assert!(TaskErrorKind::Dependency.retryable_by_default());
        assert!(!TaskErrorKind::Validation.retryable_by_default());
        assert!(!TaskErrorKind::Internal.retryable_by_default());
        assert!(!TaskErrorKind::Cancelled.retryable_by_default());
    }

    #[test]
    fn task_error_round_trip() {
        let err = TaskError::new(TaskErrorKind::Network, "connection reset")
            .with_details(serde_json::json!({"host": "example.com"}))
            .with_cause(TaskError::new(TaskErrorKind::Timeout, "read timed out"));
        let raw = serde_json::to_string(&err).unwrap();
        let back: TaskError = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.cause.as_ref().unwrap().kind, TaskErrorKind::Timeout);
    }
}
