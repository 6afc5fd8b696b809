pub mod metadata;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskloom_core::schema::validate_value;
use taskloom_core::{Task, TaskContext, TaskStatus};

pub use metadata::ResolverMetadata;
pub use retry::{BackoffStrategy, RetryEngine, RetryPolicy};

/// Outcome of a resolver health probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(default)]
    pub details: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            details: String::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self {
            healthy: false,
            details: details.into(),
            checked_at: Utc::now(),
        }
    }
}

/// Result of running a resolver's baseline test bundle. The evolver uses it
/// as a regression gate: a candidate must pass every test the incumbent
/// passed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BaselineReport {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
}

impl BaselineReport {
    /// Whether this report passes every test `other` passed. Extra passes
    /// are allowed.
    pub fn passes_superset_of(&self, other: &BaselineReport) -> bool {
        other.passed.iter().all(|t| self.passed.contains(t))
    }
}

/// A versioned, health-checked component that drives a task to a terminal
/// status. Implementations must not panic past the retry boundary and must
/// observe `ctx` cancellation at suspension points.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Stable for the lifetime of the registry entry.
    fn metadata(&self) -> ResolverMetadata;

    /// Consume a task and return it with a terminal status set. Internal
    /// failures surface as a `TaskError` on the returned task, never as an
    /// out-of-band panic.
    async fn resolve(&self, ctx: &TaskContext, task: Task) -> Task;

    /// Cheap, side-effect-free probe. The caller applies a timeout.
    async fn health_check(&self, _ctx: &TaskContext) -> HealthReport {
        HealthReport::healthy()
    }

    /// Fixed regression suite used by the evolver to gate replacement.
    /// `None` means the resolver carries no bundle.
    async fn run_baseline_tests(&self, _ctx: &TaskContext) -> Option<BaselineReport> {
        None
    }
}

/// Validate the task input against the resolver's input schema, then
/// resolve. A schema mismatch fails the task without invoking the resolver.
pub async fn resolve_checked(resolver: &dyn Resolver, ctx: &TaskContext, mut task: Task) -> Task {
    let meta = resolver.metadata();
    if let Err(err) = validate_value(&meta.input_schema, &task.input) {
        tracing::debug!(
            resolver = %meta.name,
            task = %task.id,
            error = %err,
            "Input rejected by schema"
        );
        task.update_status(TaskStatus::InProgress);
        task.fail(err);
        return task;
    }
    task.update_status(TaskStatus::InProgress);
    resolver.resolve(ctx, task).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskloom_core::{SemanticVersion, TaskErrorKind, TaskResult};

    struct Echo;

    #[async_trait]
    impl Resolver for Echo {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("echo", SemanticVersion::new(1, 0, 0))
                .with_description("copies input text to the result")
                .with_input_schema(json!({"type": "object", "required": ["text"]}))
        }

        async fn resolve(&self, _ctx: &TaskContext, mut task: Task) -> Task {
            let text = task.input.get("text").cloned().unwrap_or_default();
            task.complete(TaskResult::new(json!({ "text": text })));
            task
        }
    }

    #[tokio::test]
    async fn resolve_checked_runs_valid_input() {
        let ctx = TaskContext::new();
        let task = Task::new("echo", json!({"text": "hi"}));
        let task = resolve_checked(&Echo, &ctx, task).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap().data["text"], "hi");
    }

    #[tokio::test]
    async fn resolve_checked_rejects_schema_mismatch() {
        let ctx = TaskContext::new();
        let task = Task::new("echo", json!({"other": 1}));
        let task = resolve_checked(&Echo, &ctx, task).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::Validation);
    }

    #[test]
    fn baseline_superset() {
        let base = BaselineReport {
            passed: vec!["a".into(), "b".into()],
            failed: vec!["c".into()],
        };
        let better = BaselineReport {
            passed: vec!["a".into(), "b".into(), "c".into()],
            failed: vec![],
        };
        let worse = BaselineReport {
            passed: vec!["a".into()],
            failed: vec!["b".into(), "c".into()],
        };
        assert!(better.passes_superset_of(&base));
        assert!(!worse.passes_superset_of(&base));
    }
}
