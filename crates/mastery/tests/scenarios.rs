//! End-to-end executor scenarios: fan-out/fan-in data flow, cancellation
//! propagation, error policies.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use taskloom_core::{
    SemanticVersion, Task, TaskContext, TaskError, TaskErrorKind, TaskResult, TaskStatus,
};
use taskloom_mastery::{
    BindingSource, ErrorPolicy, MasteryExecutor, MasteryPlan, MetricsSink, Step, StepState,
};
use taskloom_registry::{ResolverSelector, TaskResolverRegistry};
use taskloom_resolver::{Resolver, ResolverMetadata};

fn v1() -> SemanticVersion {
    SemanticVersion::new(1, 0, 0)
}

/// Emits a fixed object after an optional delay, cooperatively honoring
/// cancellation.
struct Emit {
    name: &'static str,
    capability: &'static str,
    output: Value,
    delay: Duration,
}

impl Emit {
    fn new(name: &'static str, capability: &'static str, output: Value) -> Self {
        Self {
            name,
            capability,
            output,
            delay: Duration::from_millis(50),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Resolver for Emit {
    fn metadata(&self) -> ResolverMetadata {
        ResolverMetadata::new(self.name, v1()).with_capability(self.capability)
    }

    async fn resolve(&self, ctx: &TaskContext, mut task: Task) -> Task {
        tokio::select! {
            _ = ctx.cancelled() => {
                task.cancel();
                task
            }
            _ = tokio::time::sleep(self.delay) => {
                task.complete(TaskResult::new(self.output.clone()));
                task
            }
        }
    }
}

/// Adds the bound `a` and `b` fields into `{sum}`.
struct Merge;

#[async_trait]
impl Resolver for Merge {
    fn metadata(&self) -> ResolverMetadata {
        ResolverMetadata::new("merge", v1()).with_capability("merge")
    }

    async fn resolve(&self, _ctx: &TaskContext, mut task: Task) -> Task {
        let a = task.input.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = task.input.get("b").and_then(Value::as_i64).unwrap_or(0);
        task.complete(TaskResult::new(json!({ "sum": a + b })));
        task
    }
}

struct AlwaysFails {
    capability: &'static str,
}

#[async_trait]
impl Resolver for AlwaysFails {
    fn metadata(&self) -> ResolverMetadata {
        ResolverMetadata::new("broken", v1()).with_capability(self.capability)
    }

    async fn resolve(&self, _ctx: &TaskContext, mut task: Task) -> Task {
        task.update_status(TaskStatus::InProgress);
        task.fail(TaskError::new(TaskErrorKind::Dependency, "always fails"));
        task
    }
}

#[derive(Default)]
struct RecordingSink {
    samples: Mutex<Vec<(String, String, bool)>>,
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn record_performance(
        &self,
        component: &str,
        operation: &str,
        _duration_ms: f64,
        success: bool,
    ) {
        self.samples
            .lock()
            .await
            .push((component.to_string(), operation.to_string(), success));
    }
}

fn fan_in_plan() -> MasteryPlan {
    MasteryPlan::new("fan", v1())
        .with_step(Step::new("a", ResolverSelector::capability("emit_a")))
        .with_step(Step::new("b", ResolverSelector::capability("emit_b")))
        .with_step(
            Step::new("c", ResolverSelector::capability("merge"))
                .depends("a")
                .depends("b")
                .bind(
                    "a",
                    BindingSource::StepOutput {
                        step_id: "a".into(),
                        field: "a".into(),
                    },
                )
                .bind(
                    "b",
                    BindingSource::StepOutput {
                        step_id: "b".into(),
                        field: "b".into(),
                    },
                ),
        )
}

async fn fan_in_registry() -> Arc<TaskResolverRegistry> {
    let registry = Arc::new(TaskResolverRegistry::new());
    registry
        .register(Arc::new(Emit::new("emit-a", "emit_a", json!({"a": 1}))))
        .await
        .unwrap();
    registry
        .register(Arc::new(Emit::new("emit-b", "emit_b", json!({"b": 2}))))
        .await
        .unwrap();
    registry.register(Arc::new(Merge)).await.unwrap();
    registry
}

#[tokio::test]
async fn fan_out_fan_in_merges_outputs() {
    let registry = fan_in_registry().await;
    let sink = Arc::new(RecordingSink::default());
    let executor = MasteryExecutor::new(registry)
        .with_fan_out(4)
        .with_metrics_sink(sink.clone());
    let ctx = TaskContext::new();
    let task = Task::new("fan", json!({}));

    let (task, execution) = executor
        .execute(&ctx, &fan_in_plan(), task)
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.unwrap().data["sum"], 3);

    // A and B ran concurrently: their recorded intervals overlap.
    let record = |id: &str| {
        execution
            .steps
            .iter()
            .find(|s| s.step_id == id)
            .unwrap()
            .clone()
    };
    let a = record("a");
    let b = record("b");
    assert_eq!(a.state, StepState::Succeeded);
    assert_eq!(b.state, StepState::Succeeded);
    assert!(a.started_at.unwrap() < b.finished_at.unwrap());
    assert!(b.started_at.unwrap() < a.finished_at.unwrap());

    // C observed both outputs before starting.
    let c = record("c");
    assert!(c.started_at.unwrap() >= a.finished_at.unwrap());
    assert!(c.started_at.unwrap() >= b.finished_at.unwrap());
    assert_eq!(c.output.as_ref().unwrap()["sum"], 3);

    // One performance sample per step, all successful.
    let samples = sink.samples.lock().await;
    assert_eq!(samples.len(), 3);
    assert!(samples.iter().all(|(plan, _, success)| plan == "fan" && *success));

    // History recorded the execution.
    assert_eq!(executor.history().len(), 1);
}

#[tokio::test]
async fn cancellation_propagates_within_grace() {
    let registry = Arc::new(TaskResolverRegistry::new());
    registry
        .register(Arc::new(
            Emit::new("sleeper", "sleep", json!({"ok": true})).slow(Duration::from_secs(10)),
        ))
        .await
        .unwrap();

    let executor = MasteryExecutor::new(registry).with_grace(Duration::from_secs(5));
    let plan = MasteryPlan::new("long", v1())
        .with_step(Step::new("s", ResolverSelector::capability("sleep")));
    let ctx = TaskContext::new();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let (task, execution) = executor
        .execute(&ctx, &plan, Task::new("long", json!({})))
        .await
        .unwrap();

    // Step reached a terminal state well within the grace period.
    assert!(started.elapsed() < Duration::from_secs(5));
    let step = &execution.steps[0];
    assert_eq!(step.state, StepState::Cancelled);

    // Plan failed with a cancellation error.
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().kind, TaskErrorKind::Cancelled);
    assert_eq!(execution.error.as_ref().unwrap().kind, TaskErrorKind::Cancelled);
}

#[tokio::test]
async fn propagate_failure_cancels_siblings_and_fails_plan() {
    let registry = Arc::new(TaskResolverRegistry::new());
    registry
        .register(Arc::new(AlwaysFails { capability: "boom" }))
        .await
        .unwrap();
    registry
        .register(Arc::new(
            Emit::new("slow", "slow", json!({"x": 1})).slow(Duration::from_secs(10)),
        ))
        .await
        .unwrap();

    let executor = MasteryExecutor::new(registry).with_grace(Duration::from_secs(2));
    let plan = MasteryPlan::new("mixed", v1())
        .with_step(Step::new("bad", ResolverSelector::capability("boom")))
        .with_step(Step::new("sibling", ResolverSelector::capability("slow")));
    let ctx = TaskContext::new();

    let started = std::time::Instant::now();
    let (task, execution) = executor
        .execute(&ctx, &plan, Task::new("mixed", json!({})))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(task.status, TaskStatus::Failed);

    let error = execution.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::Dependency);
    assert_eq!(error.details["step_id"], "bad");

    let sibling = execution.steps.iter().find(|s| s.step_id == "sibling").unwrap();
    assert!(matches!(
        sibling.state,
        StepState::Cancelled | StepState::Failed
    ));
}

#[tokio::test]
async fn skip_optional_keeps_plan_alive() {
    let registry = Arc::new(TaskResolverRegistry::new());
    registry
        .register(Arc::new(AlwaysFails { capability: "boom" }))
        .await
        .unwrap();
    registry
        .register(Arc::new(Emit::new("fine", "fine", json!({"ok": 1}))))
        .await
        .unwrap();

    let executor = MasteryExecutor::new(registry);
    let plan = MasteryPlan::new("optional", v1())
        .with_step(
            Step::new("flaky", ResolverSelector::capability("boom"))
                .on_error(ErrorPolicy::SkipOptional),
        )
        .with_step(Step::new("solid", ResolverSelector::capability("fine")));
    let ctx = TaskContext::new();

    let (task, execution) = executor
        .execute(&ctx, &plan, Task::new("optional", json!({})))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    let flaky = execution.steps.iter().find(|s| s.step_id == "flaky").unwrap();
    assert_eq!(flaky.state, StepState::Skipped);
    let solid = execution.steps.iter().find(|s| s.step_id == "solid").unwrap();
    assert_eq!(solid.state, StepState::Succeeded);
}

#[tokio::test]
async fn compensation_step_runs_on_failure() {
    let registry = Arc::new(TaskResolverRegistry::new());
    registry
        .register(Arc::new(AlwaysFails { capability: "boom" }))
        .await
        .unwrap();
    registry
        .register(Arc::new(Emit::new("undo", "undo", json!({"undone": true}))))
        .await
        .unwrap();

    let executor = MasteryExecutor::new(registry);
    let plan = MasteryPlan::new("compensated", v1())
        .with_step(
            Step::new("risky", ResolverSelector::capability("boom")).on_error(
                ErrorPolicy::Compensate {
                    step_id: "rollback".into(),
                },
            ),
        )
        .with_step(
            Step::new("rollback", ResolverSelector::capability("undo")).depends("risky"),
        );
    let ctx = TaskContext::new();

    let (task, execution) = executor
        .execute(&ctx, &plan, Task::new("compensated", json!({})))
        .await
        .unwrap();

    // Plan still fails, but the compensation ran.
    assert_eq!(task.status, TaskStatus::Failed);
    let risky = execution.steps.iter().find(|s| s.step_id == "risky").unwrap();
    assert_eq!(risky.state, StepState::Failed);
    let rollback = execution
        .steps
        .iter()
        .find(|s| s.step_id == "rollback")
        .unwrap();
    assert_eq!(rollback.state, StepState::Succeeded);
    assert_eq!(rollback.output.as_ref().unwrap()["undone"], true);
}

#[tokio::test]
async fn step_timeout_fails_with_timeout_kind() {
    let registry = Arc::new(TaskResolverRegistry::new());
    registry
        .register(Arc::new(
            Emit::new("sleeper", "sleep", json!({})).slow(Duration::from_secs(10)),
        ))
        .await
        .unwrap();

    let executor = MasteryExecutor::new(registry);
    let plan = MasteryPlan::new("slow", v1()).with_step(
        Step::new("s", ResolverSelector::capability("sleep")).with_timeout_secs(1),
    );
    let ctx = TaskContext::new();

    let started = std::time::Instant::now();
    let (task, execution) = executor
        .execute(&ctx, &plan, Task::new("slow", json!({})))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(task.status, TaskStatus::Failed);
    let step = &execution.steps[0];
    assert_eq!(step.state, StepState::Failed);
    assert_eq!(step.error.as_ref().unwrap().kind, TaskErrorKind::Timeout);
}
