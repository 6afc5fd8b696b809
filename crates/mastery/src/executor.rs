use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use taskloom_core::{
    Result, SemanticVersion, Task, TaskContext, TaskError, TaskErrorKind, TaskResult, TaskStatus,
};
use taskloom_registry::TaskResolverRegistry;
use taskloom_resolver::{BackoffStrategy, RetryEngine, RetryPolicy};

use crate::history::ExecutionHistory;
use crate::plan::{BindingSource, ErrorPolicy, MasteryPlan, Step};

/// Per-step state inside a running execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Skipped | StepState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Completed,
    Failed,
}

/// Record of one plan run. Appended to history on terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub plan_name: String,
    pub plan_version: SemanticVersion,
    pub task_id: String,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Where the executor reports per-step performance samples. Implemented by
/// the monitoring subsystem; a failure to record never fails the execution.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_performance(
        &self,
        component: &str,
        operation: &str,
        duration_ms: f64,
        success: bool,
    );
}

/// What one spawned step reports back to the scheduler.
struct StepOutcome {
    step_id: String,
    status: TaskStatus,
    output: Option<Value>,
    error: Option<TaskError>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

/// Drives a `MasteryPlan` to terminal state: dependency scheduling with a
/// bounded fan-out, error policies, per-step timeouts and cancellation with
/// a bounded grace period.
pub struct MasteryExecutor {
    resolvers: Arc<TaskResolverRegistry>,
    policy: RetryPolicy,
    fan_out: usize,
    grace: Duration,
    history: ExecutionHistory,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl MasteryExecutor {
    pub fn new(resolvers: Arc<TaskResolverRegistry>) -> Self {
        Self {
            resolvers,
            policy: RetryPolicy::new(1, BackoffStrategy::Constant),
            fan_out: 4,
            grace: Duration::from_secs(5),
            history: ExecutionHistory::new(256),
            sink: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_history(mut self, history: ExecutionHistory) -> Self {
        self.history = history;
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Run the plan for the given task. Returns the task in terminal state
    /// together with the execution record.
    pub async fn execute(
        &self,
        ctx: &TaskContext,
        plan: &MasteryPlan,
        mut task: Task,
    ) -> Result<(Task, Execution)> {
        plan.validate()?;
        task.update_status(TaskStatus::InProgress);
        let started_at = Utc::now();
        info!(plan = %plan.name, task = %task.id, steps = plan.steps.len(), "Executing plan");

        let exec_ctx = ctx.child();
        let semaphore = Arc::new(Semaphore::new(self.fan_out));
        let mut states: HashMap<String, StepState> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::Pending))
            .collect();
        let mut records: HashMap<String, StepRecord> = plan
            .steps
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    StepRecord {
                        step_id: s.id.clone(),
                        state: StepState::Pending,
                        output: None,
                        error: None,
                        started_at: None,
                        finished_at: None,
                    },
                )
            })
            .collect();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
        let mut failing: Option<TaskError> = None;
        let mut cancelling = false;
        let mut cancel_deadline: Option<Instant> = None;

        loop {
            if failing.is_none() && !cancelling {
                self.schedule_ready(
                    plan,
                    &task,
                    &exec_ctx,
                    &semaphore,
                    &mut states,
                    &mut records,
                    &outputs,
                    &mut join_set,
                );
            }

            if exec_ctx.is_cancelled() && !cancelling {
                cancelling = true;
                cancel_deadline = Some(Instant::now() + self.grace);
                debug!(plan = %plan.name, "Plan cancelled, draining running steps");
            }

            if join_set.is_empty() {
                break;
            }

            let joined = if let Some(deadline) = cancel_deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, join_set.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        // Grace elapsed: abandon whatever is still running.
                        warn!(plan = %plan.name, "Grace period elapsed, aborting running steps");
                        join_set.abort_all();
                        while join_set.join_next().await.is_some() {}
                        break;
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    _ = exec_ctx.cancelled() => {
                        cancelling = true;
                        cancel_deadline = Some(Instant::now() + self.grace);
                        debug!(plan = %plan.name, "Plan cancelled, draining running steps");
                        continue;
                    }
                    joined = join_set.join_next() => joined,
                }
            };

            let outcome = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(join_error)) => {
                    // Aborted or panicked steps are settled in finalize.
                    debug!(error = %join_error, "Step join error");
                    continue;
                }
                None => break,
            };

            self.apply_outcome(
                plan,
                &task,
                &exec_ctx,
                &semaphore,
                outcome,
                &mut states,
                &mut records,
                &mut outputs,
                &mut join_set,
                &mut failing,
                &mut cancelling,
                &mut cancel_deadline,
            );
        }

        // Settle anything that never reached a terminal state.
        for (id, state) in states.iter_mut() {
            let record = records.get_mut(id).expect("record exists");
            match state {
                StepState::Running => {
                    *state = StepState::Failed;
                    record.state = StepState::Failed;
                    record.error = Some(TaskError::cancelled());
                    record.finished_at = Some(Utc::now());
                }
                StepState::Pending => {
                    *state = StepState::Cancelled;
                    record.state = StepState::Cancelled;
                }
                _ => {}
            }
        }

        let plan_error = if let Some(error) = failing {
            Some(error)
        } else if cancelling {
            Some(TaskError::cancelled())
        } else {
            None
        };

        let completed = plan_error.is_none()
            && plan
                .steps
                .iter()
                .all(|s| matches!(states[&s.id], StepState::Succeeded | StepState::Skipped));

        let result = if completed {
            Some(merge_sink_outputs(plan, &outputs))
        } else {
            None
        };

        match (&plan_error, completed) {
            (None, true) => {
                task.complete(TaskResult::new(result.clone().unwrap_or(Value::Null)));
            }
            (Some(error), _) => {
                task.fail(error.clone());
            }
            (None, false) => {
                task.fail(TaskError::new(
                    TaskErrorKind::Internal,
                    "plan finished with unsettled steps",
                ));
            }
        }

        let execution = Execution {
            id: uuid::Uuid::new_v4().to_string(),
            plan_name: plan.name.clone(),
            plan_version: plan.version,
            task_id: task.id.clone(),
            state: if completed {
                ExecutionState::Completed
            } else {
                ExecutionState::Failed
            },
            error: plan_error,
            steps: plan
                .steps
                .iter()
                .map(|s| records.remove(&s.id).expect("record exists"))
                .collect(),
            result,
            started_at,
            finished_at: Some(Utc::now()),
        };

        info!(
            plan = %plan.name,
            execution = %execution.id,
            state = ?execution.state,
            "Plan finished"
        );

        self.notify_sink(&execution).await;
        self.history.append(execution.clone());
        Ok((task, execution))
    }

    /// Spawn every pending step whose dependencies are all Succeeded. A
    /// pending step with a dependency that terminated any other way can
    /// never run; it cascades to Skipped.
    #[allow(clippy::too_many_arguments)]
    fn schedule_ready(
        &self,
        plan: &MasteryPlan,
        task: &Task,
        exec_ctx: &TaskContext,
        semaphore: &Arc<Semaphore>,
        states: &mut HashMap<String, StepState>,
        records: &mut HashMap<String, StepRecord>,
        outputs: &HashMap<String, Value>,
        join_set: &mut JoinSet<StepOutcome>,
    ) {
        loop {
            let mut changed = false;
            for step in &plan.steps {
                if states[&step.id] != StepState::Pending {
                    continue;
                }
                let mut ready = true;
                let mut dead = false;
                for dep in &step.depends_on {
                    match states[dep] {
                        StepState::Succeeded => {}
                        StepState::Pending | StepState::Running => ready = false,
                        StepState::Failed | StepState::Skipped | StepState::Cancelled => {
                            dead = true;
                        }
                    }
                }
                if dead {
                    states.insert(step.id.clone(), StepState::Skipped);
                    let record = records.get_mut(&step.id).expect("record exists");
                    record.state = StepState::Skipped;
                    debug!(step = %step.id, "Skipping step with unsatisfiable dependencies");
                    changed = true;
                } else if ready {
                    states.insert(step.id.clone(), StepState::Running);
                    records.get_mut(&step.id).expect("record exists").state = StepState::Running;
                    self.spawn_step(step, task, exec_ctx, semaphore, outputs, join_set);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn spawn_step(
        &self,
        step: &Step,
        task: &Task,
        exec_ctx: &TaskContext,
        semaphore: &Arc<Semaphore>,
        outputs: &HashMap<String, Value>,
        join_set: &mut JoinSet<StepOutcome>,
    ) {
        let step = step.clone();
        let initial_input = task.input.clone();
        let task_name = task.name.clone();
        let outputs = outputs.clone();
        let semaphore = semaphore.clone();
        let resolvers = self.resolvers.clone();
        let policy = self.policy.clone();
        let ctx = exec_ctx.clone();

        join_set.spawn(async move {
            let queued_at = Utc::now();
            let permit = tokio::select! {
                biased;
                _ = ctx.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let started_at = Utc::now();
            if permit.is_none() {
                return StepOutcome {
                    step_id: step.id,
                    status: TaskStatus::Cancelled,
                    output: None,
                    error: Some(TaskError::cancelled()),
                    started_at: queued_at,
                    finished_at: started_at,
                };
            }

            let fail = |error: TaskError| StepOutcome {
                step_id: step.id.clone(),
                status: TaskStatus::Failed,
                output: None,
                error: Some(error),
                started_at,
                finished_at: Utc::now(),
            };

            let entry = match resolvers.resolve_selector(&step.selector).await {
                Ok(entry) => entry,
                Err(e) => {
                    return fail(TaskError::new(TaskErrorKind::NotFound, e.to_string()));
                }
            };

            let input = match build_step_input(&initial_input, &step, &outputs) {
                Ok(input) => input,
                Err(error) => return fail(error),
            };

            let step_ctx = match step.timeout_secs {
                Some(secs) => ctx.child_with_timeout(Duration::from_secs(secs)),
                None => ctx.child(),
            };
            let step_task = Task::new(format!("{}:{}", task_name, step.id), input);

            let resolved = match step.timeout_secs {
                Some(secs) => {
                    let budget = Duration::from_secs(secs);
                    match tokio::time::timeout(
                        budget,
                        RetryEngine::resolve_task(
                            &step_ctx,
                            &policy,
                            entry.resolver.as_ref(),
                            step_task,
                        ),
                    )
                    .await
                    {
                        Ok(resolved) => resolved,
                        Err(_) => {
                            step_ctx.cancel();
                            return fail(TaskError::timeout(format!(
                                "step '{}' exceeded {}s",
                                step.id, secs
                            )));
                        }
                    }
                }
                None => {
                    RetryEngine::resolve_task(&step_ctx, &policy, entry.resolver.as_ref(), step_task)
                        .await
                }
            };

            StepOutcome {
                step_id: step.id,
                status: resolved.status,
                output: resolved.result.map(|r| r.data),
                error: resolved.error,
                started_at,
                finished_at: Utc::now(),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_outcome(
        &self,
        plan: &MasteryPlan,
        task: &Task,
        exec_ctx: &TaskContext,
        semaphore: &Arc<Semaphore>,
        outcome: StepOutcome,
        states: &mut HashMap<String, StepState>,
        records: &mut HashMap<String, StepRecord>,
        outputs: &mut HashMap<String, Value>,
        join_set: &mut JoinSet<StepOutcome>,
        failing: &mut Option<TaskError>,
        cancelling: &mut bool,
        cancel_deadline: &mut Option<Instant>,
    ) {
        let step_id = outcome.step_id.clone();
        let step = plan.step(&step_id).expect("step exists").clone();
        let record = records.get_mut(&step_id).expect("record exists");
        record.started_at = Some(outcome.started_at);
        record.finished_at = Some(outcome.finished_at);

        match outcome.status {
            TaskStatus::Completed => {
                states.insert(step_id.clone(), StepState::Succeeded);
                record.state = StepState::Succeeded;
                record.output = outcome.output.clone();
                if let Some(output) = outcome.output {
                    outputs.insert(step_id.clone(), output);
                }
                debug!(step = %step_id, "Step succeeded");
            }
            TaskStatus::Cancelled => {
                states.insert(step_id.clone(), StepState::Cancelled);
                record.state = StepState::Cancelled;
                record.error = outcome.error;
                debug!(step = %step_id, "Step cancelled");
            }
            _ => {
                let error = outcome.error.unwrap_or_else(|| {
                    TaskError::new(TaskErrorKind::Internal, "step failed without an error")
                });
                match &step.on_error {
                    ErrorPolicy::Propagate => {
                        states.insert(step_id.clone(), StepState::Failed);
                        record.state = StepState::Failed;
                        record.error = Some(error.clone());
                        warn!(step = %step_id, kind = %error.kind, "Step failed, propagating");
                        *failing = Some(
                            error.with_details(serde_json::json!({ "step_id": step_id })),
                        );
                        // Cancel running siblings, bounded by the grace period.
                        exec_ctx.cancel();
                        *cancelling = true;
                        *cancel_deadline = Some(Instant::now() + self.grace);
                    }
                    ErrorPolicy::SkipOptional => {
                        states.insert(step_id.clone(), StepState::Skipped);
                        record.state = StepState::Skipped;
                        record.error = Some(error);
                        debug!(step = %step_id, "Optional step failed, skipped");
                    }
                    ErrorPolicy::Compensate {
                        step_id: compensation_id,
                    } => {
                        states.insert(step_id.clone(), StepState::Failed);
                        record.state = StepState::Failed;
                        record.error = Some(error.clone());
                        warn!(
                            step = %step_id,
                            compensation = %compensation_id,
                            "Step failed, triggering compensation"
                        );
                        *failing = Some(
                            error.with_details(serde_json::json!({ "step_id": step_id })),
                        );
                        // The compensation step runs regardless of its own
                        // declared dependencies.
                        if states[compensation_id] == StepState::Pending {
                            if let Some(compensation) = plan.step(compensation_id) {
                                states.insert(compensation_id.clone(), StepState::Running);
                                records
                                    .get_mut(compensation_id)
                                    .expect("record exists")
                                    .state = StepState::Running;
                                self.spawn_step(
                                    compensation,
                                    task,
                                    exec_ctx,
                                    semaphore,
                                    outputs,
                                    join_set,
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    async fn notify_sink(&self, execution: &Execution) {
        let Some(sink) = &self.sink else {
            return;
        };
        for step in &execution.steps {
            let (Some(start), Some(end)) = (step.started_at, step.finished_at) else {
                continue;
            };
            let duration_ms = (end - start).num_milliseconds().max(0) as f64;
            sink.record_performance(
                &execution.plan_name,
                &step.step_id,
                duration_ms,
                step.state == StepState::Succeeded,
            )
            .await;
        }
    }
}

/// A step's input is the initial task input (as an object) overlaid with its
/// declared bindings. A binding that references a missing field fails the
/// step with a validation error.
fn build_step_input(
    initial: &Value,
    step: &Step,
    outputs: &HashMap<String, Value>,
) -> std::result::Result<Value, TaskError> {
    let mut map = match initial {
        Value::Object(m) => m.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            let mut m = serde_json::Map::new();
            m.insert("input".to_string(), other.clone());
            m
        }
    };
    for binding in &step.input_bindings {
        let value = match &binding.source {
            BindingSource::TaskInput { field } => initial.get(field).cloned().ok_or_else(|| {
                TaskError::new(
                    TaskErrorKind::Validation,
                    format!("task input has no field '{}'", field),
                )
            })?,
            BindingSource::StepOutput { step_id, field } => outputs
                .get(step_id)
                .and_then(|o| o.get(field))
                .cloned()
                .ok_or_else(|| {
                    TaskError::new(
                        TaskErrorKind::Validation,
                        format!("step '{}' produced no field '{}'", step_id, field),
                    )
                })?,
        };
        map.insert(binding.field.clone(), value);
    }
    Ok(Value::Object(map))
}

/// Merged outputs of the plan's sink steps (steps nothing depends on).
fn merge_sink_outputs(plan: &MasteryPlan, outputs: &HashMap<String, Value>) -> Value {
    let mut sinks: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &plan.steps {
        for dep in &step.depends_on {
            sinks.retain(|id| id != dep);
        }
    }
    if sinks.len() == 1 {
        return outputs.get(sinks[0]).cloned().unwrap_or(Value::Null);
    }
    let mut merged = serde_json::Map::new();
    for sink in sinks {
        if let Some(Value::Object(m)) = outputs.get(sink) {
            for (k, v) in m {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_input_merges_initial_and_bindings() {
        let step = Step::new("s", taskloom_registry::ResolverSelector::capability("x"))
            .depends("a")
            .bind(
                "total",
                BindingSource::StepOutput {
                    step_id: "a".into(),
                    field: "value".into(),
                },
            );
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"value": 41}));
        let input = build_step_input(&json!({"base": 1}), &step, &outputs).unwrap();
        assert_eq!(input["base"], 1);
        assert_eq!(input["total"], 41);
    }

    #[test]
    fn missing_binding_source_is_validation_error() {
        let step = Step::new("s", taskloom_registry::ResolverSelector::capability("x"))
            .depends("a")
            .bind(
                "total",
                BindingSource::StepOutput {
                    step_id: "a".into(),
                    field: "missing".into(),
                },
            );
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"value": 41}));
        let err = build_step_input(&json!({}), &step, &outputs).unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Validation);
    }

    #[test]
    fn sink_merge_prefers_single_sink() {
        let plan = MasteryPlan::new("p", SemanticVersion::new(1, 0, 0))
            .with_step(Step::new("a", taskloom_registry::ResolverSelector::capability("x")))
            .with_step(
                Step::new("b", taskloom_registry::ResolverSelector::capability("y")).depends("a"),
            );
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"a": 1}));
        outputs.insert("b".to_string(), json!({"b": 2}));
        assert_eq!(merge_sink_outputs(&plan, &outputs), json!({"b": 2}));
    }
}
