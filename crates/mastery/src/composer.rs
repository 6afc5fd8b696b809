use serde_json::{json, Value};
use tracing::{debug, info};

use taskloom_core::schema::advertised_fields;
use taskloom_core::{Error, Result, SemanticVersion, Task, TaskContext, TaskStatus};
use taskloom_registry::{ResolverSelector, TaskResolverRegistry};
use taskloom_resolver::resolve_checked;

use crate::plan::{BindingSource, MasteryPlan, Step};
use crate::registry::MasteryRegistry;

/// Capability name a planning resolver must carry.
pub const PLAN_CAPABILITY: &str = "plan";

/// Produces a workflow plan from a task description and the current
/// registries. Never executes, never persists, never mutates a registry.
pub struct MasteryComposer {
    /// Minimum similarity for reusing a stored plan.
    match_threshold: f32,
}

impl MasteryComposer {
    pub fn new() -> Self {
        Self {
            match_threshold: 0.80,
        }
    }

    pub fn with_match_threshold(mut self, threshold: f32) -> Self {
        self.match_threshold = threshold;
        self
    }

    /// Compose a plan for the described work. A stored plan whose
    /// description matches above the threshold is reused; otherwise a
    /// planning resolver (capability `plan`) is consulted and its capability
    /// list is turned into a schema-wired DAG.
    pub async fn compose(
        &self,
        ctx: &TaskContext,
        description: &str,
        resolvers: &TaskResolverRegistry,
        masteries: &MasteryRegistry,
    ) -> Result<MasteryPlan> {
        if let Some((entry, score)) = masteries
            .semantic_search(description, 1)
            .await?
            .into_iter()
            .next()
        {
            if score >= self.match_threshold {
                info!(
                    mastery = %entry.plan.name,
                    score,
                    "Reusing stored plan for request"
                );
                return Ok(entry.plan);
            }
            debug!(best = %entry.plan.name, score, "No stored plan above threshold");
        }

        let planner = resolvers
            .find_by_capability(PLAN_CAPABILITY)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Composer("no stored plan matched and no planning resolver is configured".into())
            })?;

        let available: Vec<String> = resolvers
            .all_entries()
            .await
            .iter()
            .flat_map(|e| e.metadata.capabilities.iter().cloned())
            .collect();

        let request = Task::new(
            "compose",
            json!({
                "description": description,
                "available_capabilities": available,
            }),
        )
        .with_description(description.to_string());

        let planned = resolve_checked(planner.resolver.as_ref(), ctx, request).await;
        if planned.status != TaskStatus::Completed {
            let reason = planned
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "planning resolver returned no result".into());
            return Err(Error::Composer(format!("planning failed: {}", reason)));
        }
        let data = planned.result.map(|r| r.data).unwrap_or(Value::Null);

        let plan = if let Some(steps) = data.get("steps").and_then(Value::as_array) {
            self.plan_from_steps(description, steps, resolvers).await?
        } else if let Some(capabilities) = data.get("capabilities").and_then(Value::as_array) {
            self.plan_from_capabilities(description, capabilities, resolvers)
                .await?
        } else {
            return Err(Error::Composer(
                "planning resolver returned neither 'steps' nor 'capabilities'".into(),
            ));
        };

        // A cyclic plan is a planning resolver bug, not a caller error.
        plan.validate()
            .map_err(|e| Error::Composer(format!("planning resolver produced an invalid plan: {}", e)))?;
        info!(steps = plan.steps.len(), "Composed new plan");
        Ok(plan)
    }

    /// Linear capability list: one step per capability, data dependencies
    /// wired from the fields each resolver's result schema advertises.
    async fn plan_from_capabilities(
        &self,
        description: &str,
        capabilities: &[Value],
        resolvers: &TaskResolverRegistry,
    ) -> Result<MasteryPlan> {
        let mut plan = MasteryPlan::new("composed", SemanticVersion::new(0, 1, 0))
            .with_description(description.to_string());
        // fields advertised so far: (step id, field name)
        let mut produced: Vec<(String, String)> = Vec::new();

        for (index, capability) in capabilities.iter().enumerate() {
            let capability = capability.as_str().ok_or_else(|| {
                Error::Composer("planning resolver returned a non-string capability".into())
            })?;
            let provider = resolvers
                .find_by_capability(capability)
                .await
                .into_iter()
                .next()
                .ok_or_else(|| {
                    Error::Composer(format!("no resolver provides capability '{}'", capability))
                })?;

            let step_id = format!("step-{}", index + 1);
            let mut step = Step::new(&step_id, ResolverSelector::capability(capability));
            for (producer, field) in &produced {
                step = step.depends(producer.clone()).bind(
                    field.clone(),
                    BindingSource::StepOutput {
                        step_id: producer.clone(),
                        field: field.clone(),
                    },
                );
            }
            for field in advertised_fields(&provider.metadata.result_schema) {
                produced.push((step_id.clone(), field));
            }
            plan = plan.with_step(step);
        }
        Ok(plan)
    }

    /// Explicit step list with dependencies, as returned by a richer
    /// planner. The DAG check happens in `compose`.
    async fn plan_from_steps(
        &self,
        description: &str,
        steps: &[Value],
        resolvers: &TaskResolverRegistry,
    ) -> Result<MasteryPlan> {
        let mut plan = MasteryPlan::new("composed", SemanticVersion::new(0, 1, 0))
            .with_description(description.to_string());
        for (index, raw) in steps.iter().enumerate() {
            let capability = raw
                .get("capability")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Composer("planned step is missing 'capability'".into()))?;
            if resolvers.find_by_capability(capability).await.is_empty() {
                return Err(Error::Composer(format!(
                    "no resolver provides capability '{}'",
                    capability
                )));
            }
            let id = raw
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("step-{}", index + 1));
            let mut step = Step::new(id, ResolverSelector::capability(capability));
            if let Some(deps) = raw.get("depends_on").and_then(Value::as_array) {
                for dep in deps.iter().filter_map(Value::as_str) {
                    step = step.depends(dep);
                }
            }
            plan = plan.with_step(step);
        }
        Ok(plan)
    }
}

impl Default for MasteryComposer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use taskloom_core::TaskResult;
    use taskloom_resolver::{Resolver, ResolverMetadata};

    struct Emitter {
        name: &'static str,
        capability: &'static str,
        field: &'static str,
    }

    #[async_trait]
    impl Resolver for Emitter {
        fn metadata(&self) -> ResolverMetadata {
            let mut props = serde_json::Map::new();
            props.insert(self.field.to_string(), json!({"type": "number"}));
            ResolverMetadata::new(self.name, SemanticVersion::new(1, 0, 0))
                .with_capability(self.capability)
                .with_result_schema(json!({
                    "type": "object",
                    "properties": Value::Object(props)
                }))
        }

        async fn resolve(&self, _ctx: &TaskContext, mut task: Task) -> Task {
            let mut data = serde_json::Map::new();
            data.insert(self.field.to_string(), json!(1));
            task.complete(TaskResult::new(Value::Object(data)));
            task
        }
    }

    struct Planner {
        response: Value,
    }

    #[async_trait]
    impl Resolver for Planner {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("planner", SemanticVersion::new(1, 0, 0))
                .with_capability(PLAN_CAPABILITY)
                .with_depth(1)
        }

        async fn resolve(&self, _ctx: &TaskContext, mut task: Task) -> Task {
            task.complete(TaskResult::new(self.response.clone()));
            task
        }
    }

    async fn registry_with(planner_response: Value) -> TaskResolverRegistry {
        let registry = TaskResolverRegistry::new();
        registry
            .register(Arc::new(Emitter {
                name: "extract",
                capability: "extract",
                field: "rows",
            }))
            .await
            .unwrap();
        registry
            .register(Arc::new(Emitter {
                name: "load",
                capability: "load",
                field: "count",
            }))
            .await
            .unwrap();
        registry
            .register(Arc::new(Planner {
                response: planner_response,
            }))
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn synthesizes_from_capability_list() {
        let resolvers = registry_with(json!({"capabilities": ["extract", "load"]})).await;
        let masteries = MasteryRegistry::new();
        let ctx = TaskContext::new();

        let plan = MasteryComposer::new()
            .compose(&ctx, "move rows around", &resolvers, &masteries)
            .await
            .unwrap();

        assert_eq!(plan.steps.len(), 2);
        // Second step consumes what the first advertises.
        let second = &plan.steps[1];
        assert!(second.depends_on.contains("step-1"));
        assert_eq!(second.input_bindings.len(), 1);
        assert_eq!(second.input_bindings[0].field, "rows");
        plan.validate().unwrap();
    }

    #[tokio::test]
    async fn reuses_stored_plan_above_threshold() {
        let resolvers = registry_with(json!({"capabilities": []})).await;
        let masteries = MasteryRegistry::new();
        let stored = MasteryPlan::new("etl", SemanticVersion::new(1, 0, 0))
            .with_description("move rows around the warehouse")
            .with_step(Step::new("only", ResolverSelector::capability("extract")));
        masteries.register(stored.clone()).await.unwrap();
        let ctx = TaskContext::new();

        let plan = MasteryComposer::new()
            .compose(&ctx, "move rows around", &resolvers, &masteries)
            .await
            .unwrap();
        assert_eq!(plan.name, "etl");
    }

    #[tokio::test]
    async fn missing_planner_is_a_composer_failure() {
        let resolvers = TaskResolverRegistry::new();
        let masteries = MasteryRegistry::new();
        let ctx = TaskContext::new();
        let err = MasteryComposer::new()
            .compose(&ctx, "anything", &resolvers, &masteries)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Composer(_)));
    }

    #[tokio::test]
    async fn cyclic_planner_output_is_rejected() {
        let resolvers = registry_with(json!({
            "steps": [
                {"id": "a", "capability": "extract", "depends_on": ["b"]},
                {"id": "b", "capability": "load", "depends_on": ["a"]},
            ]
        }))
        .await;
        let masteries = MasteryRegistry::new();
        let ctx = TaskContext::new();
        let err = MasteryComposer::new()
            .compose(&ctx, "cycle please", &resolvers, &masteries)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Composer(_)));
        assert!(err.to_string().contains("invalid plan"));
    }

    #[tokio::test]
    async fn unknown_capability_is_a_composer_failure() {
        let resolvers = registry_with(json!({"capabilities": ["teleport"]})).await;
        let masteries = MasteryRegistry::new();
        let ctx = TaskContext::new();
        let err = MasteryComposer::new()
            .compose(&ctx, "do the impossible", &resolvers, &masteries)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }
}
