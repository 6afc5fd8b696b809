use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use taskloom_core::{Error, Result, SemanticVersion};
use taskloom_registry::ResolverSelector;

/// What a step does when its resolver fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum ErrorPolicy {
    /// Fail the plan and cancel running siblings.
    #[default]
    Propagate,
    /// Mark the step Skipped and keep going.
    SkipOptional,
    /// Mark the step Failed and trigger the named compensation step.
    Compensate { step_id: String },
}

/// Where a bound input field comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "from")]
pub enum BindingSource {
    /// A field of the initial task input.
    TaskInput { field: String },
    /// A field of a completed predecessor's output.
    StepOutput { step_id: String, field: String },
}

/// Maps one field of a step's input to its source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputBinding {
    pub field: String,
    pub source: BindingSource,
}

/// One node of a workflow plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub selector: ResolverSelector,
    #[serde(default)]
    pub input_bindings: Vec<InputBinding>,
    /// Empty set means the step may start immediately.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Step {
    pub fn new(id: impl Into<String>, selector: ResolverSelector) -> Self {
        Self {
            id: id.into(),
            selector,
            input_bindings: Vec::new(),
            depends_on: BTreeSet::new(),
            on_error: ErrorPolicy::Propagate,
            timeout_secs: None,
        }
    }

    pub fn depends(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.insert(step_id.into());
        self
    }

    pub fn bind(mut self, field: impl Into<String>, source: BindingSource) -> Self {
        self.input_bindings.push(InputBinding {
            field: field.into(),
            source,
        });
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// A directed workflow over resolver invocations. The dependency graph must
/// be a DAG; step inputs may only reference predecessors or the initial
/// input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasteryPlan {
    pub name: String,
    pub version: SemanticVersion,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
}

impl MasteryPlan {
    pub fn new(name: impl Into<String>, version: SemanticVersion) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Structural validation: unique step ids, dependencies and compensation
    /// targets exist, bindings only reference declared dependencies, and the
    /// dependency graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::Validation(format!("plan '{}' has no steps", self.name)));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(Error::Validation(format!(
                    "plan '{}' has duplicate step id '{}'",
                    self.name, step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
                if dep == &step.id {
                    return Err(Error::Validation(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
            }
            if let ErrorPolicy::Compensate { step_id } = &step.on_error {
                if !ids.contains(step_id.as_str()) {
                    return Err(Error::Validation(format!(
                        "step '{}' compensates with unknown step '{}'",
                        step.id, step_id
                    )));
                }
            }
            for binding in &step.input_bindings {
                if let BindingSource::StepOutput { step_id, .. } = &binding.source {
                    if !step.depends_on.contains(step_id) {
                        return Err(Error::Validation(format!(
                            "step '{}' binds output of '{}' without depending on it",
                            step.id, step_id
                        )));
                    }
                }
            }
        }

        self.topo_order().map(|_| ())
    }

    /// Kahn's algorithm. Returns a valid execution order or an error naming
    /// the cycle members.
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            in_degree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.depends_on {
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(id) = ready.pop() {
            order.push(id.to_string());
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let degree = in_degree.get_mut(child).expect("child tracked");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(child);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(Error::Validation(format!(
                "plan '{}' has a dependency cycle involving: {}",
                self.name,
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1() -> SemanticVersion {
        SemanticVersion::new(1, 0, 0)
    }

    fn fan_in_plan() -> MasteryPlan {
        MasteryPlan::new("merge", v1())
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

    #[test]
    fn valid_fan_in_passes() {
        let plan = fan_in_plan();
        plan.validate().unwrap();
        let order = plan.topo_order().unwrap();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn cycle_is_rejected() {
        let plan = MasteryPlan::new("loop", v1())
            .with_step(Step::new("a", ResolverSelector::capability("x")).depends("b"))
            .with_step(Step::new("b", ResolverSelector::capability("y")).depends("a"));
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let plan = MasteryPlan::new("selfish", v1())
            .with_step(Step::new("a", ResolverSelector::capability("x")).depends("a"));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let plan = MasteryPlan::new("dangling", v1())
            .with_step(Step::new("a", ResolverSelector::capability("x")).depends("ghost"));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn binding_without_dependency_is_rejected() {
        let plan = MasteryPlan::new("sneaky", v1())
            .with_step(Step::new("a", ResolverSelector::capability("x")))
            .with_step(Step::new("b", ResolverSelector::capability("y")).bind(
                "v",
                BindingSource::StepOutput {
                    step_id: "a".into(),
                    field: "v".into(),
                },
            ));
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("without depending"));
    }

    #[test]
    fn unknown_compensation_target_is_rejected() {
        let plan = MasteryPlan::new("comp", v1()).with_step(
            Step::new("a", ResolverSelector::capability("x")).on_error(ErrorPolicy::Compensate {
                step_id: "missing".into(),
            }),
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn empty_plan_is_rejected() {
        let plan = MasteryPlan::new("empty", v1());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_round_trip() {
        let plan = fan_in_plan();
        let raw = serde_json::to_string_pretty(&plan).unwrap();
        let back: MasteryPlan = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, plan);
    }
}
