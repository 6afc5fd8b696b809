use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use taskloom_core::SemanticVersion;

/// Capability description every resolver must satisfy. Identity in a
/// registry is `(name, version)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolverMetadata {
    pub name: String,
    pub version: SemanticVersion,
    #[serde(default)]
    pub description: String,
    /// A resolver may only invoke resolvers of strictly lower depth.
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub result_schema: serde_json::Value,
    #[serde(default)]
    pub error_schema: serde_json::Value,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Failures in the rolling window that make the resolver eligible for
    /// evolution.
    #[serde(default = "default_evolution_threshold")]
    pub evolution_threshold_failures: u32,
    #[serde(default = "default_min_evolution_interval")]
    pub min_evolution_interval_secs: u64,
}

fn default_evolution_threshold() -> u32 {
    5
}

fn default_min_evolution_interval() -> u64 {
    86_400
}

impl ResolverMetadata {
    pub fn new(name: impl Into<String>, version: SemanticVersion) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            depth: 0,
            input_schema: serde_json::Value::Null,
            result_schema: serde_json::Value::Null,
            error_schema: serde_json::Value::Null,
            tags: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            evolution_threshold_failures: default_evolution_threshold(),
            min_evolution_interval_secs: default_min_evolution_interval(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_result_schema(mut self, schema: serde_json::Value) -> Self {
        self.result_schema = schema;
        self
    }

    pub fn with_error_schema(mut self, schema: serde_json::Value) -> Self {
        self.error_schema = schema;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_evolution_threshold(mut self, failures: u32) -> Self {
        self.evolution_threshold_failures = failures;
        self
    }

    pub fn with_min_evolution_interval_secs(mut self, secs: u64) -> Self {
        self.min_evolution_interval_secs = secs;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Depth rule check for one resolver invoking another.
    pub fn may_invoke(&self, callee: &ResolverMetadata) -> bool {
        callee.depth < self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_round_trip() {
        let meta = ResolverMetadata::new("summarize", SemanticVersion::new(2, 1, 0))
            .with_description("summarizes documents")
            .with_depth(1)
            .with_tag("llm")
            .with_capability("summarize")
            .with_evolution_threshold(3)
            .with_min_evolution_interval_secs(0);
        let raw = serde_json::to_string(&meta).unwrap();
        let back: ResolverMetadata = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, meta);
        assert!(back.has_capability("summarize"));
        assert!(back.has_tag("llm"));
    }

    #[test]
    fn depth_gate() {
        let orchestrator = ResolverMetadata::new("plan", SemanticVersion::new(1, 0, 0)).with_depth(2);
        let leaf = ResolverMetadata::new("echo", SemanticVersion::new(1, 0, 0)).with_depth(0);
        assert!(orchestrator.may_invoke(&leaf));
        assert!(!leaf.may_invoke(&orchestrator));
        assert!(!leaf.may_invoke(&leaf));
    }
}
