//! Glue between the fabric crates and the monitoring subsystem: performance
//! samples from the executor, alerts from the evolver, component health from
//! the registry.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use taskloom_core::{SemanticVersion, TaskContext};
use taskloom_evolver::EvolverSink;
use taskloom_mastery::MetricsSink;
use taskloom_monitoring::{
    AlertManager, ComponentStatus, HealthSource, MetricKind, MetricSample, MetricsStore, Severity,
};
use taskloom_registry::TaskResolverRegistry;

/// Routes executor and evolver events into the metrics store and alert
/// manager.
pub struct MonitorBridge {
    store: Arc<MetricsStore>,
    alerts: Arc<AlertManager>,
}

impl MonitorBridge {
    pub fn new(store: Arc<MetricsStore>, alerts: Arc<AlertManager>) -> Self {
        Self { store, alerts }
    }
}

#[async_trait]
impl MetricsSink for MonitorBridge {
    async fn record_performance(
        &self,
        component: &str,
        operation: &str,
        duration_ms: f64,
        success: bool,
    ) {
        self.store
            .append(
                MetricSample::new(MetricKind::Performance, component, operation, duration_ms)
                    .with_tag("success", if success { "true" } else { "false" }),
            )
            .await;
    }
}

#[async_trait]
impl EvolverSink for MonitorBridge {
    async fn evolution_succeeded(
        &self,
        resolver: &str,
        old_version: &SemanticVersion,
        new_version: &SemanticVersion,
    ) {
        self.store
            .append(
                MetricSample::new(MetricKind::System, "evolver", "evolution_succeeded", 1.0)
                    .with_tag("resolver", resolver)
                    .with_tag("from", old_version.to_string())
                    .with_tag("to", new_version.to_string()),
            )
            .await;
    }

    async fn evolution_rejected(&self, resolver: &str, version: &SemanticVersion, reason: &str) {
        self.store
            .append(
                MetricSample::new(MetricKind::System, "evolver", "evolution_rejected", 1.0)
                    .with_tag("resolver", resolver)
                    .with_tag("version", version.to_string())
                    .with_tag("reason", reason),
            )
            .await;
    }

    async fn human_intervention_requested(
        &self,
        resolver: &str,
        version: &SemanticVersion,
        message: &str,
    ) {
        let rule_id = format!("evolver:{}", resolver);
        if let Err(e) = self.alerts.open_alert(
            &rule_id,
            Severity::Critical,
            message,
            serde_json::json!({
                "kind": "human_intervention_requested",
                "resolver": resolver,
                "version": version.to_string(),
            }),
        ) {
            warn!(resolver, error = %e, "Could not open intervention alert");
        }
    }
}

/// Exposes the resolver registry's health roll-up as a monitoring source.
/// Component ids are `resolver:<name>@<version>`.
pub struct RegistryHealthSource {
    registry: Arc<TaskResolverRegistry>,
}

impl RegistryHealthSource {
    pub fn new(registry: Arc<TaskResolverRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HealthSource for RegistryHealthSource {
    async fn component_health(
        &self,
        ctx: &TaskContext,
        per_component_timeout: Duration,
    ) -> Vec<ComponentStatus> {
        let rollup = self.registry.health_rollup(ctx, per_component_timeout).await;
        rollup
            .reports
            .into_iter()
            .map(|entry| ComponentStatus {
                component: format!("resolver:{}@{}", entry.name, entry.version),
                healthy: entry.report.healthy,
                details: entry.report.details,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use taskloom_core::{Task, TaskResult, TaskStatus};
    use taskloom_mastery::MetricsSink;
    use taskloom_monitoring::{MetricFilter, TimeWindow};
    use taskloom_resolver::{
        BackoffStrategy, Resolver, ResolverMetadata, RetryEngine, RetryPolicy,
    };

    struct EchoResolver;

    #[async_trait]
    impl Resolver for EchoResolver {
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
    async fn single_resolver_task_records_performance_sample() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db")).unwrap();
        let alerts = Arc::new(AlertManager::new(store.clone()));
        let bridge = MonitorBridge::new(store.clone(), alerts);

        let registry = TaskResolverRegistry::new();
        registry.register(Arc::new(EchoResolver)).await.unwrap();

        let ctx = TaskContext::new();
        let entry = registry.get("echo", None).await.unwrap();
        let policy = RetryPolicy::new(3, BackoffStrategy::Constant);
        let task = Task::new("echo", json!({"text": "hi"}));
        let started = Instant::now();
        let task = RetryEngine::resolve_task(&ctx, &policy, entry.resolver.as_ref(), task).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_ref().unwrap().data["text"], "hi");

        bridge
            .record_performance("echo", "resolve", elapsed_ms, true)
            .await;
        store.flush().await;

        let samples = store
            .query(
                MetricKind::Performance,
                &MetricFilter::source("echo").with_tag("success", "true"),
                &TimeWindow::default(),
                None,
            )
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "resolve");
    }

    #[tokio::test]
    async fn intervention_request_opens_critical_alert() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db")).unwrap();
        let alerts = Arc::new(AlertManager::new(store.clone()));
        let bridge = MonitorBridge::new(store, alerts.clone());

        bridge
            .human_intervention_requested(
                "lookup",
                &SemanticVersion::new(1, 0, 0),
                "evolution budget exhausted",
            )
            .await;

        let active = alerts.active_alerts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::Critical);
        assert_eq!(active[0].details["kind"], "human_intervention_requested");

        // A second request while one is active stays deduplicated.
        bridge
            .human_intervention_requested(
                "lookup",
                &SemanticVersion::new(1, 0, 0),
                "still broken",
            )
            .await;
        assert_eq!(alerts.active_alerts().unwrap().len(), 1);
    }
}
