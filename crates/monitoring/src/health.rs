use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use taskloom_core::TaskContext;

use crate::store::{MetricKind, MetricSample, MetricsStore};

/// One component's probe result.
#[derive(Debug, Clone)]
pub struct ComponentStatus {
    pub component: String,
    pub healthy: bool,
    pub details: String,
}

/// Something that can report the health of its components. The registry's
/// health roll-up is the main implementor.
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn component_health(
        &self,
        ctx: &TaskContext,
        per_component_timeout: Duration,
    ) -> Vec<ComponentStatus>;
}

/// Periodically probes a health source and records one health sample per
/// component (value 1.0 healthy, 0.0 unhealthy).
pub struct ComponentHealthChecker {
    store: Arc<MetricsStore>,
    source: Arc<dyn HealthSource>,
    per_component_timeout: Duration,
}

impl ComponentHealthChecker {
    pub fn new(store: Arc<MetricsStore>, source: Arc<dyn HealthSource>) -> Self {
        Self {
            store,
            source,
            per_component_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_component_timeout = timeout;
        self
    }

    /// Probe once and record the results. Returns the statuses for callers
    /// that want them (the forced-check API endpoint).
    pub async fn check_once(&self, ctx: &TaskContext) -> Vec<ComponentStatus> {
        let statuses = self
            .source
            .component_health(ctx, self.per_component_timeout)
            .await;
        for status in &statuses {
            self.store
                .append(
                    MetricSample::new(
                        MetricKind::Health,
                        &status.component,
                        "healthy",
                        if status.healthy { 1.0 } else { 0.0 },
                    )
                    .with_tag("details", &status.details),
                )
                .await;
        }
        debug!(components = statuses.len(), "Component health recorded");
        statuses
    }
}
