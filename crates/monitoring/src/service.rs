use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

use taskloom_core::TaskContext;

use crate::alerts::AlertManager;
use crate::collector::SystemMetricsCollector;
use crate::health::ComponentHealthChecker;
use crate::store::MetricsStore;

/// Background loops of the monitoring subsystem: metric collection, health
/// checks, alert evaluation and retention compaction.
pub struct MonitoringService {
    store: Arc<MetricsStore>,
    collector: Arc<SystemMetricsCollector>,
    health: Option<Arc<ComponentHealthChecker>>,
    alerts: Arc<AlertManager>,
    collection_interval: Duration,
    health_interval: Duration,
    alert_tick: Duration,
    retention: chrono::Duration,
}

impl MonitoringService {
    pub fn new(
        store: Arc<MetricsStore>,
        collector: Arc<SystemMetricsCollector>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            store,
            collector,
            health: None,
            alerts,
            collection_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(120),
            alert_tick: Duration::from_secs(30),
            retention: chrono::Duration::days(14),
        }
    }

    pub fn with_health_checker(mut self, health: Arc<ComponentHealthChecker>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_collection_interval(mut self, interval: Duration) -> Self {
        self.collection_interval = interval;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_alert_tick(mut self, tick: Duration) -> Self {
        self.alert_tick = tick;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention = chrono::Duration::days(days as i64);
        self
    }

    /// Run until shutdown. Missed ticks are skipped, never batched.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            collection_secs = self.collection_interval.as_secs(),
            health_secs = self.health_interval.as_secs(),
            alert_secs = self.alert_tick.as_secs(),
            "MonitoringService started"
        );

        let mut collect = tokio::time::interval(self.collection_interval);
        collect.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut alerts = tokio::time::interval(self.alert_tick);
        alerts.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut compact = tokio::time::interval(Duration::from_secs(3600));
        compact.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick of each interval.
        collect.tick().await;
        health.tick().await;
        alerts.tick().await;
        compact.tick().await;

        loop {
            tokio::select! {
                _ = collect.tick() => {
                    self.collector.collect_once().await;
                }
                _ = health.tick() => {
                    if let Some(checker) = &self.health {
                        let ctx = TaskContext::new();
                        checker.check_once(&ctx).await;
                    }
                }
                _ = alerts.tick() => {
                    if let Err(e) = self.alerts.evaluate_tick() {
                        error!(error = %e, "Alert evaluation tick failed");
                    }
                }
                _ = compact.tick() => {
                    let cutoff = Utc::now() - self.retention;
                    match self.store.compact(cutoff) {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "Retention compaction done");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Retention compaction failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("MonitoringService shutting down");
                    self.store.flush().await;
                    break;
                }
            }
        }
    }
}
