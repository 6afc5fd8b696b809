use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::store::{MetricKind, MetricSample, MetricsStore};

/// Samples process and host metrics into the store. Host readings come from
/// `/proc` and are best effort; a missing file just skips that metric.
pub struct SystemMetricsCollector {
    store: Arc<MetricsStore>,
    started: Instant,
    source: String,
}

impl SystemMetricsCollector {
    pub fn new(store: Arc<MetricsStore>) -> Self {
        Self {
            store,
            started: Instant::now(),
            source: "taskloom".to_string(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// One collection pass. Returns the number of samples recorded.
    pub async fn collect_once(&self) -> usize {
        let mut recorded = 0;

        self.store
            .append(MetricSample::new(
                MetricKind::System,
                &self.source,
                "uptime_seconds",
                self.started.elapsed().as_secs_f64(),
            ))
            .await;
        recorded += 1;

        if let Some(rss) = read_rss_bytes() {
            self.store
                .append(MetricSample::new(
                    MetricKind::System,
                    &self.source,
                    "memory_rss_bytes",
                    rss,
                ))
                .await;
            recorded += 1;
        }

        if let Some(load) = read_load_average() {
            self.store
                .append(MetricSample::new(
                    MetricKind::System,
                    &self.source,
                    "load_average_1m",
                    load,
                ))
                .await;
            recorded += 1;
        }

        debug!(recorded, "System metrics collected");
        recorded
    }

    /// Record an arbitrary runtime gauge (registry size, queue depth, ...).
    pub async fn record_gauge(&self, name: &str, value: f64) {
        self.store
            .append(MetricSample::new(MetricKind::System, &self.source, name, value))
            .await;
    }
}

/// Resident set size from /proc/self/statm (pages × page size).
fn read_rss_bytes() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096.0)
}

/// One-minute load average from /proc/loadavg.
fn read_load_average() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    loadavg.split_whitespace().next()?.parse().ok()
}
