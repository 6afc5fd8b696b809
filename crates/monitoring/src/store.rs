use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use taskloom_core::{Error, Result};

/// Which per-kind table a sample lands in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    System,
    Health,
    Performance,
}

impl MetricKind {
    fn table(&self) -> &'static str {
        match self {
            MetricKind::System => "system_metrics",
            MetricKind::Health => "component_health",
            MetricKind::Performance => "performance_metrics",
        }
    }
}

/// Append-only metric sample. Never updated after the fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub kind: MetricKind,
    /// Component id the sample describes.
    pub source: String,
    /// Metric or operation name.
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Store-assigned when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MetricSample {
    pub fn new(kind: MetricKind, source: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            kind,
            source: source.into(),
            name: name.into(),
            value,
            tags: HashMap::new(),
            timestamp: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Conjunctive filter over source, name and tags.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MetricFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl MetricFilter {
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    fn matches_tags(&self, tags: &HashMap<String, String>) -> bool {
        self.tags
            .iter()
            .all(|(k, v)| tags.get(k).map(|t| t == v).unwrap_or(false))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct TimeWindow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn last(duration: Duration) -> Self {
        Self {
            from: Some(Utc::now() - chrono::Duration::from_std(duration).unwrap_or_default()),
            to: None,
        }
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    P50,
    P95,
    P99,
}

impl Reducer {
    pub fn reduce(&self, values: &mut Vec<f64>) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Reducer::Count => values.len() as f64,
            Reducer::Sum => values.iter().sum(),
            Reducer::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Reducer::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Reducer::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reducer::P50 => percentile(values, 0.50),
            Reducer::P95 => percentile(values, 0.95),
            Reducer::P99 => percentile(values, 0.99),
        }
    }
}

/// Nearest-rank percentile over an unsorted buffer.
fn percentile(values: &mut [f64], q: f64) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((q * values.len() as f64).ceil() as usize).clamp(1, values.len());
    values[rank - 1]
}

enum QueueItem {
    Sample(MetricSample),
    Flush(oneshot::Sender<()>),
}

const QUEUE_CAPACITY: usize = 4096;
const APPEND_TIMEOUT: Duration = Duration::from_millis(100);
const BATCH_SIZE: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Append-only, on-disk metrics store over an embedded SQLite file.
///
/// Appends go through a bounded queue drained by a single writer task that
/// batches inserts (loss window is one flush interval). When the queue is
/// saturated a writer blocks briefly, then the sample is dropped and the
/// `sample_dropped` counter incremented. Reads run directly against the
/// connection.
pub struct MetricsStore {
    conn: Arc<Mutex<Connection>>,
    queue: mpsc::Sender<QueueItem>,
    dropped: Arc<AtomicU64>,
    /// Guard for store-assigned timestamps: strictly non-decreasing.
    last_assigned: Mutex<DateTime<Utc>>,
}

impl MetricsStore {
    /// Open (or create) the store and start the writer task. Must be called
    /// inside a tokio runtime.
    pub fn open(db_path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("failed to create db directory: {}", e)))?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("failed to open metrics db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let conn = Arc::new(Mutex::new(conn));
        init_schema(&conn)?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let store = Arc::new(Self {
            conn: conn.clone(),
            queue: tx,
            dropped: Arc::new(AtomicU64::new(0)),
            last_assigned: Mutex::new(Utc::now()),
        });
        tokio::spawn(writer_loop(conn, rx));
        info!(path = %db_path.display(), "Metrics store opened");
        Ok(store)
    }

    /// Queue a sample for the writer. A store-assigned timestamp is strictly
    /// non-decreasing across appends. Never fails the caller: under
    /// sustained backpressure the sample is dropped and counted.
    pub async fn append(&self, mut sample: MetricSample) {
        if sample.timestamp.is_none() {
            // The guard value stays usable even if a writer panicked.
            let mut last = self
                .last_assigned
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Utc::now();
            let assigned = if now > *last {
                now
            } else {
                *last + chrono::Duration::microseconds(1)
            };
            *last = assigned;
            sample.timestamp = Some(assigned);
        }
        let item = QueueItem::Sample(sample);
        match self.queue.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                match tokio::time::timeout(APPEND_TIMEOUT, self.queue.send(item)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("Metric sample dropped under backpressure");
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Samples dropped under backpressure since the store opened.
    pub fn sample_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until every queued sample is on disk.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.queue.send(QueueItem::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Matching samples ordered by timestamp ascending.
    pub fn query(
        &self,
        kind: MetricKind,
        filter: &MetricFilter,
        window: &TimeWindow,
        limit: Option<usize>,
    ) -> Result<Vec<MetricSample>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        let mut sql = format!(
            "SELECT source, name, value, tags, timestamp FROM {} WHERE 1=1",
            kind.table()
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(source) = &filter.source {
            sql.push_str(" AND source = ?");
            args.push(source.clone());
        }
        if let Some(name) = &filter.name {
            sql.push_str(" AND name = ?");
            args.push(name.clone());
        }
        if let Some(from) = &window.from {
            sql.push_str(" AND timestamp >= ?");
            args.push(encode_ts(from));
        }
        if let Some(to) = &window.to {
            sql.push_str(" AND timestamp <= ?");
            args.push(encode_ts(to));
        }
        sql.push_str(" ORDER BY timestamp ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let tags_raw: String = row.get(3)?;
                let ts_raw: String = row.get(4)?;
                Ok(MetricSample {
                    kind,
                    source: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                    tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
                    timestamp: decode_ts(&ts_raw),
                })
            })
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut samples = Vec::new();
        for row in rows {
            let sample = row.map_err(|e| Error::Storage(e.to_string()))?;
            if filter.matches_tags(&sample.tags) {
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    /// Bucketed aggregation over the window, ordered by bucket start.
    pub fn aggregate(
        &self,
        kind: MetricKind,
        filter: &MetricFilter,
        window: &TimeWindow,
        bucket: Duration,
        reducer: Reducer,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let samples = self.query(kind, filter, window, None)?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let bucket_ms = bucket.as_millis().max(1) as i64;

        let mut buckets: Vec<(i64, Vec<f64>)> = Vec::new();
        for sample in &samples {
            let ts = sample.timestamp.expect("stored samples carry timestamps");
            let start = ts.timestamp_millis().div_euclid(bucket_ms) * bucket_ms;
            match buckets.last_mut() {
                Some((current, values)) if *current == start => values.push(sample.value),
                _ => buckets.push((start, vec![sample.value])),
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(start, mut values)| {
                let at = DateTime::<Utc>::from_timestamp_millis(start)
                    .unwrap_or_else(Utc::now);
                (at, reducer.reduce(&mut values))
            })
            .collect())
    }

    /// Remove samples older than the cutoff from every kind table. Returns
    /// rows removed.
    pub fn compact(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        let cutoff = encode_ts(&older_than);
        let mut removed = 0usize;
        for kind in [MetricKind::System, MetricKind::Health, MetricKind::Performance] {
            let count = conn
                .execute(
                    &format!("DELETE FROM {} WHERE timestamp < ?1", kind.table()),
                    params![cutoff],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            removed += count;
        }
        if removed > 0 {
            info!(removed, cutoff = %older_than, "Compacted metric samples");
        }
        Ok(removed)
    }

    /// Direct access for the alert tables. Crate-internal.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

fn init_schema(conn: &Arc<Mutex<Connection>>) -> Result<()> {
    let conn = conn
        .lock()
        .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS system_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            name TEXT NOT NULL,
            value REAL NOT NULL,
            tags TEXT NOT NULL DEFAULT '{}',
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_system_metrics_ts ON system_metrics (timestamp);
        CREATE INDEX IF NOT EXISTS idx_system_metrics_source ON system_metrics (source, name);

        CREATE TABLE IF NOT EXISTS component_health (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            name TEXT NOT NULL,
            value REAL NOT NULL,
            tags TEXT NOT NULL DEFAULT '{}',
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_component_health_ts ON component_health (timestamp);
        CREATE INDEX IF NOT EXISTS idx_component_health_source ON component_health (source, name);

        CREATE TABLE IF NOT EXISTS performance_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            name TEXT NOT NULL,
            value REAL NOT NULL,
            tags TEXT NOT NULL DEFAULT '{}',
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_performance_metrics_ts ON performance_metrics (timestamp);
        CREATE INDEX IF NOT EXISTS idx_performance_metrics_source ON performance_metrics (source, name);

        CREATE TABLE IF NOT EXISTS alert_rules (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            rule_id TEXT NOT NULL,
            severity TEXT NOT NULL,
            state TEXT NOT NULL,
            message TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT '{}',
            opened_at TEXT NOT NULL,
            acknowledged_at TEXT,
            closed_at TEXT,
            note TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts (rule_id, state);
        CREATE INDEX IF NOT EXISTS idx_alerts_state ON alerts (state);",
    )
    .map_err(|e| Error::Storage(e.to_string()))?;
    Ok(())
}

async fn writer_loop(conn: Arc<Mutex<Connection>>, mut rx: mpsc::Receiver<QueueItem>) {
    let mut pending: Vec<MetricSample> = Vec::new();
    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(QueueItem::Sample(sample))) => {
                pending.push(sample);
                // Drain whatever else is immediately available.
                while pending.len() < BATCH_SIZE {
                    match rx.try_recv() {
                        Ok(QueueItem::Sample(sample)) => pending.push(sample),
                        Ok(QueueItem::Flush(ack)) => {
                            write_batch(&conn, &mut pending);
                            let _ = ack.send(());
                        }
                        Err(_) => break,
                    }
                }
                if pending.len() >= BATCH_SIZE {
                    write_batch(&conn, &mut pending);
                }
            }
            Ok(Some(QueueItem::Flush(ack))) => {
                write_batch(&conn, &mut pending);
                let _ = ack.send(());
            }
            Ok(None) => {
                write_batch(&conn, &mut pending);
                break;
            }
            Err(_) => {
                write_batch(&conn, &mut pending);
            }
        }
    }
}

fn write_batch(conn: &Arc<Mutex<Connection>>, pending: &mut Vec<MetricSample>) {
    if pending.is_empty() {
        return;
    }
    let mut conn = match conn.lock() {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, count = pending.len(), "Dropping batch, store lock poisoned");
            pending.clear();
            return;
        }
    };
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            warn!(error = %e, count = pending.len(), "Dropping batch, transaction failed");
            pending.clear();
            return;
        }
    };
    for sample in pending.drain(..) {
        let tags = serde_json::to_string(&sample.tags).unwrap_or_else(|_| "{}".into());
        let ts = sample
            .timestamp
            .map(|t| encode_ts(&t))
            .unwrap_or_else(|| encode_ts(&Utc::now()));
        let result = tx.execute(
            &format!(
                "INSERT INTO {} (source, name, value, tags, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
                sample.kind.table()
            ),
            params![sample.source, sample.name, sample.value, tags, ts],
        );
        if let Err(e) = result {
            warn!(error = %e, "Failed to insert metric sample");
        }
    }
    if let Err(e) = tx.commit() {
        warn!(error = %e, "Failed to commit metric batch");
    }
}

/// Fixed-width UTC encoding so lexicographic order matches time order.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, Arc<MetricsStore>) {
        let dir = TempDir::new().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn append_query_round_trip() {
        let (_dir, store) = open_store().await;
        store
            .append(
                MetricSample::new(MetricKind::System, "host", "cpu_percent", 12.5)
                    .with_tag("core", "0"),
            )
            .await;
        store
            .append(MetricSample::new(MetricKind::System, "host", "cpu_percent", 80.0))
            .await;
        store.flush().await;

        let samples = store
            .query(
                MetricKind::System,
                &MetricFilter::source("host").with_name("cpu_percent"),
                &TimeWindow::default(),
                None,
            )
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].value, 12.5);
        assert_eq!(samples[0].tags.get("core").map(String::as_str), Some("0"));
        // Ascending order
        assert!(samples[0].timestamp.unwrap() <= samples[1].timestamp.unwrap());
    }

    #[tokio::test]
    async fn tag_filter_is_conjunctive() {
        let (_dir, store) = open_store().await;
        store
            .append(
                MetricSample::new(MetricKind::Performance, "fan", "step-a", 10.0)
                    .with_tag("success", "true"),
            )
            .await;
        store
            .append(
                MetricSample::new(MetricKind::Performance, "fan", "step-a", 99.0)
                    .with_tag("success", "false"),
            )
            .await;
        store.flush().await;

        let ok = store
            .query(
                MetricKind::Performance,
                &MetricFilter::source("fan").with_tag("success", "true"),
                &TimeWindow::default(),
                None,
            )
            .unwrap();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].value, 10.0);
    }

    #[tokio::test]
    async fn count_reducer_matches_appended_samples() {
        let (_dir, store) = open_store().await;
        let base = Utc::now();
        for i in 0..7 {
            store
                .append(
                    MetricSample::new(MetricKind::System, "s", "m", i as f64)
                        .at(base + chrono::Duration::milliseconds(i * 10)),
                )
                .await;
        }
        store.flush().await;

        let window = TimeWindow::between(
            base - chrono::Duration::seconds(1),
            base + chrono::Duration::seconds(1),
        );
        let buckets = store
            .aggregate(
                MetricKind::System,
                &MetricFilter::source("s"),
                &window,
                Duration::from_secs(10),
                Reducer::Count,
            )
            .unwrap();
        let total: f64 = buckets.iter().map(|(_, v)| v).sum();
        assert_eq!(total, 7.0);
    }

    #[tokio::test]
    async fn aggregation_reducers() {
        let (_dir, store) = open_store().await;
        let base = Utc::now();
        for (i, v) in [2.0, 4.0, 6.0, 8.0].iter().enumerate() {
            store
                .append(
                    MetricSample::new(MetricKind::Performance, "p", "op", *v)
                        .at(base + chrono::Duration::milliseconds(i as i64)),
                )
                .await;
        }
        store.flush().await;

        let window = TimeWindow::between(
            base - chrono::Duration::seconds(1),
            base + chrono::Duration::seconds(1),
        );
        let agg = |reducer| {
            store
                .aggregate(
                    MetricKind::Performance,
                    &MetricFilter::source("p"),
                    &window,
                    Duration::from_secs(60),
                    reducer,
                )
                .unwrap()[0]
                .1
        };
        assert_eq!(agg(Reducer::Sum), 20.0);
        assert_eq!(agg(Reducer::Avg), 5.0);
        assert_eq!(agg(Reducer::Min), 2.0);
        assert_eq!(agg(Reducer::Max), 8.0);
        assert_eq!(agg(Reducer::P50), 4.0);
        assert_eq!(agg(Reducer::P99), 8.0);
    }

    #[tokio::test]
    async fn compact_removes_old_rows() {
        let (_dir, store) = open_store().await;
        let old = Utc::now() - chrono::Duration::days(30);
        store
            .append(MetricSample::new(MetricKind::System, "s", "m", 1.0).at(old))
            .await;
        store
            .append(MetricSample::new(MetricKind::System, "s", "m", 2.0))
            .await;
        store.flush().await;

        let removed = store
            .compact(Utc::now() - chrono::Duration::days(14))
            .unwrap();
        assert_eq!(removed, 1);
        let left = store
            .query(
                MetricKind::System,
                &MetricFilter::default(),
                &TimeWindow::default(),
                None,
            )
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].value, 2.0);
    }

    #[tokio::test]
    async fn store_assigned_timestamps_never_regress() {
        let (_dir, store) = open_store().await;
        for i in 0..50 {
            store
                .append(MetricSample::new(MetricKind::System, "s", "m", i as f64))
                .await;
        }
        store.flush().await;
        let samples = store
            .query(
                MetricKind::System,
                &MetricFilter::default(),
                &TimeWindow::default(),
                None,
            )
            .unwrap();
        assert_eq!(samples.len(), 50);
        for pair in samples.windows(2) {
            assert!(pair[0].timestamp.unwrap() <= pair[1].timestamp.unwrap());
        }
        // Values arrived in append order.
        assert_eq!(samples[0].value, 0.0);
        assert_eq!(samples[49].value, 49.0);
    }
}
