use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use taskloom_core::{Error, Result};

use crate::store::{decode_ts, encode_ts, MetricFilter, MetricKind, MetricsStore, Reducer, TimeWindow};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "info" => Severity::Info,
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "critical" => Severity::Critical,
            _ => Severity::High,
        }
    }
}

/// One-way lifecycle: Active → Acknowledged → Resolved, or Active → Resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Active => "active",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Resolved => "resolved",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "acknowledged" => AlertState::Acknowledged,
            "resolved" => AlertState::Resolved,
            _ => AlertState::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Gte => value >= threshold,
            CompareOp::Lte => value <= threshold,
            CompareOp::Eq => (value - threshold).abs() < f64::EPSILON,
            CompareOp::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Periodically evaluated alert rule. Severity belongs to the rule; editing
/// it never rewrites already-open alerts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub filter: MetricFilter,
    pub window_secs: u64,
    pub bucket_secs: u64,
    pub reducer: Reducer,
    pub op: CompareOp,
    pub threshold: f64,
    pub severity: Severity,
    /// An Active alert older than this is resolved once the predicate goes
    /// false.
    pub cooldown_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            id: format!("rule_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            kind,
            filter: MetricFilter::default(),
            window_secs: 300,
            bucket_secs: 60,
            reducer: Reducer::Avg,
            op: CompareOp::Gt,
            threshold: 0.0,
            severity: Severity::Medium,
            cooldown_secs: 300,
            enabled: true,
        }
    }

    pub fn with_filter(mut self, filter: MetricFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_window(mut self, window_secs: u64, bucket_secs: u64) -> Self {
        self.window_secs = window_secs;
        self.bucket_secs = bucket_secs.max(1);
        self
    }

    pub fn with_predicate(mut self, reducer: Reducer, op: CompareOp, threshold: f64) -> Self {
        self.reducer = reducer;
        self.op = op;
        self.threshold = threshold;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub state: AlertState,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Evaluates rules over the metric store and maintains alert lifecycle.
/// At most one Active alert exists per rule at any instant.
pub struct AlertManager {
    store: Arc<MetricsStore>,
}

impl AlertManager {
    pub fn new(store: Arc<MetricsStore>) -> Self {
        Self { store }
    }

    pub fn upsert_rule(&self, rule: &AlertRule) -> Result<()> {
        let body = serde_json::to_string(rule)?;
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        conn.execute(
            "INSERT INTO alert_rules (id, body) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![rule.id, body],
        )
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn list_rules(&self) -> Result<Vec<AlertRule>> {
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        let mut stmt = conn
            .prepare("SELECT body FROM alert_rules ORDER BY id")
            .map_err(|e| Error::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Storage(e.to_string()))?;
        let mut rules = Vec::new();
        for row in rows {
            let body = row.map_err(|e| Error::Storage(e.to_string()))?;
            match serde_json::from_str(&body) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(error = %e, "Skipping unreadable alert rule"),
            }
        }
        Ok(rules)
    }

    pub fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        let removed = conn
            .execute("DELETE FROM alert_rules WHERE id = ?1", params![rule_id])
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(removed > 0)
    }

    /// One evaluation pass over every enabled rule.
    pub fn evaluate_tick(&self) -> Result<usize> {
        let rules = self.list_rules()?;
        let mut opened = 0;
        for rule in rules.iter().filter(|r| r.enabled) {
            if let Err(e) = self.evaluate_rule(rule, &mut opened) {
                warn!(rule = %rule.id, error = %e, "Rule evaluation failed");
            }
        }
        Ok(opened)
    }

    fn evaluate_rule(&self, rule: &AlertRule, opened: &mut usize) -> Result<()> {
        let window = TimeWindow::last(Duration::from_secs(rule.window_secs));
        let buckets = self.store.aggregate(
            rule.kind,
            &rule.filter,
            &window,
            Duration::from_secs(rule.bucket_secs),
            rule.reducer,
        )?;
        let Some((_, latest)) = buckets.last() else {
            return Ok(());
        };

        let firing = rule.op.apply(*latest, rule.threshold);
        let active = self.active_alert_for_rule(&rule.id)?;

        match (firing, active) {
            (true, None) => {
                let message = format!(
                    "{}: value {:.4} {} threshold {:.4}",
                    rule.name,
                    latest,
                    match rule.op {
                        CompareOp::Gt => ">",
                        CompareOp::Lt => "<",
                        CompareOp::Gte => ">=",
                        CompareOp::Lte => "<=",
                        CompareOp::Eq => "==",
                        CompareOp::Ne => "!=",
                    },
                    rule.threshold
                );
                self.open_alert(
                    &rule.id,
                    rule.severity,
                    &message,
                    serde_json::json!({ "value": latest }),
                )?;
                *opened += 1;
            }
            (false, Some(alert)) => {
                let age = Utc::now() - alert.opened_at;
                if age >= chrono::Duration::seconds(rule.cooldown_secs as i64) {
                    let _ = self.resolve(&alert.id, Some("condition cleared"))?;
                    debug!(alert = %alert.id, rule = %rule.id, "Alert auto-resolved");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Open an alert for a rule id. Deduplicated: a second Active alert for
    /// the same rule is not created.
    pub fn open_alert(
        &self,
        rule_id: &str,
        severity: Severity,
        message: &str,
        details: serde_json::Value,
    ) -> Result<Alert> {
        if let Some(existing) = self.active_alert_for_rule(rule_id)? {
            debug!(rule = %rule_id, alert = %existing.id, "Active alert already open");
            return Ok(existing);
        }
        let alert = Alert {
            id: format!("alert_{}", uuid::Uuid::new_v4().simple()),
            rule_id: rule_id.to_string(),
            severity,
            state: AlertState::Active,
            message: message.to_string(),
            details,
            opened_at: Utc::now(),
            acknowledged_at: None,
            closed_at: None,
            note: None,
        };
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        conn.execute(
            "INSERT INTO alerts (id, rule_id, severity, state, message, details, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                alert.id,
                alert.rule_id,
                alert.severity.as_str(),
                alert.state.as_str(),
                alert.message,
                alert.details.to_string(),
                encode_ts(&alert.opened_at),
            ],
        )
        .map_err(|e| Error::Storage(e.to_string()))?;
        info!(alert = %alert.id, rule = %rule_id, severity = %alert.severity.as_str(), "Alert opened");
        Ok(alert)
    }

    /// Acknowledge an Active alert. Idempotent on an Acknowledged alert; a
    /// Resolved alert is a state conflict.
    pub fn acknowledge(&self, alert_id: &str, note: Option<&str>) -> Result<Alert> {
        let alert = self
            .get_alert(alert_id)?
            .ok_or_else(|| Error::NotFound(format!("alert {}", alert_id)))?;
        match alert.state {
            AlertState::Acknowledged => Ok(alert),
            AlertState::Resolved => Err(Error::State(format!(
                "alert {} is already resolved",
                alert_id
            ))),
            AlertState::Active => {
                let now = Utc::now();
                let conn = self.store.connection();
                let conn = conn
                    .lock()
                    .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
                conn.execute(
                    "UPDATE alerts SET state = 'acknowledged', acknowledged_at = ?1, note = COALESCE(?2, note)
                     WHERE id = ?3 AND state = 'active'",
                    params![encode_ts(&now), note, alert_id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
                drop(conn);
                self.get_alert(alert_id)?
                    .ok_or_else(|| Error::NotFound(format!("alert {}", alert_id)))
            }
        }
    }

    /// Resolve an alert from Active or Acknowledged. Idempotent once
    /// Resolved.
    pub fn resolve(&self, alert_id: &str, note: Option<&str>) -> Result<Alert> {
        let alert = self
            .get_alert(alert_id)?
            .ok_or_else(|| Error::NotFound(format!("alert {}", alert_id)))?;
        if alert.state == AlertState::Resolved {
            return Ok(alert);
        }
        let now = Utc::now();
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        conn.execute(
            "UPDATE alerts SET state = 'resolved', closed_at = ?1, note = COALESCE(?2, note)
             WHERE id = ?3 AND state != 'resolved'",
            params![encode_ts(&now), note, alert_id],
        )
        .map_err(|e| Error::Storage(e.to_string()))?;
        drop(conn);
        info!(alert = %alert_id, "Alert resolved");
        self.get_alert(alert_id)?
            .ok_or_else(|| Error::NotFound(format!("alert {}", alert_id)))
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        conn.query_row(
            "SELECT id, rule_id, severity, state, message, details, opened_at, acknowledged_at, closed_at, note
             FROM alerts WHERE id = ?1",
            params![alert_id],
            row_to_alert,
        )
        .optional()
        .map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn active_alerts(&self) -> Result<Vec<Alert>> {
        self.alerts_where("state != 'resolved'")
    }

    pub fn all_alerts(&self) -> Result<Vec<Alert>> {
        self.alerts_where("1=1")
    }

    fn active_alert_for_rule(&self, rule_id: &str) -> Result<Option<Alert>> {
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        conn.query_row(
            "SELECT id, rule_id, severity, state, message, details, opened_at, acknowledged_at, closed_at, note
             FROM alerts WHERE rule_id = ?1 AND state != 'resolved' ORDER BY opened_at DESC LIMIT 1",
            params![rule_id],
            row_to_alert,
        )
        .optional()
        .map_err(|e| Error::Storage(e.to_string()))
    }

    fn alerts_where(&self, predicate: &str) -> Result<Vec<Alert>> {
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Storage(format!("lock error: {}", e)))?;
        let sql = format!(
            "SELECT id, rule_id, severity, state, message, details, opened_at, acknowledged_at, closed_at, note
             FROM alerts WHERE {} ORDER BY opened_at DESC",
            predicate
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| Error::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_alert)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row.map_err(|e| Error::Storage(e.to_string()))?);
        }
        Ok(alerts)
    }
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let severity: String = row.get(2)?;
    let state: String = row.get(3)?;
    let details_raw: String = row.get(5)?;
    let opened_raw: String = row.get(6)?;
    let ack_raw: Option<String> = row.get(7)?;
    let closed_raw: Option<String> = row.get(8)?;
    Ok(Alert {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        severity: Severity::from_str(&severity),
        state: AlertState::from_str(&state),
        message: row.get(4)?,
        details: serde_json::from_str(&details_raw).unwrap_or(serde_json::Value::Null),
        opened_at: decode_ts(&opened_raw).unwrap_or_else(Utc::now),
        acknowledged_at: ack_raw.as_deref().and_then(decode_ts),
        closed_at: closed_raw.as_deref().and_then(decode_ts),
        note: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetricSample;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<MetricsStore>, AlertManager) {
        let dir = TempDir::new().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db")).unwrap();
        let manager = AlertManager::new(store.clone());
        (dir, store, manager)
    }

    fn cpu_rule() -> AlertRule {
        AlertRule::new("high cpu", MetricKind::System)
            .with_filter(MetricFilter::source("host").with_name("cpu_percent"))
            .with_window(300, 60)
            .with_predicate(Reducer::Avg, CompareOp::Gt, 90.0)
            .with_severity(Severity::High)
            .with_cooldown_secs(0)
    }

    #[tokio::test]
    async fn rule_round_trip() {
        let (_dir, _store, manager) = setup().await;
        let rule = cpu_rule();
        manager.upsert_rule(&rule).unwrap();
        let rules = manager.list_rules().unwrap();
        assert_eq!(rules, vec![rule.clone()]);

        let mut updated = rule.clone();
        updated.threshold = 95.0;
        manager.upsert_rule(&updated).unwrap();
        assert_eq!(manager.list_rules().unwrap()[0].threshold, 95.0);

        assert!(manager.delete_rule(&rule.id).unwrap());
        assert!(manager.list_rules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn firing_rule_opens_one_alert() {
        let (_dir, store, manager) = setup().await;
        let rule = cpu_rule();
        manager.upsert_rule(&rule).unwrap();

        store
            .append(MetricSample::new(MetricKind::System, "host", "cpu_percent", 97.0))
            .await;
        store.flush().await;

        let opened = manager.evaluate_tick().unwrap();
        assert_eq!(opened, 1);

        // Second tick while still firing: deduplicated.
        let opened = manager.evaluate_tick().unwrap();
        assert_eq!(opened, 0);
        let active = manager.active_alerts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, rule.id);
        assert_eq!(active[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn alert_resolves_after_condition_clears() {
        let (_dir, store, manager) = setup().await;
        let rule = cpu_rule();
        manager.upsert_rule(&rule).unwrap();

        store
            .append(MetricSample::new(MetricKind::System, "host", "cpu_percent", 97.0))
            .await;
        store.flush().await;
        manager.evaluate_tick().unwrap();
        assert_eq!(manager.active_alerts().unwrap().len(), 1);

        // Condition clears (new sample pulls the latest bucket down).
        store
            .append(MetricSample::new(MetricKind::System, "host", "cpu_percent", 5.0))
            .await;
        store.flush().await;
        manager.evaluate_tick().unwrap();

        let active = manager.active_alerts().unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn lifecycle_is_one_way_and_idempotent() {
        let (_dir, _store, manager) = setup().await;
        let alert = manager
            .open_alert("rule-x", Severity::Critical, "it broke", serde_json::json!({}))
            .unwrap();

        let acked = manager.acknowledge(&alert.id, Some("looking")).unwrap();
        assert_eq!(acked.state, AlertState::Acknowledged);
        assert!(acked.acknowledged_at.is_some());

        // Repeated acknowledge is a no-op.
        let again = manager.acknowledge(&alert.id, None).unwrap();
        assert_eq!(again.state, AlertState::Acknowledged);
        assert_eq!(again.acknowledged_at, acked.acknowledged_at);

        let resolved = manager.resolve(&alert.id, Some("fixed")).unwrap();
        assert_eq!(resolved.state, AlertState::Resolved);
        assert!(resolved.closed_at.is_some());

        // Repeated resolve is a no-op.
        let again = manager.resolve(&alert.id, None).unwrap();
        assert_eq!(again.closed_at, resolved.closed_at);

        // Acking a resolved alert is a state conflict.
        assert!(matches!(
            manager.acknowledge(&alert.id, None),
            Err(Error::State(_))
        ));
    }

    #[tokio::test]
    async fn dedup_one_active_per_rule() {
        let (_dir, _store, manager) = setup().await;
        let first = manager
            .open_alert("rule-y", Severity::Low, "first", serde_json::json!({}))
            .unwrap();
        let second = manager
            .open_alert("rule-y", Severity::Low, "second", serde_json::json!({}))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(manager.active_alerts().unwrap().len(), 1);

        // Once resolved, a new alert may open.
        manager.resolve(&first.id, None).unwrap();
        let third = manager
            .open_alert("rule-y", Severity::Low, "third", serde_json::json!({}))
            .unwrap();
        assert_ne!(third.id, first.id);
    }
}
