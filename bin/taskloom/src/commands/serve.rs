use axum::{
    extract::{Path as AxumPath, Query, Request, State},
    http::{header::HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use taskloom_core::{Config, Error, Paths, Result, TaskContext};
use taskloom_monitoring::{
    AlertManager, ComponentHealthChecker, DashboardGenerator, DashboardSpec, MetricFilter,
    MetricKind, MetricsStore, MonitoringService, SystemMetricsCollector, TimeWindow,
};
use taskloom_registry::TaskResolverRegistry;

use super::bridge::{MonitorBridge, RegistryHealthSource};

#[derive(Clone)]
struct ApiState {
    store: Arc<MetricsStore>,
    alerts: Arc<AlertManager>,
    collector: Arc<SystemMetricsCollector>,
    health: Arc<ComponentHealthChecker>,
    registry: Arc<TaskResolverRegistry>,
    bridge: Arc<MonitorBridge>,
    paths: Arc<Paths>,
}

/// Start the monitoring daemon: background collection loops plus the HTTP
/// API.
pub async fn run(port: Option<u16>, host: Option<String>) -> Result<()> {
    let base_paths = Paths::new();
    let config = Config::load_or_default(&base_paths)?;
    let paths = Arc::new(Paths::from_config_dir(&config.data_dir));
    paths.ensure_dirs()?;

    let registry = Arc::new(
        TaskResolverRegistry::new().with_persist_dir(paths.registry_dir()),
    );
    let store = MetricsStore::open(&paths.metrics_db())?;
    let alerts = Arc::new(AlertManager::new(store.clone()));
    let collector = Arc::new(SystemMetricsCollector::new(store.clone()));
    let health = Arc::new(ComponentHealthChecker::new(
        store.clone(),
        Arc::new(RegistryHealthSource::new(registry.clone())),
    ));
    let bridge = Arc::new(MonitorBridge::new(store.clone(), alerts.clone()));

    let service = Arc::new(
        MonitoringService::new(store.clone(), collector.clone(), alerts.clone())
            .with_health_checker(health.clone())
            .with_collection_interval(Duration::from_secs(config.collection_interval_sec))
            .with_health_interval(Duration::from_secs(config.health_interval_sec))
            .with_retention_days(config.metrics_retention_days),
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(service.run_loop(shutdown_tx.subscribe()));

    let state = ApiState {
        store,
        alerts,
        collector,
        health,
        registry,
        bridge,
        paths,
    };
    let app = router(state);

    let host = host.unwrap_or(config.http_bind);
    let port = port.unwrap_or(config.api_port);
    let addr = format!("{}:{}", host, port);
    info!(addr = %addr, "Monitoring API listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("cannot bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))?;
    let _ = shutdown_tx.send(());
    Ok(())
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics/system", get(handle_system_metrics))
        .route("/metrics/system/collect", post(handle_system_collect))
        .route("/health/components", get(handle_components))
        .route("/health/components/:id", get(handle_component_history))
        .route("/health/components/:id/check", post(handle_component_check))
        .route("/metrics/performance", get(handle_performance))
        .route("/metrics/performance/record", post(handle_performance_record))
        .route("/alerts/active", get(handle_alerts_active))
        .route("/alerts/:id/acknowledge", post(handle_alert_acknowledge))
        .route("/alerts/:id/resolve", post(handle_alert_resolve))
        .route("/dashboards", get(handle_dashboards_list))
        .route("/dashboards/generate", post(handle_dashboard_generate))
        .route("/dashboards/:id", get(handle_dashboard_get))
        .layer(middleware::from_fn(correlation_id))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Every response carries a correlation id, echoing the caller's when
/// present.
async fn correlation_id(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

/// HTTP-facing error: status code plus a machine-readable kind.
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let (status, kind) = match &e {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Validation(_) | Error::Json(_) => (StatusCode::BAD_REQUEST, "validation"),
            Error::State(_) => (StatusCode::CONFLICT, "state"),
            Error::Timeout(_) => (StatusCode::REQUEST_TIMEOUT, "timeout"),
            Error::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, "dependency"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            kind,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "kind": self.kind, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct RangeQuery {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    component: Option<String>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

fn parse_window(from: &Option<String>, to: &Option<String>) -> std::result::Result<TimeWindow, ApiError> {
    let parse = |raw: &str| -> std::result::Result<DateTime<Utc>, ApiError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ApiError::bad_request(format!("invalid timestamp '{}'", raw)))
    };
    Ok(TimeWindow {
        from: from.as_deref().map(parse).transpose()?,
        to: to.as_deref().map(parse).transpose()?,
    })
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_system_metrics(
    State(state): State<ApiState>,
    Query(query): Query<RangeQuery>,
) -> std::result::Result<Response, ApiError> {
    let window = parse_window(&query.from, &query.to)?;
    let mut filter = MetricFilter::default();
    filter.name = query.kind;
    let samples = state
        .store
        .query(MetricKind::System, &filter, &window, query.limit.or(Some(1000)))?;
    Ok(Json(samples).into_response())
}

async fn handle_system_collect(
    State(state): State<ApiState>,
) -> std::result::Result<Response, ApiError> {
    let collector = state.collector.clone();
    tokio::spawn(async move {
        collector.collect_once().await;
    });
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "collecting"}))).into_response())
}

async fn handle_components(
    State(state): State<ApiState>,
) -> std::result::Result<Response, ApiError> {
    let samples = state.store.query(
        MetricKind::Health,
        &MetricFilter::default(),
        &TimeWindow::default(),
        None,
    )?;
    // Latest sample per component (samples arrive timestamp-ascending).
    let mut latest: HashMap<String, serde_json::Value> = HashMap::new();
    for sample in samples {
        latest.insert(
            sample.source.clone(),
            json!({
                "healthy": sample.value >= 1.0,
                "checked_at": sample.timestamp,
                "details": sample.tags.get("details").cloned().unwrap_or_default(),
            }),
        );
    }
    Ok(Json(latest).into_response())
}

async fn handle_component_history(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<RangeQuery>,
) -> std::result::Result<Response, ApiError> {
    let window = parse_window(&query.from, &query.to)?;
    let samples = state.store.query(
        MetricKind::Health,
        &MetricFilter::source(id),
        &window,
        query.limit.or(Some(1000)),
    )?;
    Ok(Json(samples).into_response())
}

#[derive(Deserialize)]
struct CheckQuery {
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn handle_component_check(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<CheckQuery>,
) -> std::result::Result<Response, ApiError> {
    // Component ids look like `resolver:<name>@<version>`; a bare resolver
    // name probes its latest version.
    let name = id
        .strip_prefix("resolver:")
        .unwrap_or(&id)
        .split('@')
        .next()
        .unwrap_or(&id);
    let entry = state
        .registry
        .get(name, None)
        .await
        .map_err(|_| ApiError::not_found(format!("component '{}'", id)))?;

    let timeout = Duration::from_millis(query.timeout_ms.unwrap_or(5000));
    let ctx = TaskContext::new().with_timeout(timeout);
    let report = match tokio::time::timeout(timeout, entry.resolver.health_check(&ctx)).await {
        Ok(report) => report,
        Err(_) => taskloom_resolver::HealthReport::unhealthy(format!(
            "health check timed out after {:?}",
            timeout
        )),
    };
    state.health.check_once(&ctx).await;
    Ok(Json(json!({
        "component": format!("resolver:{}@{}", entry.name(), entry.version()),
        "healthy": report.healthy,
        "details": report.details,
        "checked_at": report.checked_at,
    }))
    .into_response())
}

async fn handle_performance(
    State(state): State<ApiState>,
    Query(query): Query<RangeQuery>,
) -> std::result::Result<Response, ApiError> {
    let window = parse_window(&query.from, &query.to)?;
    let mut filter = MetricFilter::default();
    filter.source = query.component;
    filter.name = query.op;
    let samples = state.store.query(
        MetricKind::Performance,
        &filter,
        &window,
        query.limit.or(Some(1000)),
    )?;
    Ok(Json(samples).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerformanceRecord {
    component: String,
    operation: String,
    duration_ms: f64,
    #[serde(default = "default_success")]
    success: bool,
}

fn default_success() -> bool {
    true
}

async fn handle_performance_record(
    State(state): State<ApiState>,
    Json(record): Json<PerformanceRecord>,
) -> std::result::Result<Response, ApiError> {
    if record.component.is_empty() || record.operation.is_empty() {
        return Err(ApiError::bad_request("component and operation are required"));
    }
    use taskloom_mastery::MetricsSink;
    state
        .bridge
        .record_performance(
            &record.component,
            &record.operation,
            record.duration_ms,
            record.success,
        )
        .await;
    Ok((StatusCode::CREATED, Json(json!({"status": "recorded"}))).into_response())
}

async fn handle_alerts_active(
    State(state): State<ApiState>,
) -> std::result::Result<Response, ApiError> {
    let alerts = state.alerts.active_alerts()?;
    Ok(Json(alerts).into_response())
}

#[derive(Deserialize, Default)]
struct AlertNote {
    #[serde(default)]
    note: Option<String>,
}

async fn handle_alert_acknowledge(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<AlertNote>>,
) -> std::result::Result<Response, ApiError> {
    let note = body.and_then(|Json(b)| b.note);
    let alert = state.alerts.acknowledge(&id, note.as_deref())?;
    Ok(Json(alert).into_response())
}

async fn handle_alert_resolve(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<AlertNote>>,
) -> std::result::Result<Response, ApiError> {
    let note = body.and_then(|Json(b)| b.note);
    let alert = state.alerts.resolve(&id, note.as_deref())?;
    Ok(Json(alert).into_response())
}

async fn handle_dashboards_list(
    State(state): State<ApiState>,
) -> std::result::Result<Response, ApiError> {
    let mut ids: Vec<String> = std::fs::read_dir(state.paths.dashboards_dir())
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let path = e.path();
                    if path.extension().and_then(|x| x.to_str()) == Some("html") {
                        path.file_stem().and_then(|s| s.to_str()).map(String::from)
                    } else {
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    ids.sort();
    Ok(Json(ids).into_response())
}

async fn handle_dashboard_generate(
    State(state): State<ApiState>,
    Json(spec): Json<DashboardSpec>,
) -> std::result::Result<Response, ApiError> {
    if spec.id.is_empty() || spec.panels.is_empty() {
        return Err(ApiError::bad_request("dashboard needs an id and at least one panel"));
    }
    let html = DashboardGenerator::generate(&state.store, &spec)?;
    let path = state.paths.dashboard_file(&spec.id);
    if let Err(e) = std::fs::write(&path, &html) {
        warn!(dashboard = %spec.id, error = %e, "Could not persist dashboard");
    }
    Ok(Html(html).into_response())
}

async fn handle_dashboard_get(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
) -> std::result::Result<Response, ApiError> {
    let path = state.paths.dashboard_file(&id);
    let html = std::fs::read_to_string(&path)
        .map_err(|_| ApiError::not_found(format!("dashboard '{}'", id)))?;
    Ok(Html(html).into_response())
}
