use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use taskloom_core::Result;

use crate::store::{MetricFilter, MetricKind, MetricsStore, Reducer, TimeWindow};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Line,
    Bar,
    Pie,
    MultiLine,
}

/// One aggregate query rendered as one chart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Panel {
    pub title: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub filter: MetricFilter,
    pub window_secs: u64,
    pub bucket_secs: u64,
    pub reducer: Reducer,
    pub chart: ChartKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardSpec {
    pub id: String,
    pub title: String,
    pub panels: Vec<Panel>,
}

/// One aggregated series, labeled for multi-line charts.
#[derive(Debug, Clone, Serialize)]
pub struct Series {
    pub label: String,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

const SVG_WIDTH: f64 = 640.0;
const SVG_HEIGHT: f64 = 240.0;
const PAD: f64 = 32.0;

/// Stateless spec → HTML renderer. Charts are inline SVG built from the
/// aggregated series, and each panel embeds its data as a JSON blob, so the
/// document is fully self-contained. Deterministic for a fixed spec and
/// metric snapshot.
pub struct DashboardGenerator;

impl DashboardGenerator {
    /// Aggregate every panel against the store and render the document.
    pub fn generate(store: &Arc<MetricsStore>, spec: &DashboardSpec) -> Result<String> {
        let mut panel_series: Vec<Vec<Series>> = Vec::with_capacity(spec.panels.len());
        for panel in &spec.panels {
            let window = TimeWindow::last(Duration::from_secs(panel.window_secs));
            let series = match panel.chart {
                ChartKind::MultiLine => {
                    // One line per source matching the panel filter.
                    let samples = store.query(panel.kind, &panel.filter, &window, None)?;
                    let mut sources: Vec<String> =
                        samples.iter().map(|s| s.source.clone()).collect();
                    sources.sort();
                    sources.dedup();
                    let mut lines = Vec::new();
                    for source in sources {
                        let mut filter = panel.filter.clone();
                        filter.source = Some(source.clone());
                        let points = store.aggregate(
                            panel.kind,
                            &filter,
                            &window,
                            Duration::from_secs(panel.bucket_secs),
                            panel.reducer,
                        )?;
                        lines.push(Series {
                            label: source,
                            points,
                        });
                    }
                    lines
                }
                _ => {
                    let points = store.aggregate(
                        panel.kind,
                        &panel.filter,
                        &window,
                        Duration::from_secs(panel.bucket_secs),
                        panel.reducer,
                    )?;
                    vec![Series {
                        label: panel.title.clone(),
                        points,
                    }]
                }
            };
            panel_series.push(series);
        }
        Ok(Self::render(spec, &panel_series))
    }

    /// Pure rendering over already-aggregated data.
    pub fn render(spec: &DashboardSpec, panel_series: &[Vec<Series>]) -> String {
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str(&format!("<title>{}</title>\n", escape(&spec.title)));
        html.push_str(
            "<style>\nbody { font-family: sans-serif; margin: 24px; background: #fafafa; }\n\
             .panel { background: #fff; border: 1px solid #ddd; border-radius: 6px; \
             padding: 16px; margin-bottom: 24px; }\n\
             .panel h2 { margin: 0 0 12px 0; font-size: 16px; }\n\
             .empty { color: #888; font-style: italic; }\n</style>\n</head>\n<body>\n",
        );
        html.push_str(&format!("<h1>{}</h1>\n", escape(&spec.title)));

        for (panel, series) in spec.panels.iter().zip(panel_series.iter()) {
            html.push_str("<div class=\"panel\">\n");
            html.push_str(&format!("<h2>{}</h2>\n", escape(&panel.title)));
            if series.iter().all(|s| s.points.is_empty()) {
                html.push_str("<p class=\"empty\">no data in window</p>\n");
            } else {
                match panel.chart {
                    ChartKind::Line | ChartKind::MultiLine => {
                        html.push_str(&render_lines(series))
                    }
                    ChartKind::Bar => html.push_str(&render_bars(series)),
                    ChartKind::Pie => html.push_str(&render_pie(series)),
                }
            }
            // Data blob for client-side rendering.
            let blob = serde_json::to_string(series).unwrap_or_else(|_| "[]".into());
            html.push_str(&format!(
                "<script type=\"application/json\" data-panel=\"{}\">{}</script>\n",
                escape(&panel.title),
                blob
            ));
            html.push_str("</div>\n");
        }
        html.push_str("</body>\n</html>\n");
        html
    }
}

const PALETTE: [&str; 6] = [
    "#2563eb", "#db2777", "#059669", "#d97706", "#7c3aed", "#475569",
];

fn bounds(series: &[Series]) -> (i64, i64, f64, f64) {
    let mut t_min = i64::MAX;
    let mut t_max = i64::MIN;
    let mut v_min = f64::INFINITY;
    let mut v_max = f64::NEG_INFINITY;
    for s in series {
        for (t, v) in &s.points {
            let ms = t.timestamp_millis();
            t_min = t_min.min(ms);
            t_max = t_max.max(ms);
            v_min = v_min.min(*v);
            v_max = v_max.max(*v);
        }
    }
    if t_min == t_max {
        t_max += 1;
    }
    if (v_max - v_min).abs() < f64::EPSILON {
        v_max = v_min + 1.0;
    }
    (t_min, t_max, v_min, v_max)
}

fn render_lines(series: &[Series]) -> String {
    let (t_min, t_max, v_min, v_max) = bounds(series);
    let x = |t: i64| PAD + (t - t_min) as f64 / (t_max - t_min) as f64 * (SVG_WIDTH - 2.0 * PAD);
    let y = |v: f64| SVG_HEIGHT - PAD - (v - v_min) / (v_max - v_min) * (SVG_HEIGHT - 2.0 * PAD);

    let mut svg = svg_open();
    svg.push_str(&axes(v_min, v_max));
    for (i, s) in series.iter().enumerate() {
        let color = PALETTE[i % PALETTE.len()];
        let points: Vec<String> = s
            .points
            .iter()
            .map(|(t, v)| format!("{:.1},{:.1}", x(t.timestamp_millis()), y(*v)))
            .collect();
        svg.push_str(&format!(
            "<polyline fill=\"none\" stroke=\"{}\" stroke-width=\"1.5\" points=\"{}\"/>\n",
            color,
            points.join(" ")
        ));
        svg.push_str(&format!(
            "<text x=\"{:.1}\" y=\"{:.1}\" font-size=\"10\" fill=\"{}\">{}</text>\n",
            SVG_WIDTH - PAD + 4.0,
            PAD + 12.0 * i as f64,
            color,
            escape(&s.label)
        ));
    }
    svg.push_str("</svg>\n");
    svg
}

fn render_bars(series: &[Series]) -> String {
    let points = &series[0].points;
    let (_, _, v_min, v_max) = bounds(series);
    let v_min = v_min.min(0.0);
    let n = points.len().max(1) as f64;
    let slot = (SVG_WIDTH - 2.0 * PAD) / n;
    let y = |v: f64| SVG_HEIGHT - PAD - (v - v_min) / (v_max - v_min) * (SVG_HEIGHT - 2.0 * PAD);

    let mut svg = svg_open();
    svg.push_str(&axes(v_min, v_max));
    for (i, (_, v)) in points.iter().enumerate() {
        let x0 = PAD + i as f64 * slot + slot * 0.1;
        let top = y(*v);
        svg.push_str(&format!(
            "<rect x=\"{:.1}\" y=\"{:.1}\" width=\"{:.1}\" height=\"{:.1}\" fill=\"{}\"/>\n",
            x0,
            top,
            slot * 0.8,
            (SVG_HEIGHT - PAD - top).max(0.0),
            PALETTE[0]
        ));
    }
    svg.push_str("</svg>\n");
    svg
}

fn render_pie(series: &[Series]) -> String {
    let points = &series[0].points;
    let total: f64 = points.iter().map(|(_, v)| v.max(0.0)).sum();
    let cx = SVG_WIDTH / 2.0;
    let cy = SVG_HEIGHT / 2.0;
    let r = (SVG_HEIGHT / 2.0) - PAD / 2.0;

    let mut svg = svg_open();
    if total <= 0.0 {
        svg.push_str("</svg>\n");
        return svg;
    }
    let mut angle = -std::f64::consts::FRAC_PI_2;
    for (i, (_, v)) in points.iter().enumerate() {
        let share = v.max(0.0) / total;
        if share <= 0.0 {
            continue;
        }
        let sweep = share * std::f64::consts::TAU;
        let (x0, y0) = (cx + r * angle.cos(), cy + r * angle.sin());
        let end = angle + sweep;
        let (x1, y1) = (cx + r * end.cos(), cy + r * end.sin());
        let large = if sweep > std::f64::consts::PI { 1 } else { 0 };
        svg.push_str(&format!(
            "<path d=\"M{:.1},{:.1} L{:.1},{:.1} A{:.1},{:.1} 0 {} 1 {:.1},{:.1} Z\" fill=\"{}\"/>\n",
            cx,
            cy,
            x0,
            y0,
            r,
            r,
            large,
            x1,
            y1,
            PALETTE[i % PALETTE.len()]
        ));
        angle = end;
    }
    svg.push_str("</svg>\n");
    svg
}

fn svg_open() -> String {
    format!(
        "<svg width=\"{}\" height=\"{}\" viewBox=\"0 0 {} {}\" xmlns=\"http://www.w3.org/2000/svg\">\n",
        SVG_WIDTH as u32, SVG_HEIGHT as u32, SVG_WIDTH as u32, SVG_HEIGHT as u32
    )
}

fn axes(v_min: f64, v_max: f64) -> String {
    format!(
        "<line x1=\"{pad}\" y1=\"{bottom}\" x2=\"{right}\" y2=\"{bottom}\" stroke=\"#999\"/>\n\
         <line x1=\"{pad}\" y1=\"{pad}\" x2=\"{pad}\" y2=\"{bottom}\" stroke=\"#999\"/>\n\
         <text x=\"4\" y=\"{pad}\" font-size=\"10\" fill=\"#666\">{vmax:.2}</text>\n\
         <text x=\"4\" y=\"{bottom}\" font-size=\"10\" fill=\"#666\">{vmin:.2}</text>\n",
        pad = PAD,
        bottom = SVG_HEIGHT - PAD,
        right = SVG_WIDTH - PAD,
        vmax = v_max,
        vmin = v_min,
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetricSample;
    use tempfile::TempDir;

    fn spec(chart: ChartKind) -> DashboardSpec {
        DashboardSpec {
            id: "overview".into(),
            title: "System Overview".into(),
            panels: vec![Panel {
                title: "CPU".into(),
                kind: MetricKind::System,
                filter: MetricFilter::source("host").with_name("cpu_percent"),
                window_secs: 3600,
                bucket_secs: 60,
                reducer: Reducer::Avg,
                chart,
            }],
        }
    }

    #[tokio::test]
    async fn renders_self_contained_html() {
        let dir = TempDir::new().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db")).unwrap();
        for v in [10.0, 40.0, 25.0] {
            store
                .append(MetricSample::new(MetricKind::System, "host", "cpu_percent", v))
                .await;
        }
        store.flush().await;

        let html = DashboardGenerator::generate(&store, &spec(ChartKind::Line)).unwrap();
        assert!(html.contains("<title>System Overview</title>"));
        assert!(html.contains("<svg"));
        assert!(html.contains("polyline"));
        assert!(html.contains("application/json"));
        // No external assets.
        assert!(!html.contains("http://"));
        assert!(!html.contains("https://"));
    }

    #[tokio::test]
    async fn deterministic_for_fixed_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db")).unwrap();
        let base = Utc::now();
        for i in 0..3 {
            store
                .append(
                    MetricSample::new(MetricKind::System, "host", "cpu_percent", i as f64)
                        .at(base + chrono::Duration::seconds(i)),
                )
                .await;
        }
        store.flush().await;

        let spec = spec(ChartKind::Bar);
        let first = DashboardGenerator::generate(&store, &spec).unwrap();
        let second = DashboardGenerator::generate(&store, &spec).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("<rect"));
    }

    #[tokio::test]
    async fn empty_window_renders_placeholder() {
        let dir = TempDir::new().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db")).unwrap();
        let html = DashboardGenerator::generate(&store, &spec(ChartKind::Pie)).unwrap();
        assert!(html.contains("no data in window"));
    }

    #[test]
    fn html_escaping() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
