use chrono::Utc;
use clap::Subcommand;
use std::time::Duration;

use taskloom_core::{Config, Error, Paths, Result};
use taskloom_monitoring::{MetricFilter, MetricKind, MetricsStore, Reducer, TimeWindow};

#[derive(Subcommand)]
pub enum MetricsCommands {
    /// Query raw samples
    Query {
        /// system, health or performance
        kind: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Look-back window in seconds (default: 1 hour)
        #[arg(long, default_value_t = 3600)]
        window_secs: u64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Aggregate a metric over buckets
    Aggregate {
        kind: String,
        /// count, sum, avg, min, max, p50, p95 or p99
        reducer: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 3600)]
        window_secs: u64,
        #[arg(long, default_value_t = 60)]
        bucket_secs: u64,
    },
    /// Remove samples older than the retention cutoff
    Compact {
        /// Days to keep (defaults to the configured retention)
        #[arg(long)]
        days: Option<u32>,
    },
}

fn parse_kind(raw: &str) -> Result<MetricKind> {
    match raw {
        "system" => Ok(MetricKind::System),
        "health" => Ok(MetricKind::Health),
        "performance" => Ok(MetricKind::Performance),
        other => Err(Error::Validation(format!("unknown metric kind '{}'", other))),
    }
}

fn parse_reducer(raw: &str) -> Result<Reducer> {
    match raw {
        "count" => Ok(Reducer::Count),
        "sum" => Ok(Reducer::Sum),
        "avg" => Ok(Reducer::Avg),
        "min" => Ok(Reducer::Min),
        "max" => Ok(Reducer::Max),
        "p50" => Ok(Reducer::P50),
        "p95" => Ok(Reducer::P95),
        "p99" => Ok(Reducer::P99),
        other => Err(Error::Validation(format!("unknown reducer '{}'", other))),
    }
}

pub async fn run(command: MetricsCommands) -> Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let paths = Paths::from_config_dir(&config.data_dir);
    let store = MetricsStore::open(&paths.metrics_db())?;

    match command {
        MetricsCommands::Query {
            kind,
            source,
            name,
            window_secs,
            limit,
        } => {
            let kind = parse_kind(&kind)?;
            let filter = MetricFilter {
                source,
                name,
                tags: Default::default(),
            };
            let window = TimeWindow::last(Duration::from_secs(window_secs));
            let samples = store.query(kind, &filter, &window, Some(limit))?;
            for sample in samples {
                println!(
                    "{}  {}/{}  {}",
                    sample
                        .timestamp
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                        .unwrap_or_default(),
                    sample.source,
                    sample.name,
                    sample.value
                );
            }
        }
        MetricsCommands::Aggregate {
            kind,
            reducer,
            source,
            name,
            window_secs,
            bucket_secs,
        } => {
            let kind = parse_kind(&kind)?;
            let reducer = parse_reducer(&reducer)?;
            let filter = MetricFilter {
                source,
                name,
                tags: Default::default(),
            };
            let window = TimeWindow::last(Duration::from_secs(window_secs));
            let buckets = store.aggregate(
                kind,
                &filter,
                &window,
                Duration::from_secs(bucket_secs),
                reducer,
            )?;
            for (start, value) in buckets {
                println!("{}  {}", start.format("%Y-%m-%d %H:%M:%S"), value);
            }
        }
        MetricsCommands::Compact { days } => {
            let days = days.unwrap_or(config.metrics_retention_days);
            let cutoff = Utc::now() - chrono::Duration::days(days as i64);
            let removed = store.compact(cutoff)?;
            println!("Removed {} samples older than {} days", removed, days);
        }
    }
    Ok(())
}
