use clap::Subcommand;

use taskloom_core::{Config, Paths, Result};
use taskloom_monitoring::{AlertManager, MetricsStore};

#[derive(Subcommand)]
pub enum AlertsCommands {
    /// List open alerts
    Active,
    /// List every alert, including resolved ones
    History,
    /// List configured alert rules
    Rules,
    /// Acknowledge an alert
    Ack {
        alert_id: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Resolve an alert
    Resolve {
        alert_id: String,
        #[arg(long)]
        note: Option<String>,
    },
}

pub async fn run(command: AlertsCommands) -> Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let paths = Paths::from_config_dir(&config.data_dir);
    let store = MetricsStore::open(&paths.metrics_db())?;
    let manager = AlertManager::new(store);

    match command {
        AlertsCommands::Active => {
            let alerts = manager.active_alerts()?;
            if alerts.is_empty() {
                println!("No active alerts");
                return Ok(());
            }
            for alert in alerts {
                println!(
                    "{}  [{}] {}  ({}, opened {})",
                    alert.id,
                    alert.severity.as_str(),
                    alert.message,
                    alert.state.as_str(),
                    alert.opened_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        AlertsCommands::History => {
            for alert in manager.all_alerts()? {
                println!(
                    "{}  [{}] {}  ({})",
                    alert.id,
                    alert.severity.as_str(),
                    alert.message,
                    alert.state.as_str()
                );
            }
        }
        AlertsCommands::Rules => {
            let rules = manager.list_rules()?;
            if rules.is_empty() {
                println!("No alert rules configured");
                return Ok(());
            }
            for rule in rules {
                println!("{}", serde_json::to_string(&rule)?);
            }
        }
        AlertsCommands::Ack { alert_id, note } => {
            let alert = manager.acknowledge(&alert_id, note.as_deref())?;
            println!("Acknowledged {} ({})", alert.id, alert.state.as_str());
        }
        AlertsCommands::Resolve { alert_id, note } => {
            let alert = manager.resolve(&alert_id, note.as_deref())?;
            println!("Resolved {} ({})", alert.id, alert.state.as_str());
        }
    }
    Ok(())
}
