use clap::Subcommand;

use taskloom_core::{Config, Paths, Result};
use taskloom_mastery::MasteryRegistry;

#[derive(Subcommand)]
pub enum MasteriesCommands {
    /// List persisted mastery plans
    List,
    /// Show one plan as JSON
    Show {
        /// Plan name (latest version) or `name@version`
        name: String,
    },
}

pub async fn run(command: MasteriesCommands) -> Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let paths = Paths::from_config_dir(&config.data_dir);

    let registry = MasteryRegistry::new().with_persist_dir(paths.masteries_dir());
    registry.load_persisted().await?;

    match command {
        MasteriesCommands::List => {
            let names = registry.names().await;
            if names.is_empty() {
                println!("No persisted masteries under {}", paths.masteries_dir().display());
                return Ok(());
            }
            for name in names {
                let versions = registry.versions(&name).await;
                let latest = registry.get(&name, None).await?;
                println!(
                    "{}  versions={}  steps={}  {}",
                    name,
                    versions
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                    latest.plan.steps.len(),
                    latest.plan.description
                );
            }
        }
        MasteriesCommands::Show { name } => {
            let (name, version) = match name.split_once('@') {
                Some((n, v)) => (n.to_string(), Some(v.parse()?)),
                None => (name, None),
            };
            let entry = registry.get(&name, version.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&entry.plan)?);
        }
    }
    Ok(())
}
