use clap::Subcommand;

use taskloom_core::{Config, Paths, Result};
use taskloom_registry::PersistedEntry;

#[derive(Subcommand)]
pub enum RegistryCommands {
    /// List persisted resolver entries
    List,
    /// Show one persisted entry as JSON
    Show {
        /// Entry identity, `name@version`
        identity: String,
    },
}

pub fn run(command: RegistryCommands) -> Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let paths = Paths::from_config_dir(&config.data_dir);
    let dir = paths.registry_dir();

    match command {
        RegistryCommands::List => {
            let mut entries: Vec<PersistedEntry> = Vec::new();
            if dir.exists() {
                for entry in std::fs::read_dir(&dir)? {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    if let Ok(content) = std::fs::read_to_string(&path) {
                        if let Ok(parsed) = serde_json::from_str::<PersistedEntry>(&content) {
                            entries.push(parsed);
                        }
                    }
                }
            }
            entries.sort_by(|a, b| {
                a.metadata
                    .name
                    .cmp(&b.metadata.name)
                    .then(b.metadata.version.cmp(&a.metadata.version))
            });
            if entries.is_empty() {
                println!("No persisted resolvers under {}", dir.display());
                return Ok(());
            }
            for entry in entries {
                let marks = match (entry.degraded, entry.last_evolved_at.is_some()) {
                    (true, true) => " [degraded, evolved]",
                    (true, false) => " [degraded]",
                    (false, true) => " [evolved]",
                    (false, false) => "",
                };
                println!(
                    "{}@{}{}  depth={}  caps={}",
                    entry.metadata.name,
                    entry.metadata.version,
                    marks,
                    entry.metadata.depth,
                    entry
                        .metadata
                        .capabilities
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(",")
                );
            }
        }
        RegistryCommands::Show { identity } => {
            let path = dir.join(format!("{}.json", identity));
            let content = std::fs::read_to_string(&path).map_err(|_| {
                taskloom_core::Error::NotFound(format!("resolver {}", identity))
            })?;
            println!("{}", content);
        }
    }
    Ok(())
}
