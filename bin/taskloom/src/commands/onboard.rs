use taskloom_core::{Config, Paths, Result};
use tracing::info;

pub fn run(force: bool) -> Result<()> {
    let paths = Paths::new();
    let config_path = paths.config_file();

    if config_path.exists() && !force {
        println!(
            "Configuration already exists at {} (use --force to overwrite)",
            config_path.display()
        );
        return Ok(());
    }

    paths.ensure_dirs()?;
    let config = Config::default();
    config.save(&config_path)?;

    info!(path = %config_path.display(), "Configuration written");
    println!("Initialized taskloom data directory at {}", paths.base.display());
    println!("  config:     {}", config_path.display());
    println!("  registry:   {}", paths.registry_dir().display());
    println!("  masteries:  {}", paths.masteries_dir().display());
    println!("  metrics:    {}", paths.metrics_db().display());
    println!("  history:    {}", paths.history_file().display());
    println!("  dashboards: {}", paths.dashboards_dir().display());
    println!("  evolver:    {}", paths.evolver_dir().display());
    Ok(())
}
