use taskloom_core::{Config, Paths, Result};

pub fn run() -> Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let paths = Paths::from_config_dir(&config.data_dir);

    println!("taskloom status");
    println!("  data dir:   {}", paths.base.display());
    println!(
        "  config:     {}",
        if paths.config_file().exists() {
            "present"
        } else {
            "missing (defaults in effect)"
        }
    );
    println!("  api:        {}:{}", config.http_bind, config.api_port);

    let count_files = |dir: &std::path::Path| -> usize {
        std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    };
    println!("  resolvers:  {} persisted", count_files(&paths.registry_dir()));
    println!("  masteries:  {} persisted", count_files(&paths.masteries_dir()));
    println!(
        "  metrics db: {}",
        if paths.metrics_db().exists() {
            "present"
        } else {
            "not created yet"
        }
    );
    println!(
        "  retention:  {} days, history ring {}",
        config.metrics_retention_days, config.history_ring_size
    );
    println!(
        "  evolver:    window {}, threshold {}, min interval {}s",
        config.evolver.window_size, config.evolver.threshold_failures, config.evolver.min_interval_sec
    );
    Ok(())
}
