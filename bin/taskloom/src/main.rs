mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "taskloom")]
#[command(about = "A composable task-resolution fabric", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and default configuration
    Onboard {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and data directory status
    Status,

    /// Start the monitoring daemon and HTTP API
    Serve {
        /// Port to listen on (overrides config apiPort)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config httpBind)
        #[arg(long)]
        host: Option<String>,
    },

    /// Inspect the persisted resolver registry
    Registry {
        #[command(subcommand)]
        command: commands::registry_cmd::RegistryCommands,
    },

    /// Inspect persisted mastery plans
    Masteries {
        #[command(subcommand)]
        command: commands::masteries_cmd::MasteriesCommands,
    },

    /// Manage alerts and alert rules
    Alerts {
        #[command(subcommand)]
        command: commands::alerts_cmd::AlertsCommands,
    },

    /// Query stored metrics
    Metrics {
        #[command(subcommand)]
        command: commands::metrics_cmd::MetricsCommands,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let result = match cli.command {
        Commands::Onboard { force } => commands::onboard::run(force),
        Commands::Status => commands::status::run(),
        Commands::Serve { port, host } => commands::serve::run(port, host).await,
        Commands::Registry { command } => commands::registry_cmd::run(command),
        Commands::Masteries { command } => commands::masteries_cmd::run(command).await,
        Commands::Alerts { command } => commands::alerts_cmd::run(command).await,
        Commands::Metrics { command } => commands::metrics_cmd::run(command).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
