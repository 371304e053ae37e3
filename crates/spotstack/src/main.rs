mod commands;

use clap::{Parser, Subcommand};
use spotstack_cloud::StateStore;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spotstack")]
#[command(about = "Inspect spot-backed application stacks", long_about = None)]
struct Cli {
    /// State directory (overrides settings file and SPOTSTACK_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recorded stacks
    List,
    /// Show one stack in detail
    Status {
        /// Stack id
        stack: String,
        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the rollback history of a stack
    History {
        /// Stack id
        stack: String,
        /// Show at most N entries, newest first
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Print the effective settings as YAML
    Settings,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Version needs no settings
    if matches!(cli.command, Commands::Version) {
        println!("spotstack {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut loaded = spotstack_config::load_settings()?;
    if let Some(dir) = cli.state_dir {
        loaded.settings.state_dir = dir;
    }
    tracing::debug!(
        source = %loaded.origin(),
        state_dir = %loaded.settings.state_dir.display(),
        "Settings loaded"
    );

    let store = StateStore::new(&loaded.settings.state_dir);
    match cli.command {
        Commands::List => commands::list::handle(&store).await,
        Commands::Status { stack, json } => commands::status::handle(&store, &stack, json).await,
        Commands::History { stack, limit } => commands::history::handle(&store, &stack, limit).await,
        Commands::Settings => commands::settings::handle(&loaded),
        Commands::Version => Ok(()),
    }
}
