mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fei_sync::{SyncSettings, SyncTarget};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fei-sync")]
#[command(version, about = "Offline cache sync for FEI forms", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = fei_sync::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "fei_sync=info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull fresh data from the server into the local cache
    Sync {
        /// What to sync: all, outbound, profile, relations, fei-buckets or a collection name
        #[arg(default_value = "all")]
        target: SyncTarget,

        /// Also refresh the open and closed form buckets
        #[arg(short, long)]
        refresh: bool,
    },

    /// Show what the local cache holds
    Status,

    /// Push queued local writes to the server
    Push,

    /// Probe the server periodically and sync whenever connectivity comes back
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let mut settings = SyncSettings::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    apply_env_overrides(&mut settings);

    match cli.command {
        Commands::Sync { target, refresh } => commands::sync::execute(&settings, target, refresh).await?,
        Commands::Status => commands::status::execute(&settings).await?,
        Commands::Push => commands::push::execute(&settings).await?,
        Commands::Watch => commands::watch::execute(&settings).await?,
    }

    Ok(())
}

fn apply_env_overrides(settings: &mut SyncSettings) {
    if let Ok(key) = std::env::var("FEI_SYNC_API_KEY") {
        settings.api.api_key = Some(key);
    }
    if let Ok(url) = std::env::var("FEI_SYNC_BASE_URL") {
        settings.api.base_url = url;
    }
}
