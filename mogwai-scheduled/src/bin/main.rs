//! mogwai-scheduled entry point

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mogwai_scheduled::{Config, Daemon};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Download scheduler daemon
#[derive(Debug, Parser)]
#[command(name = "mogwai-scheduled", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding tariff files referenced by the configuration
    #[arg(long, default_value = "/etc/mogwai-scheduled/tariffs")]
    tariff_dir: PathBuf,

    /// Log filter (tracing env-filter syntax)
    #[arg(long, env = "MOGWAI_LOG", default_value = "info")]
    log_filter: String,

    /// Override the maximum number of schedule entries
    #[arg(long)]
    max_entries: Option<usize>,

    /// Override the maximum number of concurrently active entries
    #[arg(long)]
    max_active_entries: Option<usize>,

    /// Exit after this many seconds without entries; 0 disables
    #[arg(long)]
    inactivity_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_filter))
        .init();

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(max_entries) = args.max_entries {
        config.scheduler.max_entries = max_entries;
    }
    if let Some(max_active_entries) = args.max_active_entries {
        config.scheduler.max_active_entries = max_active_entries;
    }
    if let Some(inactivity_timeout) = args.inactivity_timeout {
        config.scheduler.inactivity_timeout_secs = inactivity_timeout;
    }
    config.validate().context("validating configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "mogwai-scheduled starting");
    let daemon = Daemon::new(&config, &args.tariff_dir).context("assembling daemon")?;
    daemon.run().await
}
