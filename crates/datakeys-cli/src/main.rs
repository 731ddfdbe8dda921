mod cli;
mod config;
mod keys;
mod storage;

use crate::cli::ConfigCommand;
use clap::Parser;
use color_eyre::Result;
use datakeys_core::{DataKey, DataKeyStore};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PROBE_KEY: &str = "datakeys/health-probe";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        cli::Command::Version => print_version(),
        cli::Command::Health => run_health_check(&config).await?,
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
        cli::Command::Key(cmd) => keys::handle(cmd, &config).await?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so command output such as `key list --json` stays parseable.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("datakeys {}", env!("CARGO_PKG_VERSION"));
}

/// Runs a quick round trip against the configured database.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let store = storage::store_from_config(config)?;
    run_store_health(&store, config.operation_timeout()).await?;
    println!("Storage: ok");
    Ok(())
}

async fn run_store_health<S: DataKeyStore>(store: &S, limit: Duration) -> Result<()> {
    let payload = b"ok".to_vec();
    // A probe left behind by an interrupted run would otherwise conflict.
    keys::bounded(limit, store.delete(PROBE_KEY)).await?;
    keys::bounded(
        limit,
        store.create(DataKey::new(PROBE_KEY, "health", payload.clone()), None),
    )
    .await?;
    let round_trip = keys::bounded(limit, store.get_by_name(PROBE_KEY)).await?;
    keys::bounded(limit, store.delete(PROBE_KEY)).await?;

    if round_trip.encrypted_data != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(&config.resolved()?)?;
    info!(path = %path.display(), "config initialized");
    println!("Config initialized at {}", path.display());
    Ok(())
}
