//! netflume-daemon entry point.
//!
//! Parses CLI arguments, loads and validates configuration, initializes
//! tracing, and hands control to the [`Orchestrator`].

use anyhow::Result;
use clap::Parser;

use netflume_core::config::NetflumeConfig;
use netflume_daemon::cli::DaemonCli;
use netflume_daemon::logging::init_tracing;
use netflume_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = NetflumeConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e))?;

    // CLI overrides take precedence over the config file.
    if let Some(log_level) = cli.log_level {
        config.general.log_level = log_level;
    }
    if let Some(log_format) = cli.log_format {
        config.general.log_format = log_format;
    }
    if let Some(pid_file) = cli.pid_file {
        config.general.pid_file = pid_file;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "netflume-daemon starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config)?;
    orchestrator.run().await?;

    tracing::info!("netflume-daemon shut down");
    Ok(())
}
