//! CLI argument definitions for netflume-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Netflume packet-capture to NetFlow v5 export daemon.
///
/// Captures traffic on the configured interfaces, aggregates packets
/// into bidirectional flows and emits NetFlow v5 datagrams to the
/// configured collector.
#[derive(Parser, Debug)]
#[command(name = "netflume-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to netflume.toml configuration file.
    #[arg(short, long, default_value = "/etc/netflume/netflume.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,
}
