//! Pipeline orchestration -- assembly, channel wiring, and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `netflume-daemon`.
//! It loads configuration, creates the inter-stage channels, builds the
//! pipeline stages, manages startup/shutdown ordering, and waits for
//! shutdown signals.
//!
//! # Pipeline
//!
//! ```text
//! [capture:eth0..N] --mpsc--> [flow-cache] --mpsc--> [exporter] --UDP--> collector
//! ```
//!
//! Both channels are bounded at `cache.max_flows`. The export channel is
//! sized to the full cache capacity so a cache purge can never deadlock
//! behind a slow exporter.
//!
//! # Startup Order (consumers before producers)
//!
//! 1. Exporter (consumes evicted flows)
//! 2. Flow cache (consumes captured packets, produces evicted flows)
//! 3. Capture engines (produce packet flows)
//!
//! A failed capture start is fatal: already-started stages are rolled
//! back and daemon startup fails.
//!
//! # Shutdown Order (producers first)
//!
//! 1. Capture engines (stop producing)
//! 2. Flow cache (purge remaining entries through the exporter)
//! 3. Exporter (flush the partial datagram, close the socket)

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;

use netflume_capture::{CaptureConfig, CaptureEngine};
use netflume_core::config::NetflumeConfig;
use netflume_core::pipeline::Pipeline;
use netflume_export::{ExportConfig, Netflow5Exporter};
use netflume_flow_cache::{FlowCache, FlowCacheConfig};

use crate::health::{DaemonHealth, ModuleHealth, aggregate_status};

/// The main daemon orchestrator.
///
/// Owns the three pipeline stages and manages their complete lifecycle:
/// configuration loading, channel wiring, ordered startup, health
/// reporting, and graceful shutdown.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: NetflumeConfig,
    /// NetFlow v5 exporter stage.
    exporter: Netflow5Exporter,
    /// Flow aggregation cache stage.
    cache: FlowCache,
    /// One capture engine per configured interface.
    captures: Vec<CaptureEngine>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator {
    /// Load configuration from disk and build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read or parsed
    /// - Configuration validation fails
    /// - Any stage fails to initialize (e.g. unknown capture interface)
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = NetflumeConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config)
    }

    /// Build from an already-loaded configuration.
    ///
    /// Useful for testing or when config has already been loaded.
    pub fn build_from_config(config: NetflumeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        tracing::debug!("creating inter-stage channels");
        let channel_capacity = config.cache.max_flows as usize;
        let (flow_tx, flow_rx) = mpsc::channel(channel_capacity);
        let (export_tx, export_rx) = mpsc::channel(channel_capacity);

        tracing::info!("initializing NetFlow v5 exporter");
        let exporter = Netflow5Exporter::builder()
            .config(ExportConfig::from_core(&config.exporter))
            .input_receiver(export_rx)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build exporter: {}", e))?;

        tracing::info!("initializing flow cache");
        let cache = FlowCache::builder()
            .config(FlowCacheConfig::from_core(&config.cache))
            .input_receiver(flow_rx)
            .export_sender(export_tx)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build flow cache: {}", e))?;

        let mut captures = Vec::with_capacity(config.interfaces.len());
        for (name, iface) in &config.interfaces {
            tracing::info!(interface = %name, "initializing capture engine");
            let engine = CaptureEngine::builder()
                .config(CaptureConfig::from_core(name, iface))
                .flow_sender(flow_tx.clone())
                .build()
                .map_err(|e| {
                    anyhow::anyhow!("failed to build capture engine for '{}': {}", name, e)
                })?;
            captures.push(engine);
        }
        // The capture engines hold the only senders; dropping this clone
        // lets the cache listener observe channel closure once they stop.
        drop(flow_tx);

        if captures.is_empty() {
            tracing::warn!("no capture interfaces configured, daemon will idle");
        }

        tracing::info!(
            interfaces = captures.len(),
            "orchestrator initialized"
        );

        Ok(Self {
            config,
            exporter,
            cache,
            captures,
            start_time: Instant::now(),
        })
    }

    /// Start all stages and block until a shutdown signal is received.
    ///
    /// # Shutdown Triggers
    ///
    /// - `SIGTERM` (from systemd, Docker, or `kill`)
    /// - `SIGINT` (Ctrl+C)
    pub async fn run(&mut self) -> Result<()> {
        // Write PID file if configured
        if !self.config.general.pid_file.is_empty() {
            let path = Path::new(&self.config.general.pid_file).to_path_buf();
            write_pid_file(&path)?;
        }

        if let Err(e) = self.start_all().await {
            if !self.config.general.pid_file.is_empty() {
                remove_pid_file(Path::new(&self.config.general.pid_file));
            }
            return Err(e);
        }

        tracing::info!("entering main event loop");
        let signal = wait_for_shutdown_signal().await?;
        tracing::info!(signal = signal, "shutdown signal received");

        self.shutdown().await;

        if !self.config.general.pid_file.is_empty() {
            remove_pid_file(Path::new(&self.config.general.pid_file));
        }

        Ok(())
    }

    /// Start stages in consumer-first order with rollback on failure.
    pub async fn start_all(&mut self) -> Result<()> {
        tracing::info!("starting all pipeline stages");

        self.exporter
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start exporter: {}", e))?;

        if let Err(e) = self.cache.start().await {
            tracing::warn!("cache startup failed, rolling back exporter");
            if let Err(stop_err) = self.exporter.stop().await {
                tracing::error!(error = %stop_err, "exporter rollback also failed");
            }
            return Err(anyhow::anyhow!("failed to start flow cache: {}", e));
        }

        for index in 0..self.captures.len() {
            if let Err(e) = self.captures[index].start().await {
                let interface = self.captures[index].interface().to_owned();
                tracing::warn!(
                    interface = %interface,
                    "capture startup failed, rolling back already-started stages"
                );
                for started in self.captures[..index].iter_mut() {
                    if let Err(stop_err) = started.stop().await {
                        tracing::error!(
                            interface = %started.interface(),
                            error = %stop_err,
                            "capture rollback failed"
                        );
                    }
                }
                if let Err(stop_err) = self.cache.stop().await {
                    tracing::error!(error = %stop_err, "cache rollback failed");
                }
                if let Err(stop_err) = self.exporter.stop().await {
                    tracing::error!(error = %stop_err, "exporter rollback failed");
                }
                return Err(anyhow::anyhow!(
                    "failed to start capture on '{}': {}",
                    interface,
                    e
                ));
            }
        }

        tracing::info!("all pipeline stages started");
        Ok(())
    }

    /// Perform graceful shutdown, producers first.
    ///
    /// Stop errors are logged but do not abort the remaining stages.
    pub async fn shutdown(&mut self) {
        tracing::info!("stopping all pipeline stages");

        for capture in &mut self.captures {
            if let Err(e) = capture.stop().await {
                tracing::error!(
                    interface = %capture.interface(),
                    error = %e,
                    "failed to stop capture engine"
                );
            }
        }
        if let Err(e) = self.cache.stop().await {
            tracing::error!(error = %e, "failed to stop flow cache");
        }
        if let Err(e) = self.exporter.stop().await {
            tracing::error!(error = %e, "failed to stop exporter");
        }

        tracing::info!("all pipeline stages stopped");
    }

    /// Get the current aggregated health status.
    pub async fn health(&self) -> DaemonHealth {
        let mut modules = Vec::with_capacity(self.captures.len() + 2);
        modules.push(ModuleHealth {
            name: "exporter".to_owned(),
            status: self.exporter.health_check().await,
        });
        modules.push(ModuleHealth {
            name: "flow-cache".to_owned(),
            status: self.cache.health_check().await,
        });
        for capture in &self.captures {
            modules.push(ModuleHealth {
                name: format!("capture:{}", capture.interface()),
                status: capture.health_check().await,
            });
        }

        DaemonHealth {
            status: aggregate_status(&modules),
            uptime_secs: self.start_time.elapsed().as_secs(),
            modules,
        }
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &NetflumeConfig {
        &self.config
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
///
/// # Errors
///
/// Returns an error if signal handlers cannot be installed.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Write the current process PID to a file.
///
/// Used to prevent duplicate daemon instances.
///
/// # Security
///
/// - Uses `create_new(true)` to atomically create file (prevents TOCTOU races)
/// - Verifies the created file is a regular file (prevents symlink attacks)
/// - Creates parent directory with restrictive permissions (0o700)
///
/// # Errors
///
/// Returns an error if the PID file cannot be written.
fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700).recursive(true);
            builder.create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if !metadata.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file (possible symlink attack)",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        file.set_permissions(permissions)?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on daemon shutdown.
///
/// Logs a warning but does not fail if the file cannot be removed.
fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to remove PID file"
        );
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}
