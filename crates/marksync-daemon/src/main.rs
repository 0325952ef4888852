//! marksync Daemon - Background bookmark synchronization service
//!
//! Keeps a local bookmark directory in sync with a cloud container
//! directory until SIGTERM or SIGINT.
//!
//! # Signals
//!
//! - SIGINT / SIGTERM: stop synchronization and exit
//! - SIGUSR1: the application went to the background, pause
//! - SIGUSR2: the application came back to the foreground, resume
//!
//! Cloud availability is re-checked on a fixed interval so that a session
//! stopped because the container disappeared restarts on its own.

mod bookmarks;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use marksync_core::config::{Config, LoggingConfig};
use marksync_sync::manager::{ManagerOptions, SynchronizationManager};
use marksync_ubiquity::DirectoryContainer;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bookmarks::LoggingBookmarkModel;
use crate::settings::FileSettingsStore;

#[derive(Debug, Parser)]
#[command(name = "marksyncd", version, about = "Bookmark synchronization daemon")]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable cloud synchronization before starting
    #[arg(long, conflicts_with = "disable")]
    enable: bool,

    /// Disable cloud synchronization before starting
    #[arg(long)]
    disable: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Requested change of the enabled setting, if any
    fn requested_sync_setting(&self) -> Option<bool> {
        match (self.enable, self.disable) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

// ============================================================================
// Tracing
// ============================================================================

fn filter_directive(logging: &LoggingConfig, verbose: u8) -> &str {
    match verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(logging, verbose)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// DaemonService
// ============================================================================

/// Wires the configuration, adapters and manager together
struct DaemonService {
    config: Config,
    manager: Arc<SynchronizationManager>,
    bookmark_model: Arc<LoggingBookmarkModel>,
    shutdown: CancellationToken,
}

impl DaemonService {
    fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let settings = Arc::new(
            FileSettingsStore::open(&config.settings_file).context("Failed to open settings")?,
        );
        let container = Arc::new(DirectoryContainer::new(config.sync.container_root.clone()));
        let bookmark_model = Arc::new(LoggingBookmarkModel::new());

        let options = ManagerOptions::from_config(&config.sync);
        info!(
            local_dir = %options.local_directory.display(),
            container_root = %config.sync.container_root.display(),
            extension = %options.file_extension,
            device = %options.device_name,
            "Configured synchronization"
        );
        let manager = SynchronizationManager::new(
            options,
            container,
            settings,
            bookmark_model.clone(),
        );

        Ok(Self {
            config,
            manager,
            bookmark_model,
            shutdown,
        })
    }

    /// Runs until the shutdown token fires
    async fn run(&self, requested_sync_setting: Option<bool>) -> Result<()> {
        let observer = Arc::new(());
        self.manager.add_observer(&observer, |state| match &state.error {
            Some(e) if e.is_fatal() => {
                error!(error = %e, "Synchronization disabled after a fatal error")
            }
            Some(e) => warn!(
                is_available = state.is_available,
                is_on = state.is_on,
                error = %e,
                "Synchronization state"
            ),
            None => info!(
                is_available = state.is_available,
                is_on = state.is_on,
                "Synchronization state"
            ),
        });

        if let Some(enabled) = requested_sync_setting {
            self.manager.set_sync_enabled(enabled).await?;
        }
        let listener = self
            .manager
            .spawn_settings_listener(self.shutdown.child_token());
        if let Err(e) = self.manager.start().await {
            warn!(error = %e, "Synchronization not started");
        }

        let mut availability = tokio::time::interval(Duration::from_secs(
            self.config.sync.availability_check_interval_secs.max(1),
        ));
        // The first tick completes immediately
        availability.tick().await;

        let mut background =
            signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
        let mut foreground =
            signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = availability.tick() => self.manager.refresh_availability().await,
                Some(()) = background.recv() => {
                    info!("Received SIGUSR1, pausing");
                    self.manager.pause().await;
                }
                Some(()) = foreground.recv() => {
                    info!("Received SIGUSR2, resuming");
                    if let Err(e) = self.manager.resume().await {
                        warn!(error = %e, "Failed to resume synchronization");
                    }
                }
            }
        }

        self.manager.stop().await;
        if let Err(e) = listener.await {
            warn!(error = %e, "Settings listener ended abnormally");
        }
        self.manager.remove_observer(&observer);
        info!(
            reloads = self.bookmark_model.reloads(),
            deletes = self.bookmark_model.deletes(),
            "Synchronization summary"
        );
        Ok(())
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }

    token.cancel();
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("Invalid configuration: {}", details.join("; "));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let requested_sync_setting = cli.requested_sync_setting();
    let config = load_config(cli.config.clone())?;
    init_tracing(&config.logging, cli.verbose);

    info!("marksync daemon starting (marksyncd)");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token)?;
    let result = service.run(requested_sync_setting).await;

    match &result {
        Ok(()) => info!("marksync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "marksync daemon exiting with error"),
    }
    result
}

#[cfg(test)]
mod tests {
    use marksync_core::config::ConfigBuilder;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["marksyncd"]).unwrap();
        assert!(cli.config.is_none());
        assert_eq!(cli.requested_sync_setting(), None);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_enable_and_disable_conflict() {
        assert!(Cli::try_parse_from(["marksyncd", "--enable", "--disable"]).is_err());

        let cli = Cli::try_parse_from(["marksyncd", "--disable", "-vv"]).unwrap();
        assert_eq!(cli.requested_sync_setting(), Some(false));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_filter_directive_follows_verbosity() {
        let logging = LoggingConfig::default();
        assert_eq!(filter_directive(&logging, 0), logging.level);
        assert_eq!(filter_directive(&logging, 1), "debug");
        assert_eq!(filter_directive(&logging, 3), "trace");
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "logging:\n  level: loud\n").unwrap();

        let err = load_config(Some(path)).unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_load_config_missing_explicit_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(dir.path().join("missing.yaml"))).is_err());
    }

    #[tokio::test]
    async fn test_service_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let container_root = dir.path().join("container");
        std::fs::create_dir_all(container_root.join("Documents")).unwrap();
        let config = ConfigBuilder::new()
            .local_dir(dir.path().join("local"))
            .container_root(container_root)
            .device_name("test")
            .settings_file(dir.path().join("settings.json"))
            .build();

        let shutdown = CancellationToken::new();
        let service = DaemonService::new(config, shutdown.clone()).unwrap();
        shutdown.cancel();
        service.run(Some(true)).await.unwrap();

        assert!(!service.manager.state().is_on);
        let settings = FileSettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert!(settings.snapshot().cloud_sync_enabled);
    }
}
