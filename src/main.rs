use anyhow::Context;
use clap::Parser;
use hawk::ai::{create_backend, RcaBackend};
use hawk::config::Config;
use hawk::error::ConfigError;
use hawk::run_monitor;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Command-line arguments for the Home Assistant problem monitor
#[derive(Parser)]
#[command(
    name = "hawk",
    about = "Home Assistant problem monitor - detects, deduplicates and diagnoses failures",
    long_about = "Watches the Home Assistant event bus for error logs, failed automations and \
                  unavailable entities, groups correlated events, recognises recurring problems \
                  and asks an LLM backend for a root-cause analysis of new ones."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Stop after this many triggering events
    #[arg(
        long,
        value_name = "N",
        help = "Stop after N triggering events (0 only checks connectivity)"
    )]
    max_events: Option<u64>,

    /// Connectivity check
    #[arg(
        long,
        conflicts_with = "max_events",
        help = "Connect, authenticate and subscribe, then exit"
    )]
    check: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Convert config path to string safely, handling non-UTF-8 paths
    fn config_path_str(&self) -> Result<Option<&str>, String> {
        match &self.config {
            Some(path) => match path.to_str() {
                Some(path_str) => Ok(Some(path_str)),
                None => Err(format!(
                    "Configuration file path contains invalid UTF-8 characters: {}",
                    path.display()
                )),
            },
            None => Ok(None),
        }
    }

    /// Event cap requested on the command line, if any
    fn event_cap(&self) -> Option<u64> {
        if self.check {
            Some(0)
        } else {
            self.max_events
        }
    }
}

/// Load configuration from file or use defaults
///
/// A missing or invalid file is reported and replaced by the defaults.
fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            match Config::from_file(std::path::Path::new(path)) {
                Ok(config) => Ok(config),
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Configuration file '{}' not found or unreadable, using defaults",
                        path
                    );
                    Ok(Config::default())
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path, e);
                    warn!("Using default configuration due to invalid config file");
                    Ok(Config::default())
                }
            }
        }
        None => {
            info!("Using default configuration");
            Ok(Config::default())
        }
    }
}

/// Resolve the effective configuration and backend
fn prepare(cli: &Cli) -> anyhow::Result<(Config, Arc<dyn RcaBackend>)> {
    cli.validate().map_err(anyhow::Error::msg).context("Invalid arguments")?;
    let config_path = cli
        .config_path_str()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration path")?;

    let mut config = load_config(config_path).context("Failed to load configuration")?;
    config
        .apply_env()
        .context("Invalid environment override")?;
    if let Some(cap) = cli.event_cap() {
        config.connection.max_events = Some(cap);
    }
    config.validate().context("Invalid configuration")?;

    let backend =
        create_backend(&config.analysis.backend).context("Failed to initialize RCA backend")?;
    Ok((config, backend))
}

#[tokio::main]
async fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting Home Assistant problem monitor");

    let (config, backend) = match prepare(&cli) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    // Set up signal handling for graceful shutdown
    let (stop_sender, stop_receiver) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        if stop_sender.send(true).is_err() {
            error!("Failed to send shutdown signal: pipeline already stopped");
        }
    }) {
        error!("Error setting SIGINT handler for graceful shutdown: {}", e);
        std::process::exit(1);
    }

    info!("Problem monitor is running. Press Ctrl+C to stop.");

    match run_monitor(&config, backend, stop_receiver).await {
        Ok(snapshot) => info!(
            "Problem monitor shutdown complete ({} batches, {} new problems)",
            snapshot.batches_processed, snapshot.new_problems
        ),
        Err(e) => {
            error!("Problem monitor failed: {}", e);
            std::process::exit(1);
        }
    }
}
