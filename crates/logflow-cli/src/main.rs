//! logflow CLI - run the produce/consume engine against a log broker.

use anyhow::Result;
use clap::{Parser, Subcommand};
use logflow_core::config::LogFormat;
use logflow_core::{Config, ErrorKind};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Broker connection or login failed
    ConnectionError = 2,
    /// Stream or topic lookup/creation failed
    ProvisioningError = 3,
    /// The produce loop stopped on a failure
    ProduceError = 4,
    /// The consume loop stopped on a failure
    ConsumeError = 5,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code by its engine error kind.
    fn from_error(error: &anyhow::Error) -> Self {
        let kind = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<logflow_core::Error>())
            .map(|e| e.kind());

        match kind {
            Some(ErrorKind::Config | ErrorKind::Serialization) => ExitCode::ConfigError,
            Some(ErrorKind::Connection | ErrorKind::Auth) => ExitCode::ConnectionError,
            Some(ErrorKind::ResourceLookup | ErrorKind::ResourceCreate) => {
                ExitCode::ProvisioningError
            }
            Some(ErrorKind::Dispatch | ErrorKind::InvalidBatch) => ExitCode::ProduceError,
            Some(ErrorKind::Poll | ErrorKind::Handler) => ExitCode::ConsumeError,
            Some(ErrorKind::Io | ErrorKind::Shutdown) | None => ExitCode::RuntimeError,
        }
    }
}

mod commands;

#[derive(Parser)]
#[command(name = "logflow")]
#[command(about = "Produce and consume messages on a partitioned log broker", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision resources, then run the produce and consume loops
    Run {
        /// Stop the producer after this many batches
        #[arg(long)]
        batches: Option<u64>,

        /// Stop the consumer after this many poll cycles
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings come from the config when it parses, else defaults
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| Config::from_file(path).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_str()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { batches, cycles } => {
            commands::run::run(config, batches, cycles).await?;
        }
        Commands::Validate => {
            commands::validate::run(&config)?;
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));
    Ok(Config::from_file(&path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_engine_error() {
        let error = anyhow::Error::new(logflow_core::Error::Connection("refused".into()));
        assert!(matches!(
            ExitCode::from_error(&error),
            ExitCode::ConnectionError
        ));

        let error = anyhow::Error::new(logflow_core::Error::Poll("timeout".into()))
            .context("consume loop stopped");
        assert!(matches!(ExitCode::from_error(&error), ExitCode::ConsumeError));
    }

    #[test]
    fn test_exit_code_for_foreign_error() {
        let error = anyhow::anyhow!("something else");
        assert!(matches!(ExitCode::from_error(&error), ExitCode::RuntimeError));
    }

    #[test]
    fn test_cli_parses_run_limits() {
        let cli = Cli::parse_from(["logflow", "-c", "app.toml", "run", "--batches", "3"]);
        assert_eq!(cli.config, Some(PathBuf::from("app.toml")));
        match cli.command {
            Commands::Run { batches, cycles } => {
                assert_eq!(batches, Some(3));
                assert_eq!(cycles, None);
            }
            Commands::Validate => panic!("expected run"),
        }
    }
}
