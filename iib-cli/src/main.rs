//! iib - builds and merges operator index images
//!
//! Every subcommand runs one build request in its own working directory and
//! hands the resulting build context to `--output`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use iib_core::ocp_version::is_compatible;
use iib_core::WorkerConfig;

mod build_cli;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "iib",
    about = "Build, update and merge operator index images",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Set log level
    #[clap(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Worker configuration file (defaults to $IIB_WORKER_CONFIG)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[clap(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a bundle's platform-version expression against a target version
    CheckVersion {
        /// Value of the bundle's com.redhat.openshift.versions label
        #[clap(long, default_value = "")]
        expression: String,

        /// Platform version of the index, e.g. v4.15
        #[clap(long)]
        target: String,

        /// Treat a missing expression as compatible
        #[clap(long)]
        allow_empty: bool,
    },

    /// Print the effective worker configuration
    Config,

    #[command(flatten)]
    Build(build_cli::BuildCommand),
}

fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr) // Critical: logs to stderr, not stdout
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr) // Critical: logs to stderr, not stdout
            .init();
    }
}

#[derive(Tabled)]
struct VersionRow {
    #[tabled(rename = "Expression")]
    expression: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Compatible")]
    compatible: bool,
}

fn check_version_command(expression: String, target: String, allow_empty: bool) -> Result<()> {
    let compatible = is_compatible(&expression, &target, allow_empty)?;
    let rows = vec![VersionRow {
        expression,
        target,
        compatible,
    }];
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string();
    println!("{table}");

    if !compatible {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, cli.json_logs);

    let config = WorkerConfig::load(cli.config.as_deref()).context("Failed to load worker config")?;

    match cli.command {
        Command::CheckVersion {
            expression,
            target,
            allow_empty,
        } => check_version_command(expression, target, allow_empty),
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Build(command) => {
            info!("Running {}", command.name());
            command.execute(config).await
        }
    }
}
