// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # EA Licensing CLI
//!
//! The `ea-licensing` binary hosts the license administration back end.
//!
//! ## Commands
//!
//! - `ea-licensing serve` - HTTP API plus notification worker and dead-letter handler
//! - `ea-licensing worker` - notification worker only
//! - `ea-licensing dead-letter` - dead-letter handler only
//! - `ea-licensing migrate [--dry-run]` - apply database migrations
//! - `ea-licensing config show|validate|generate` - configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use ea_licensing::commands::{self, ConfigCommand, MigrateCommand, ServeCommand};
use ea_licensing::telemetry::{init_logging, init_metrics};
use ea_licensing_core::domain::config::LicensingConfigManifest;

/// EA license administration back end
#[derive(Parser)]
#[command(name = "ea-licensing")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "EA_LICENSING_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides spec.observability.log_level
    #[arg(long, global = true, env = "EA_LICENSING_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the queue consumers
    #[command(name = "serve")]
    Serve {
        #[command(flatten)]
        command: ServeCommand,
    },

    /// Run the notification worker only
    #[command(name = "worker")]
    Worker,

    /// Run the dead-letter handler only
    #[command(name = "dead-letter")]
    DeadLetter,

    /// Apply database migrations
    #[command(name = "migrate")]
    Migrate {
        #[command(flatten)]
        command: MigrateCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal outside development
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Commands::Config { command } = cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
        return commands::config::handle_command(command, cli.config).await;
    }

    let config = LicensingConfigManifest::load_or_default(cli.config.clone())
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    let observability = &config.spec.observability;
    init_logging(
        cli.log_level.as_deref().unwrap_or(&observability.log_level),
        &observability.log_format,
    )?;

    if let Some(port) = observability.metrics_port {
        let addr: SocketAddr = format!("{}:{}", config.spec.api.bind_address, port)
            .parse()
            .context("Invalid metrics listen address")?;
        init_metrics(addr)?;
    }

    match cli.command {
        Commands::Serve { command } => commands::serve::execute(command, config).await,
        Commands::Worker => commands::worker::run_notification_worker(config).await,
        Commands::DeadLetter => commands::worker::run_dead_letter_handler(config).await,
        Commands::Migrate { command } => commands::migrate::execute(command, config).await,
        Commands::Config { .. } => Ok(()),
    }
}
