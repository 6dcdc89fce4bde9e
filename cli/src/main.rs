// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # lvblob
//!
//! Node agent and operator CLI for clustered thin-provisioned blobs.
//!
//! ## Commands
//!
//! - `lvblob serve` - Run the node agent (event-driven reconcile loop)
//! - `lvblob blob create|clone|delete|expand|show|list` - Blob lifecycle
//! - `lvblob attach|detach|optimize` - Attachment engine calls
//! - `lvblob pool show|list` - Pool state records
//! - `lvblob activation add|complete|show` - Declarative work items
//! - `lvblob relay health` - NBD export health
//! - `lvblob config show|validate|generate` - Configuration management
//!
//! Failed commands exit with 2 (invalid argument), 3 (not found),
//! 4 (failed precondition) or 1 (anything else).

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use lvblob_cli::commands::{
    self, ActivationCommand, AttachArgs, BlobCommand, ConfigCommand, DetachArgs, OptimizeArgs, PoolCommand,
    RelayCommand,
};
use lvblob_cli::node;
use lvblob_cli::telemetry::{self, LogFormat};

/// lvblob - attach thin-provisioned blobs anywhere in the cluster
#[derive(Parser)]
#[command(name = "lvblob")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "LVBLOB_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LVBLOB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, env = "LVBLOB_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node agent until interrupted
    Serve,

    /// Blob lifecycle
    Blob {
        #[command(subcommand)]
        command: BlobCommand,
    },

    /// Attach a blob on a node
    Attach(AttachArgs),

    /// Detach a blob holder
    Detach(DetachArgs),

    /// Move a blob's pool to the node using it most
    Optimize(OptimizeArgs),

    /// Inspect pool state records
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },

    /// Declarative activation work items
    Activation {
        #[command(subcommand)]
        command: ActivationCommand,
    },

    /// NBD relay checks
    Relay {
        #[command(subcommand)]
        command: RelayCommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(commands::exit_code(&e));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Cli {
        config,
        log_level,
        log_format,
        command,
    } = cli;

    let command = match command {
        Commands::Config { command } => {
            telemetry::init_logging(log_level.as_deref().unwrap_or("warn"), LogFormat::Text)?;
            return commands::config::handle_command(command, config).await;
        }
        other => other,
    };

    let manifest = node::load_config(config)?;
    let logging = manifest
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.logging.as_ref());
    let level = log_level
        .or_else(|| logging.map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = log_format
        .or_else(|| logging.and_then(|l| LogFormat::from_config(&l.format)))
        .unwrap_or(LogFormat::Text);
    telemetry::init_logging(&level, format)?;

    if let Commands::Serve = command {
        return commands::serve::run(&manifest).await;
    }

    let services = node::connect(&manifest).await?;
    match command {
        Commands::Blob { command } => commands::blob::handle_command(command, &services).await,
        Commands::Attach(args) => commands::attach::attach(args, &services).await,
        Commands::Detach(args) => commands::attach::detach(args, &services).await,
        Commands::Optimize(args) => commands::attach::optimize(args, &services).await,
        Commands::Pool { command } => commands::pool::handle_command(command, &services).await,
        Commands::Activation { command } => commands::activation::handle_command(command, &services).await,
        Commands::Relay { command } => commands::relay::handle_command(command, &services).await,
        Commands::Serve | Commands::Config { .. } => Ok(()),
    }
}
