// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use lvblob_core::application::NodeServices;
use lvblob_core::domain::relay::RelayService;

use super::node_or;

#[derive(Subcommand)]
pub enum RelayCommand {
    /// Check that a node's NBD export is served
    Health {
        /// Export id (the blob name)
        #[arg(value_name = "EXPORT")]
        export: String,

        /// Node serving the export (default: this node)
        #[arg(long)]
        node: Option<String>,
    },
}

pub async fn handle_command(command: RelayCommand, services: &NodeServices) -> Result<()> {
    match command {
        RelayCommand::Health { export, node } => {
            let node = node_or(node, &services.node);
            services
                .adapters
                .relay
                .check_health(&node, &export)
                .await
                .with_context(|| format!("Export {} on {} is unhealthy", export, node))?;
            println!("{}", format!("✓ Export {} on {} is healthy", export, node).green());
        }
    }
    Ok(())
}
