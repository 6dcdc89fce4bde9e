// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use lvblob_core::application::{AttachmentError, AttachmentService, NodeServices};
use lvblob_core::domain::pool::{PoolName, PoolState};
use lvblob_core::domain::repository::PoolStateStore;

#[derive(Subcommand)]
pub enum PoolCommand {
    /// Show a pool's state record
    Show {
        #[arg(value_name = "POOL")]
        pool: String,

        #[arg(long)]
        json: bool,
    },

    /// List every pool record
    List,
}

pub async fn handle_command(command: PoolCommand, services: &NodeServices) -> Result<()> {
    match command {
        PoolCommand::Show { pool, json } => {
            let name = PoolName::new(pool);
            let state = services
                .attachments
                .get_pool(&name)
                .await?
                .ok_or(AttachmentError::PoolNotFound(name))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                print_pool(&state);
            }
        }
        PoolCommand::List => {
            let pools = services.repositories.pools.list().await?;
            if pools.is_empty() {
                println!("{}", "No pools".dimmed());
            }
            for record in pools {
                let state = record.value;
                let active = state
                    .active_on
                    .as_ref()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<32} active_on={:<16} holders={:<3} blobs={}",
                    state.name.to_string(),
                    active,
                    state.holders.len(),
                    state.blobs.len()
                );
            }
        }
    }
    Ok(())
}

fn print_pool(state: &PoolState) {
    println!("{}", state.name.to_string().bold());
    println!("  Volume group: {}", state.volume_group);
    match &state.active_on {
        Some(node) => println!("  Active on: {}", node.to_string().cyan()),
        None => println!("  Active on: {}", "(idle)".dimmed()),
    }
    println!("  Blobs:");
    for blob in &state.blobs {
        println!("    - {}", blob);
    }
    println!("  Holders:");
    if state.holders.is_empty() {
        println!("    {}", "(none)".dimmed());
    }
    for holder in &state.holders {
        println!("    - {} on {} (cookie {})", holder.blob, holder.node, holder.cookie);
    }
}
