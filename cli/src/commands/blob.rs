// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Blob lifecycle commands
//!
//! Commands: create, clone, delete, expand, show, list

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use lvblob_core::application::{BlobService, NodeServices};
use lvblob_core::domain::blob::Blob;
use lvblob_core::domain::pool::PoolName;

use super::{blob_name, parse_size};

#[derive(Subcommand)]
pub enum BlobCommand {
    /// Create a blob with its own thin pool
    Create {
        #[arg(value_name = "NAME")]
        name: String,

        /// Volume group the pool is carved from
        #[arg(long, env = "LVBLOB_VOLUME_GROUP")]
        volume_group: String,

        /// Size in bytes or with a K/M/G/T suffix
        #[arg(long, value_parser = parse_size)]
        size: u64,
    },

    /// Create a blob as a thin snapshot of another, sharing its pool
    Clone {
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(long, value_name = "SOURCE")]
        source: String,
    },

    /// Delete an unattached blob
    Delete {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Grow an unattached blob
    Expand {
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(long, value_parser = parse_size)]
        size: u64,
    },

    /// Show one blob
    Show {
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// List the blobs sharing a pool
    List {
        #[arg(long)]
        pool: String,

        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: BlobCommand, services: &NodeServices) -> Result<()> {
    let blobs = &services.blobs;
    match command {
        BlobCommand::Create {
            name,
            volume_group,
            size,
        } => {
            let blob = blobs
                .create_blob(blob_name(&name)?, &volume_group, size)
                .await
                .with_context(|| format!("Failed to create blob {}", name))?;
            println!("{}", format!("✓ Blob {} created in pool {}", blob.name, blob.pool).green());
        }
        BlobCommand::Clone { name, source } => {
            let blob = blobs
                .clone_blob(blob_name(&name)?, &blob_name(&source)?)
                .await
                .with_context(|| format!("Failed to clone {} into {}", source, name))?;
            println!("{}", format!("✓ Blob {} cloned from {}", blob.name, source).green());
        }
        BlobCommand::Delete { name } => {
            blobs
                .delete_blob(&blob_name(&name)?)
                .await
                .with_context(|| format!("Failed to delete blob {}", name))?;
            println!("{}", format!("✓ Blob {} deleted", name).green());
        }
        BlobCommand::Expand { name, size } => {
            let blob = blobs
                .expand_blob(&blob_name(&name)?, size)
                .await
                .with_context(|| format!("Failed to expand blob {}", name))?;
            println!("{}", format!("✓ Blob {} is now {} bytes", blob.name, blob.size_bytes).green());
        }
        BlobCommand::Show { name, json } => {
            let blob = blobs.get_blob(&blob_name(&name)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&blob)?);
            } else {
                print_blob(&blob);
            }
        }
        BlobCommand::List { pool, json } => {
            let listed = blobs.list_pool_blobs(&PoolName::new(pool.clone())).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listed)?);
            } else if listed.is_empty() {
                println!("{}", format!("No blobs in pool {}", pool).dimmed());
            } else {
                for blob in &listed {
                    print_blob(blob);
                }
            }
        }
    }
    Ok(())
}

fn print_blob(blob: &Blob) {
    println!("{}", blob.name.to_string().bold());
    println!("  Pool: {}", blob.pool);
    println!("  Volume group: {}", blob.volume_group);
    println!("  Size: {} bytes", blob.size_bytes);
    println!("  Device: {}", blob.name.dm_path().display());
}
