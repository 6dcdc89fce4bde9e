// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Attach, detach and optimize commands.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use lvblob_core::application::{AttachmentService, NodeServices};
use lvblob_core::domain::pool::NodeId;

use super::{blob_name, node_or};

const DEFAULT_COOKIE: &str = "cli";

#[derive(Args)]
pub struct AttachArgs {
    #[arg(value_name = "BLOB")]
    pub blob: String,

    /// Node to attach on (default: the pool's active node, else this node)
    #[arg(long)]
    pub node: Option<String>,

    /// Consumer identity; holders with different cookies share the device
    #[arg(long, default_value = DEFAULT_COOKIE)]
    pub cookie: String,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct DetachArgs {
    #[arg(value_name = "BLOB")]
    pub blob: String,

    /// Node to detach from (default: this node)
    #[arg(long)]
    pub node: Option<String>,

    #[arg(long, default_value = DEFAULT_COOKIE)]
    pub cookie: String,
}

#[derive(Args)]
pub struct OptimizeArgs {
    #[arg(value_name = "BLOB")]
    pub blob: String,

    /// Node that wants local access (default: this node)
    #[arg(long)]
    pub node: Option<String>,
}

pub async fn attach(args: AttachArgs, services: &NodeServices) -> Result<()> {
    let blob = blob_name(&args.blob)?;
    let (node, device) = services
        .attachments
        .attach_blob(&blob, args.node.map(NodeId::new), &args.cookie)
        .await
        .with_context(|| format!("Failed to attach {}", blob))?;

    if args.json {
        let out = serde_json::json!({
            "blob": blob,
            "node": node,
            "cookie": args.cookie,
            "device": device,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", format!("✓ {} attached on {}", blob, node).green());
        println!("  Device: {}", device.display());
    }
    Ok(())
}

pub async fn detach(args: DetachArgs, services: &NodeServices) -> Result<()> {
    let blob = blob_name(&args.blob)?;
    let node = node_or(args.node, &services.node);
    services
        .attachments
        .detach_blob(&blob, &node, &args.cookie)
        .await
        .with_context(|| format!("Failed to detach {} from {}", blob, node))?;
    println!("{}", format!("✓ {} detached from {}", blob, node).green());
    Ok(())
}

pub async fn optimize(args: OptimizeArgs, services: &NodeServices) -> Result<()> {
    let blob = blob_name(&args.blob)?;
    let node = node_or(args.node, &services.node);
    let moved = services
        .attachments
        .optimize_attachment_for_node(&blob, &node)
        .await
        .with_context(|| format!("Failed to optimize {} for {}", blob, node))?;
    if moved {
        println!("{}", format!("✓ Pool of {} moved to {}", blob, node).green());
    } else {
        println!("{}", "Placement already optimal".dimmed());
    }
    Ok(())
}
