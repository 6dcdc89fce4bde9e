// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Work item commands for the declarative activation path.
//!
//! Items recorded here are picked up by the node reconcilers of a running
//! `lvblob serve`.

use anyhow::{bail, Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;

use lvblob_core::application::NodeServices;
use lvblob_core::domain::activation::{PoolActivation, WorkItem, WorkItemId, WorkItemKind};
use lvblob_core::domain::pool::{NodeId, PoolName};

use super::{blob_name, node_or};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkKind {
    Create,
    Clone,
    Snapshot,
    Stage,
    Export,
    Delete,
    Expand,
}

#[derive(Subcommand)]
pub enum ActivationCommand {
    /// Record a pending work item for a blob's pool
    Add {
        #[arg(value_name = "BLOB")]
        blob: String,

        #[arg(long, value_enum)]
        kind: WorkKind,

        /// Pool the blob lives in (default: the blob's own pool)
        #[arg(long)]
        pool: Option<String>,

        /// Source blob for `clone`
        #[arg(long)]
        source: Option<String>,

        /// Consumer node for `stage`
        #[arg(long)]
        stage_node: Option<String>,

        /// Requesting node (default: this node)
        #[arg(long)]
        requester: Option<String>,
    },

    /// Mark a work item as done
    Complete {
        #[arg(value_name = "POOL")]
        pool: String,

        #[arg(value_name = "ITEM_ID")]
        id: WorkItemId,
    },

    /// Show a pool's activation resource
    Show {
        #[arg(value_name = "POOL")]
        pool: String,

        #[arg(long)]
        json: bool,
    },
}

/// Build the domain kind, checking the per-kind arguments.
pub fn work_item_kind(kind: WorkKind, source: Option<String>, stage_node: Option<String>) -> Result<WorkItemKind> {
    Ok(match kind {
        WorkKind::Create => WorkItemKind::Create,
        WorkKind::Clone => {
            let Some(source) = source else {
                bail!("--source is required for clone work items");
            };
            WorkItemKind::Clone {
                source: blob_name(&source)?,
            }
        }
        WorkKind::Snapshot => WorkItemKind::Snapshot,
        WorkKind::Stage => {
            let Some(node) = stage_node else {
                bail!("--stage-node is required for stage work items");
            };
            WorkItemKind::Stage { node: NodeId::new(node) }
        }
        WorkKind::Export => WorkItemKind::Export,
        WorkKind::Delete => WorkItemKind::Delete,
        WorkKind::Expand => WorkItemKind::Expand,
    })
}

pub async fn handle_command(command: ActivationCommand, services: &NodeServices) -> Result<()> {
    match command {
        ActivationCommand::Add {
            blob,
            kind,
            pool,
            source,
            stage_node,
            requester,
        } => {
            let blob = blob_name(&blob)?;
            let pool = PoolName::new(pool.unwrap_or_else(|| blob.to_string()));
            let item = WorkItem::new(
                blob,
                work_item_kind(kind, source, stage_node)?,
                node_or(requester, &services.node),
            );
            let id = item.id;
            let activation = services
                .activation
                .add_work_item(&pool, item)
                .await
                .with_context(|| format!("Failed to add work item to {}", pool))?;
            println!("{}", format!("✓ Work item {} added to {}", id, pool).green());
            print_assignment(&activation);
        }
        ActivationCommand::Complete { pool, id } => {
            let pool = PoolName::new(pool);
            let activation = services
                .activation
                .complete_work_item(&pool, id)
                .await
                .with_context(|| format!("Failed to complete work item {}", id))?;
            println!("{}", format!("✓ Work item {} completed", id).green());
            print_assignment(&activation);
        }
        ActivationCommand::Show { pool, json } => {
            let pool = PoolName::new(pool);
            let Some(activation) = services.activation.get(&pool).await? else {
                println!("{}", format!("No activation resource for {}", pool).dimmed());
                return Ok(());
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&activation)?);
                return Ok(());
            }
            println!("{}", activation.pool.to_string().bold());
            print_assignment(&activation);
            println!("  Work items:");
            for item in &activation.work_items {
                println!(
                    "    - {} {} {} (requested by {})",
                    item.id,
                    item.kind.label(),
                    item.blob,
                    item.requester
                );
            }
            println!("  Observed holders:");
            for holder in &activation.observed {
                println!("    - {}", holder);
            }
        }
    }
    Ok(())
}

fn print_assignment(activation: &PoolActivation) {
    match &activation.assigned_node {
        Some(node) => println!("  Assigned node: {}", node.to_string().cyan()),
        None => println!("  Assigned node: {}", "(none)".dimmed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_kind_requires_kind_arguments() {
        assert!(work_item_kind(WorkKind::Clone, None, None).is_err());
        assert!(work_item_kind(WorkKind::Stage, None, None).is_err());
        assert_eq!(
            work_item_kind(WorkKind::Stage, None, Some("n2".to_string())).unwrap(),
            WorkItemKind::Stage { node: NodeId::from("n2") }
        );
        assert_eq!(
            work_item_kind(WorkKind::Clone, Some("src".to_string()), None).unwrap(),
            WorkItemKind::Clone { source: "src".into() }
        );
        assert_eq!(work_item_kind(WorkKind::Delete, None, None).unwrap(), WorkItemKind::Delete);
    }
}
