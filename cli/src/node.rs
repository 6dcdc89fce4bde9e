// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node bootstrap for commands that talk to the cluster.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::debug;

use lvblob_core::application::NodeServices;
use lvblob_core::domain::node_config::NodeConfigManifest;

/// Load and validate the node configuration.
pub fn load_config(config_path: Option<PathBuf>) -> Result<NodeConfigManifest> {
    let manifest = NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    manifest.validate().context("Configuration validation failed")?;
    Ok(manifest)
}

/// Connect to the state store and build this node's services.
pub async fn connect(manifest: &NodeConfigManifest) -> Result<NodeServices> {
    debug!(node = %manifest.spec.node.id, "Connecting node services");
    NodeServices::from_config(&manifest.spec).await
}
