// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node agent mode: run the reconcile driver until interrupted.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lvblob_core::domain::node_config::NodeConfigManifest;

use crate::node;
use crate::telemetry;

pub async fn run(manifest: &NodeConfigManifest) -> Result<()> {
    if let Some(metrics) = manifest
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
        .filter(|m| m.enabled)
    {
        telemetry::init_metrics(metrics.port)?;
    }

    let services = node::connect(manifest).await?;
    let shutdown = CancellationToken::new();
    let driver = services.start_reconciler(shutdown.clone());
    info!(node = %services.node, "lvblob node agent running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();

    if let Err(e) = driver.await {
        warn!(error = %e, "Reconcile driver exited abnormally");
    }
    Ok(())
}
