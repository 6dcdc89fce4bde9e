// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pool Migration
//!
//! Moves a pool's exclusive activation from its current node to another one
//! while holders exist, without changing any holder's device path.
//!
//! Teardown of the old side completes before the new side comes up: LVM
//! exclusive activation forbids overlap. Consumers only see their I/O queue
//! in the upper device-mapper layer between the suspend and the resume of
//! their lower layer.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::application::attachment::AttachmentError;
use crate::application::host::{blob_lv, pool_lv, HostAdapters};
use crate::domain::blob::{Blob, BlobName};
use crate::domain::pool::{NodeId, PoolState};
use crate::domain::relay::ServerIdentity;

/// Blob records for the blobs a migration touches.
pub type BlobCatalog = BTreeMap<BlobName, Blob>;

pub struct PoolMigrator {
    adapters: HostAdapters,
}

impl PoolMigrator {
    pub fn new(adapters: HostAdapters) -> Self {
        Self { adapters }
    }

    /// Migrate `state` to `to`, updating `active_on` in memory only; the
    /// caller commits it. Returns whether anything moved.
    pub async fn migrate_pool(
        &self,
        state: &mut PoolState,
        catalog: &BlobCatalog,
        to: &NodeId,
    ) -> Result<bool, AttachmentError> {
        let from = match &state.active_on {
            _ if state.holders.is_empty() => return Ok(false),
            Some(active) if active == to => return Ok(false),
            Some(active) => active.clone(),
            None => {
                return Err(AttachmentError::InvariantViolation(format!(
                    "pool {} has holders but no active node",
                    state.name
                )))
            }
        };

        let held = held_records(state, catalog)?;

        info!(pool = %state.name, from = %from, to = %to, blobs = held.len(), "Migrating pool");

        self.tear_down(state, &held, &from).await?;
        self.bring_up(state, &held, to).await?;

        state.active_on = Some(to.clone());
        metrics::counter!("lvblob_pool_migrations_total").increment(1);
        Ok(true)
    }

    /// Bring every attachment `state` records up on its active node,
    /// recreating device-mapper pairs that went missing. Used after a call
    /// tore something down and then lost its commit.
    pub async fn restore(&self, state: &PoolState, catalog: &BlobCatalog) -> Result<(), AttachmentError> {
        let Some(active) = &state.active_on else {
            return Ok(());
        };
        let held = held_records(state, catalog)?;
        for blob in &held {
            for node in state.nodes_holding(&blob.name) {
                self.adapters
                    .device_mapper
                    .create(&node, &blob.name, blob.size_bytes)
                    .await?;
            }
        }
        self.bring_up(state, &held, active).await?;
        info!(pool = %state.name, node = %active, blobs = held.len(), "Recorded attachments restored");
        Ok(())
    }

    async fn tear_down(&self, state: &PoolState, held: &[&Blob], from: &NodeId) -> Result<(), AttachmentError> {
        for blob in held {
            let export = blob.name.export_id();
            for node in state.nodes_holding(&blob.name) {
                self.adapters
                    .device_mapper
                    .suspend(&node, &blob.name, true)
                    .await?;
                if &node != from {
                    if let Some(device) = self.adapters.relay.client_device(&node, export).await? {
                        self.adapters.relay.disconnect_client(&node, &device).await?;
                    }
                }
            }
            self.adapters.relay.stop_server(from, export).await?;
            self.adapters.volumes.deactivate_thin_lv(from, &blob_lv(blob)).await?;
            debug!(blob = %blob.name, node = %from, "Blob released");
        }
        self.adapters.volumes.deactivate_thin_pool(from, &pool_lv(state)).await?;
        Ok(())
    }

    async fn bring_up(&self, state: &PoolState, held: &[&Blob], to: &NodeId) -> Result<(), AttachmentError> {
        self.adapters.volumes.activate_thin_pool(to, &pool_lv(state)).await?;
        for blob in held {
            let lv_path = self.adapters.volumes.activate_thin_lv(to, &blob_lv(blob)).await?;
            let export = blob.name.export_id();
            for node in state.nodes_holding(&blob.name) {
                let backing = if &node == to {
                    lv_path.clone()
                } else {
                    self.adapters.relay.start_server(to, export, &lv_path).await?;
                    self.adapters
                        .relay
                        .connect_client(&node, &ServerIdentity::new(to.clone(), export))
                        .await?
                };
                self.adapters
                    .device_mapper
                    .resume(&node, &blob.name, blob.size_bytes, &backing)
                    .await?;
            }
            debug!(blob = %blob.name, node = %to, "Blob resumed");
        }
        Ok(())
    }
}

fn held_records<'a>(state: &PoolState, catalog: &'a BlobCatalog) -> Result<Vec<&'a Blob>, AttachmentError> {
    state
        .held_blobs()
        .iter()
        .map(|name| {
            catalog
                .get(name)
                .ok_or_else(|| AttachmentError::BlobNotFound(name.clone()))
        })
        .collect()
}
