// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Thin-pool / thin-LV lifecycle contract.
//!
//! Every operation is idempotent: creating something that exists or
//! deactivating/removing something that is gone succeeds. Operations are
//! addressed to a node because activation is node-local.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::command::CommandError;
use crate::domain::pool::NodeId;

/// Reference to a logical volume inside a volume group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LvRef {
    pub volume_group: String,
    pub lv: String,
}

impl LvRef {
    pub fn new(volume_group: impl Into<String>, lv: impl Into<String>) -> Self {
        Self {
            volume_group: volume_group.into(),
            lv: lv.into(),
        }
    }

    /// `vg/lv` as accepted by the LVM tools.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.volume_group, self.lv)
    }

    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.volume_group, self.lv))
    }
}

impl std::fmt::Display for LvRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_name())
    }
}

#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Create a thin-pool LV (left inactive).
    async fn create_thin_pool(&self, node: &NodeId, pool: &LvRef, size_bytes: u64) -> Result<(), VolumeError>;

    /// Create a thin LV inside `pool` (left inactive).
    async fn create_thin_lv(
        &self,
        node: &NodeId,
        pool: &LvRef,
        lv: &LvRef,
        size_bytes: u64,
    ) -> Result<(), VolumeError>;

    /// Create a thin snapshot `target` of `source` in the same pool.
    async fn snapshot_thin_lv(&self, node: &NodeId, source: &LvRef, target: &LvRef) -> Result<(), VolumeError>;

    /// Exclusively activate the thin-pool LV on `node`.
    async fn activate_thin_pool(&self, node: &NodeId, pool: &LvRef) -> Result<(), VolumeError>;

    async fn deactivate_thin_pool(&self, node: &NodeId, pool: &LvRef) -> Result<(), VolumeError>;

    /// Activate a thin LV on `node`; returns its device path.
    async fn activate_thin_lv(&self, node: &NodeId, lv: &LvRef) -> Result<PathBuf, VolumeError>;

    async fn deactivate_thin_lv(&self, node: &NodeId, lv: &LvRef) -> Result<(), VolumeError>;

    /// Grow an LV to `size_bytes`.
    async fn extend_lv(&self, node: &NodeId, lv: &LvRef, size_bytes: u64) -> Result<(), VolumeError>;

    async fn remove_lv(&self, node: &NodeId, lv: &LvRef) -> Result<(), VolumeError>;
}

#[derive(Debug, Clone, Error)]
pub enum VolumeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The LV is held active by another node (exclusive activation).
    #[error("{lv} is active on another node")]
    ActiveElsewhere { lv: String },
}
