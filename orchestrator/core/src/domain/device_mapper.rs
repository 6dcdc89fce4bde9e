// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Dual device-mapper wrapper contract.
//!
//! Suspending a device to swap its table parks in-flight I/O in an
//! uninterruptible state until resume. To redirect a live device across an
//! NBD reconnect or an LVM reactivation, two layers are stacked:
//!
//! - **lower** (`linear`): one linear mapping onto the current backing
//!   device, or `error` while none is assigned. This is the layer that gets
//!   suspended, reloaded and resumed.
//! - **upper** (`multipath`, `queue_if_no_path`): wraps the lower device as
//!   its only path and is what consumers open. Its path is failed and
//!   reinstated with messages, so the upper device is never suspended.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::blob::BlobName;
use crate::domain::command::CommandError;
use crate::domain::pool::NodeId;

#[async_trait]
pub trait DualDeviceMapper: Send + Sync {
    /// Create both layers (lower with a placeholder `error` table) and
    /// return the stable upper path. Rolls back on failure.
    async fn create(&self, node: &NodeId, name: &BlobName, size_bytes: u64) -> Result<PathBuf, DeviceMapperError>;

    /// Point the lower layer at `backing` and reinstate the upper path.
    async fn resume(
        &self,
        node: &NodeId,
        name: &BlobName,
        size_bytes: u64,
        backing: &Path,
    ) -> Result<(), DeviceMapperError>;

    /// Fail the upper path (I/O queues) and suspend the lower layer.
    async fn suspend(&self, node: &NodeId, name: &BlobName, skip_fs_sync: bool) -> Result<(), DeviceMapperError>;

    /// Force-remove the upper layer, then the lower one.
    async fn remove(&self, node: &NodeId, name: &BlobName) -> Result<(), DeviceMapperError>;
}

#[derive(Debug, Clone, Error)]
pub enum DeviceMapperError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Device {path} did not appear on {node}")]
    DeviceMissing { node: NodeId, path: PathBuf },

    #[error("Failed to create {name} on {node}: {source}; rollback also failed: {rollback}")]
    RollbackFailed {
        node: NodeId,
        name: String,
        source: CommandError,
        rollback: CommandError,
    },
}
