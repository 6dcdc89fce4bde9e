// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! dmsetup-backed dual device-mapper wrapper
//!
//! Table formats:
//!
//! ```text
//! lower (placeholder):  0 <sectors> error
//! lower (assigned):     0 <sectors> linear <backing> 0
//! upper:                0 <sectors> multipath 3 queue_if_no_path queue_mode bio 0 1 1 round-robin 0 1 1 /dev/mapper/<lower> 1000
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::domain::blob::BlobName;
use crate::domain::command::{
    CommandError, CommandRunner, CommandRunnerExt, HostCommand, ALREADY_EXISTS, NOT_FOUND, NO_SUCH_DEVICE,
};
use crate::domain::device_mapper::{DeviceMapperError, DualDeviceMapper};
use crate::domain::pool::NodeId;

pub struct DmsetupDualDeviceMapper {
    runner: Arc<dyn CommandRunner>,
}

fn mapper_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{}", name))
}

fn sectors(size_bytes: u64) -> u64 {
    size_bytes / 512
}

pub fn error_table(size_bytes: u64) -> String {
    format!("0 {} error", sectors(size_bytes))
}

pub fn linear_table(size_bytes: u64, backing: &Path) -> String {
    format!("0 {} linear {} 0", sectors(size_bytes), backing.display())
}

pub fn multipath_table(size_bytes: u64, lower: &str) -> String {
    format!(
        "0 {} multipath 3 queue_if_no_path queue_mode bio 0 1 1 round-robin 0 1 1 {} 1000",
        sectors(size_bytes),
        mapper_path(lower).display()
    )
}

impl DmsetupDualDeviceMapper {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn create_device(&self, node: &NodeId, name: &str, table: String) -> Result<(), CommandError> {
        let cmd = HostCommand::new("dmsetup")
            .arg("create")
            .arg(name)
            .arg("--table")
            .arg(table);
        self.runner.run_checked(node, &cmd, &[ALREADY_EXISTS]).await?;
        Ok(())
    }

    async fn remove_device(&self, node: &NodeId, name: &str) -> Result<(), CommandError> {
        let cmd = HostCommand::new("dmsetup").args(["remove", "--force"]).arg(name);
        self.runner
            .run_checked(node, &cmd, &[NO_SUCH_DEVICE, NOT_FOUND])
            .await?;
        Ok(())
    }

    async fn rollback(&self, node: &NodeId, name: &BlobName, cause: CommandError) -> DeviceMapperError {
        debug!(node = %node, blob = %name, "Rolling back partial device-mapper pair");
        let upper = self.remove_device(node, &name.dm_upper_name()).await;
        let lower = self.remove_device(node, &name.dm_lower_name()).await;
        match upper.and(lower) {
            Ok(()) => DeviceMapperError::Command(cause),
            Err(rollback) => {
                error!(node = %node, blob = %name, error = %rollback, "Device-mapper rollback failed");
                DeviceMapperError::RollbackFailed {
                    node: node.clone(),
                    name: name.to_string(),
                    source: cause,
                    rollback,
                }
            }
        }
    }
}

#[async_trait]
impl DualDeviceMapper for DmsetupDualDeviceMapper {
    async fn create(&self, node: &NodeId, name: &BlobName, size_bytes: u64) -> Result<PathBuf, DeviceMapperError> {
        let lower = name.dm_lower_name();
        let upper = name.dm_upper_name();

        self.create_device(node, &lower, error_table(size_bytes)).await?;

        if let Err(e) = self
            .create_device(node, &upper, multipath_table(size_bytes, &lower))
            .await
        {
            return Err(self.rollback(node, name, e).await);
        }

        let mknodes = HostCommand::new("dmsetup").arg("mknodes").arg(&upper);
        if let Err(e) = self.runner.run_checked(node, &mknodes, &[]).await {
            return Err(self.rollback(node, name, e).await);
        }

        let path = mapper_path(&upper);
        let check = HostCommand::new("test").arg("-b").arg(path.display().to_string());
        let exists = match self.runner.run(node, &check).await {
            Ok(output) => output.is_success(),
            Err(e) => return Err(self.rollback(node, name, e).await),
        };
        if !exists {
            let missing = CommandError::UnexpectedOutput {
                node: node.clone(),
                command: check.to_string(),
                reason: format!("{} is not a block device", path.display()),
            };
            return match self.rollback(node, name, missing).await {
                DeviceMapperError::Command(_) => Err(DeviceMapperError::DeviceMissing {
                    node: node.clone(),
                    path,
                }),
                other => Err(other),
            };
        }

        info!(node = %node, blob = %name, path = %path.display(), "Dual device-mapper pair created");
        Ok(path)
    }

    async fn resume(
        &self,
        node: &NodeId,
        name: &BlobName,
        size_bytes: u64,
        backing: &Path,
    ) -> Result<(), DeviceMapperError> {
        let lower = name.dm_lower_name();
        let load = HostCommand::new("dmsetup")
            .arg("load")
            .arg(&lower)
            .arg("--table")
            .arg(linear_table(size_bytes, backing));
        self.runner.run_checked(node, &load, &[]).await?;

        let resume = HostCommand::new("dmsetup").arg("resume").arg(&lower);
        self.runner.run_checked(node, &resume, &[]).await?;

        let reinstate = HostCommand::new("dmsetup")
            .arg("message")
            .arg(name.dm_upper_name())
            .arg("0")
            .arg(format!("reinstate_path {}", mapper_path(&lower).display()));
        self.runner.run_checked(node, &reinstate, &[]).await?;

        debug!(node = %node, blob = %name, backing = %backing.display(), "Lower device resumed");
        Ok(())
    }

    async fn suspend(&self, node: &NodeId, name: &BlobName, skip_fs_sync: bool) -> Result<(), DeviceMapperError> {
        let lower = name.dm_lower_name();
        let fail = HostCommand::new("dmsetup")
            .arg("message")
            .arg(name.dm_upper_name())
            .arg("0")
            .arg(format!("fail_path {}", mapper_path(&lower).display()));
        self.runner.run_checked(node, &fail, &[]).await?;

        let mut suspend = HostCommand::new("dmsetup").arg("suspend");
        if skip_fs_sync {
            suspend = suspend.arg("--nolockfs");
        }
        suspend = suspend.arg(&lower);
        self.runner.run_checked(node, &suspend, &[]).await?;

        debug!(node = %node, blob = %name, skip_fs_sync, "Lower device suspended");
        Ok(())
    }

    async fn remove(&self, node: &NodeId, name: &BlobName) -> Result<(), DeviceMapperError> {
        self.remove_device(node, &name.dm_upper_name()).await?;
        self.remove_device(node, &name.dm_lower_name()).await?;
        info!(node = %node, blob = %name, "Dual device-mapper pair removed");
        Ok(())
    }
}
