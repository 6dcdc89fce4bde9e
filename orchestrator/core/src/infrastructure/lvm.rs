// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! LVM thin-pool / thin-LV adapter
//!
//! Implements [`VolumeManager`] with the LVM command-line tools. Sizes are
//! passed in bytes (`<n>b`). Activation is exclusive (`ey`) so a shared
//! volume group under lvmlockd refuses a second active node.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::domain::command::{
    CommandError, CommandRunner, CommandRunnerExt, HostCommand, ALREADY_EXISTS, FAILED_TO_FIND,
};
use crate::domain::pool::NodeId;
use crate::domain::volume::{LvRef, VolumeError, VolumeManager};

/// lvextend refuses a no-op resize with this wording.
const MATCHES_EXISTING_SIZE: &str = "matches existing size";
/// lvmlockd wording when the LV lock is held elsewhere.
const OTHER_HOST: &str = "other host";

pub struct LvmVolumeManager {
    runner: Arc<dyn CommandRunner>,
}

impl LvmVolumeManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn size_arg(size_bytes: u64) -> String {
        format!("{}b", size_bytes)
    }

    async fn activate(&self, node: &NodeId, lv: &LvRef) -> Result<(), VolumeError> {
        let cmd = HostCommand::new("lvchange").args(["--activate", "ey"]).arg(lv.full_name());
        match self.runner.run_checked(node, &cmd, &[]).await {
            Ok(_) => Ok(()),
            Err(CommandError::Failed { output, .. }) if output.to_lowercase().contains(OTHER_HOST) => {
                Err(VolumeError::ActiveElsewhere { lv: lv.full_name() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn deactivate(&self, node: &NodeId, lv: &LvRef) -> Result<(), VolumeError> {
        let cmd = HostCommand::new("lvchange").args(["--activate", "n"]).arg(lv.full_name());
        self.runner.run_checked(node, &cmd, &[FAILED_TO_FIND]).await?;
        Ok(())
    }
}

#[async_trait]
impl VolumeManager for LvmVolumeManager {
    async fn create_thin_pool(&self, node: &NodeId, pool: &LvRef, size_bytes: u64) -> Result<(), VolumeError> {
        let cmd = HostCommand::new("lvcreate")
            .args(["--type", "thin-pool", "--name"])
            .arg(&pool.lv)
            .arg("--size")
            .arg(Self::size_arg(size_bytes))
            .args(["--activate", "n"])
            .arg(&pool.volume_group);
        self.runner.run_checked(node, &cmd, &[ALREADY_EXISTS]).await?;
        info!(node = %node, pool = %pool, size_bytes, "Thin pool created");
        Ok(())
    }

    async fn create_thin_lv(
        &self,
        node: &NodeId,
        pool: &LvRef,
        lv: &LvRef,
        size_bytes: u64,
    ) -> Result<(), VolumeError> {
        let cmd = HostCommand::new("lvcreate")
            .args(["--type", "thin", "--name"])
            .arg(&lv.lv)
            .arg("--thinpool")
            .arg(&pool.lv)
            .arg("--virtualsize")
            .arg(Self::size_arg(size_bytes))
            .args(["--activate", "n"])
            .arg(&lv.volume_group);
        self.runner.run_checked(node, &cmd, &[ALREADY_EXISTS]).await?;
        info!(node = %node, lv = %lv, size_bytes, "Thin LV created");
        Ok(())
    }

    async fn snapshot_thin_lv(&self, node: &NodeId, source: &LvRef, target: &LvRef) -> Result<(), VolumeError> {
        let cmd = HostCommand::new("lvcreate")
            .args(["--snapshot", "--name"])
            .arg(&target.lv)
            .args(["--setactivationskip", "n"])
            .arg(source.full_name());
        self.runner.run_checked(node, &cmd, &[ALREADY_EXISTS]).await?;
        info!(node = %node, source = %source, target = %target, "Thin snapshot created");
        Ok(())
    }

    async fn activate_thin_pool(&self, node: &NodeId, pool: &LvRef) -> Result<(), VolumeError> {
        self.activate(node, pool).await
    }

    async fn deactivate_thin_pool(&self, node: &NodeId, pool: &LvRef) -> Result<(), VolumeError> {
        self.deactivate(node, pool).await
    }

    async fn activate_thin_lv(&self, node: &NodeId, lv: &LvRef) -> Result<PathBuf, VolumeError> {
        self.activate(node, lv).await?;
        Ok(lv.device_path())
    }

    async fn deactivate_thin_lv(&self, node: &NodeId, lv: &LvRef) -> Result<(), VolumeError> {
        self.deactivate(node, lv).await
    }

    async fn extend_lv(&self, node: &NodeId, lv: &LvRef, size_bytes: u64) -> Result<(), VolumeError> {
        let cmd = HostCommand::new("lvextend")
            .arg("--size")
            .arg(Self::size_arg(size_bytes))
            .arg(lv.full_name());
        self.runner.run_checked(node, &cmd, &[MATCHES_EXISTING_SIZE]).await?;
        Ok(())
    }

    async fn remove_lv(&self, node: &NodeId, lv: &LvRef) -> Result<(), VolumeError> {
        let cmd = HostCommand::new("lvremove").arg("--yes").arg(lv.full_name());
        self.runner.run_checked(node, &cmd, &[FAILED_TO_FIND]).await?;
        info!(node = %node, lv = %lv, "LV removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::CommandOutput;
    use crate::infrastructure::command::RecordingCommandRunner;

    fn setup() -> (Arc<RecordingCommandRunner>, LvmVolumeManager) {
        let runner = Arc::new(RecordingCommandRunner::new());
        let manager = LvmVolumeManager::new(runner.clone());
        (runner, manager)
    }

    #[tokio::test]
    async fn test_create_commands() {
        let (runner, lvm) = setup();
        let node = NodeId::from("n1");
        let pool = LvRef::new("vg0", "data-thinpool");
        let lv = LvRef::new("vg0", "data");

        lvm.create_thin_pool(&node, &pool, 1 << 30).await.unwrap();
        lvm.create_thin_lv(&node, &pool, &lv, 1 << 20).await.unwrap();
        lvm.snapshot_thin_lv(&node, &lv, &LvRef::new("vg0", "copy")).await.unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                "lvcreate --type thin-pool --name data-thinpool --size 1073741824b --activate n vg0",
                "lvcreate --type thin --name data --thinpool data-thinpool --virtualsize 1048576b --activate n vg0",
                "lvcreate --snapshot --name copy --setactivationskip n vg0/data",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_tolerates_existing() {
        let (runner, lvm) = setup();
        runner.respond(
            "lvcreate",
            CommandOutput::failure(5, "  Logical Volume \"data\" already exists in volume group \"vg0\""),
        );
        let pool = LvRef::new("vg0", "data-thinpool");
        assert!(lvm
            .create_thin_lv(&"n1".into(), &pool, &LvRef::new("vg0", "data"), 4096)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_activation_is_exclusive_and_returns_device() {
        let (runner, lvm) = setup();
        let path = lvm
            .activate_thin_lv(&"n2".into(), &LvRef::new("vg0", "data"))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/dev/vg0/data"));
        let history = runner.history();
        assert_eq!(history[0].node, NodeId::from("n2"));
        assert_eq!(history[0].line(), "lvchange --activate ey vg0/data");
    }

    #[tokio::test]
    async fn test_activation_held_elsewhere() {
        let (runner, lvm) = setup();
        runner.respond(
            "--activate ey",
            CommandOutput::failure(5, "  LV locked by other host: vg0/data-thinpool"),
        );
        let err = lvm
            .activate_thin_pool(&"n2".into(), &LvRef::new("vg0", "data-thinpool"))
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::ActiveElsewhere { .. }));
    }

    #[tokio::test]
    async fn test_deactivate_and_remove_tolerate_missing() {
        let (runner, lvm) = setup();
        runner.respond("lvchange", CommandOutput::failure(5, "  Failed to find logical volume \"vg0/gone\""));
        runner.respond("lvremove", CommandOutput::failure(5, "  Failed to find logical volume \"vg0/gone\""));
        let gone = LvRef::new("vg0", "gone");
        assert!(lvm.deactivate_thin_lv(&"n1".into(), &gone).await.is_ok());
        assert!(lvm.remove_lv(&"n1".into(), &gone).await.is_ok());
    }

    #[tokio::test]
    async fn test_other_failures_propagate() {
        let (runner, lvm) = setup();
        runner.respond("lvextend", CommandOutput::failure(5, "  Insufficient free space"));
        let err = lvm
            .extend_lv(&"n1".into(), &LvRef::new("vg0", "data"), 8192)
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::Command(CommandError::Failed { .. })));
    }
}
