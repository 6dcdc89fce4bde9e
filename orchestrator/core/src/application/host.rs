// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host-side adapters shared by the application services.

use std::sync::Arc;

use crate::domain::blob::Blob;
use crate::domain::command::{CommandRunner, JobDispatcher};
use crate::domain::device_mapper::DualDeviceMapper;
use crate::domain::node_config::NodeConfigSpec;
use crate::domain::pool::PoolState;
use crate::domain::relay::RelayService;
use crate::domain::volume::{LvRef, VolumeManager};
use crate::infrastructure::command::{ClusterCommandRunner, LocalCommandRunner, SshDispatcher};
use crate::infrastructure::device_mapper::DmsetupDualDeviceMapper;
use crate::infrastructure::lvm::LvmVolumeManager;
use crate::infrastructure::nbd::QmpNbdRelay;
use crate::infrastructure::simulated::SimulatedCluster;

/// The three node-addressed collaborators every engine operation drives.
#[derive(Clone)]
pub struct HostAdapters {
    pub volumes: Arc<dyn VolumeManager>,
    pub relay: Arc<dyn RelayService>,
    pub device_mapper: Arc<dyn DualDeviceMapper>,
}

impl HostAdapters {
    pub fn new(
        volumes: Arc<dyn VolumeManager>,
        relay: Arc<dyn RelayService>,
        device_mapper: Arc<dyn DualDeviceMapper>,
    ) -> Self {
        Self {
            volumes,
            relay,
            device_mapper,
        }
    }

    /// Real LVM / NBD / dmsetup adapters over one shared command runner.
    pub fn from_runner(runner: Arc<dyn CommandRunner>, spec: &NodeConfigSpec) -> Self {
        Self {
            volumes: Arc::new(LvmVolumeManager::new(runner.clone())),
            relay: Arc::new(QmpNbdRelay::new(
                runner.clone(),
                spec.node_addresses(),
                spec.relay.port,
                spec.relay.qmp_socket.clone(),
                spec.relay.client_timeout(),
            )),
            device_mapper: Arc::new(DmsetupDualDeviceMapper::new(runner)),
        }
    }

    /// Adapters for this node as configured: local commands run directly,
    /// remote ones over ssh.
    pub fn from_config(spec: &NodeConfigSpec) -> Self {
        Self::from_runner(command_runner(spec), spec)
    }

    pub fn simulated(cluster: &SimulatedCluster) -> Self {
        Self {
            volumes: Arc::new(cluster.clone()),
            relay: Arc::new(cluster.clone()),
            device_mapper: Arc::new(cluster.clone()),
        }
    }
}

pub fn command_runner(spec: &NodeConfigSpec) -> Arc<dyn CommandRunner> {
    let local = LocalCommandRunner::new(
        spec.node_id(),
        spec.commands.timeout(),
        spec.commands.host_namespace,
    );
    let dispatcher: Arc<dyn JobDispatcher> = Arc::new(SshDispatcher::new(
        local.clone(),
        spec.node_addresses(),
        spec.commands.ssh_user.clone(),
        spec.commands.ssh_options.clone(),
    ));
    Arc::new(ClusterCommandRunner::new(local, Some(dispatcher)))
}

pub(crate) fn pool_lv(state: &PoolState) -> LvRef {
    LvRef::new(state.volume_group.clone(), state.name.thin_pool_lv_name())
}

pub(crate) fn blob_lv(blob: &Blob) -> LvRef {
    LvRef::new(blob.volume_group.clone(), blob.name.lv_name())
}
