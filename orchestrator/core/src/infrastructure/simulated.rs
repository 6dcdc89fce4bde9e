// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Simulated cluster
//!
//! In-process stand-in for the LVM, NBD relay and device-mapper adapters of a
//! whole cluster. It tracks the physical state every node would have and
//! enforces the rules the real tools enforce:
//!
//! - a thin-pool is active on at most one node; its thin LVs can only be
//!   activated where the pool is active;
//! - a thin-pool with active thin LVs cannot be deactivated, and an LV an
//!   export still serves cannot be deactivated;
//! - an export can only serve an LV active on its node, and a client can only
//!   connect to an export that exists.
//!
//! Faults can be injected per operation name (see [`SimulatedCluster::fail_next`]).
//! [`SimulatedCluster::verify_pool`] checks the physical state against a pool
//! record.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::blob::BlobName;
use crate::domain::command::CommandError;
use crate::domain::device_mapper::{DeviceMapperError, DualDeviceMapper};
use crate::domain::pool::{NodeId, PoolState};
use crate::domain::relay::{RelayError, RelayService, ServerIdentity};
use crate::domain::volume::{LvRef, VolumeError, VolumeManager};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ThinLv {
    pool: String,
    size_bytes: u64,
    active_on: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ThinPool {
    active_on: Option<NodeId>,
}

/// Table state of a lower device-mapper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTable {
    Error,
    Linear(PathBuf),
    Suspended(Option<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmPair {
    pub size_bytes: u64,
    pub lower: LowerTable,
    pub path_failed: bool,
}

#[derive(Debug, Default)]
struct SimState {
    pools: BTreeMap<String, ThinPool>,
    lvs: BTreeMap<String, ThinLv>,
    exports: BTreeMap<(NodeId, String), PathBuf>,
    clients: BTreeMap<(NodeId, PathBuf), ServerIdentity>,
    next_nbd: HashMap<NodeId, u32>,
    dm: BTreeMap<(NodeId, BlobName), DmPair>,
    faults: Vec<String>,
    ops: Vec<String>,
}

impl SimState {
    fn take_fault(&mut self, op: &str, node: &NodeId) -> Result<(), CommandError> {
        if let Some(pos) = self.faults.iter().position(|f| f == op) {
            self.faults.remove(pos);
            return Err(failed(node, op, "injected fault"));
        }
        Ok(())
    }

    fn backing_valid(&self, node: &NodeId, backing: &Path) -> bool {
        let lv_active_here = self
            .lvs
            .iter()
            .any(|(name, lv)| lv_path(name) == backing && lv.active_on.as_ref() == Some(node));
        let client_here = self.clients.contains_key(&(node.clone(), backing.to_path_buf()));
        lv_active_here || client_here
    }
}

fn lv_path(full_name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/{}", full_name))
}

fn failed(node: &NodeId, command: &str, output: &str) -> CommandError {
    CommandError::Failed {
        node: node.clone(),
        command: command.to_string(),
        exit_code: 5,
        output: output.to_string(),
    }
}

/// Shared simulated cluster; clones observe the same state.
#[derive(Clone, Default)]
pub struct SimulatedCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` (a trait method name, e.g.
    /// `"connect_client"`) fail.
    pub fn fail_next(&self, op: &str) {
        self.state.lock().faults.push(op.to_string());
    }

    /// Operation log, one `"<op> <node> <target>"` entry per successful call.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    pub fn pool_active_on(&self, pool: &LvRef) -> Option<NodeId> {
        self.state
            .lock()
            .pools
            .get(&pool.full_name())
            .and_then(|p| p.active_on.clone())
    }

    pub fn lv_active_on(&self, lv: &LvRef) -> Option<NodeId> {
        self.state
            .lock()
            .lvs
            .get(&lv.full_name())
            .and_then(|l| l.active_on.clone())
    }

    pub fn lv_exists(&self, lv: &LvRef) -> bool {
        let state = self.state.lock();
        state.lvs.contains_key(&lv.full_name()) || state.pools.contains_key(&lv.full_name())
    }

    pub fn lv_size(&self, lv: &LvRef) -> Option<u64> {
        self.state.lock().lvs.get(&lv.full_name()).map(|l| l.size_bytes)
    }

    pub fn dm_pair(&self, node: &NodeId, blob: &BlobName) -> Option<DmPair> {
        self.state.lock().dm.get(&(node.clone(), blob.clone())).cloned()
    }

    pub fn dm_count(&self) -> usize {
        self.state.lock().dm.len()
    }

    pub fn export_count(&self) -> usize {
        self.state.lock().exports.len()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Drop every export `node` serves, as a restart of its storage daemon
    /// would. Connected clients are left as they are.
    pub fn restart_relay_daemon(&self, node: &NodeId) {
        let mut state = self.state.lock();
        state.exports.retain(|(n, _), _| n != node);
        Self::record(&mut state, "restart_relay_daemon", node, "*");
    }

    /// Check that the physical state is exactly what `pool` implies.
    pub fn verify_pool(&self, pool: &PoolState) -> Result<(), String> {
        let state = self.state.lock();
        let pool_lv = format!("{}/{}", pool.volume_group, pool.name.thin_pool_lv_name());
        let physical_active = state.pools.get(&pool_lv).and_then(|p| p.active_on.clone());
        if physical_active != pool.active_on {
            return Err(format!(
                "thin pool {} active on {:?}, record says {:?}",
                pool_lv, physical_active, pool.active_on
            ));
        }

        for blob in &pool.blobs {
            let full = format!("{}/{}", pool.volume_group, blob.lv_name());
            let active = state.lvs.get(&full).and_then(|l| l.active_on.clone());
            let expected = if pool.blob_has_holders(blob) {
                pool.active_on.clone()
            } else {
                None
            };
            if active != expected {
                return Err(format!("thin LV {} active on {:?}, expected {:?}", full, active, expected));
            }

            let remote_holders = pool
                .nodes_holding(blob)
                .into_iter()
                .any(|n| Some(&n) != pool.active_on.as_ref());
            let exported_on: Vec<&NodeId> = state
                .exports
                .keys()
                .filter(|(_, export)| export == blob.export_id())
                .map(|(node, _)| node)
                .collect();
            // an export may outlive its last remote holder until the blob
            // is released on the active node
            let export_placed = match &pool.active_on {
                Some(active) => exported_on.iter().all(|node| *node == active),
                None => exported_on.is_empty(),
            };
            if !export_placed || (remote_holders && exported_on.is_empty()) {
                return Err(format!(
                    "blob {} exported on {:?} (remote holders: {})",
                    blob, exported_on, remote_holders
                ));
            }

            for ((node, dm_blob), pair) in state.dm.iter().filter(|((_, b), _)| b == blob) {
                if !pool.has_attachment(dm_blob, node) {
                    return Err(format!("stray device-mapper pair for {} on {}", blob, node));
                }
                let backing = match &pair.lower {
                    LowerTable::Linear(backing) if !pair.path_failed => backing,
                    other => {
                        return Err(format!(
                            "pair for {} on {} is not serving I/O: {:?}",
                            blob, node, other
                        ))
                    }
                };
                if Some(node) == pool.active_on.as_ref() {
                    if backing != &lv_path(&full) {
                        return Err(format!("direct pair for {} on {} backs onto {:?}", blob, node, backing));
                    }
                } else {
                    match state.clients.get(&(node.clone(), backing.clone())) {
                        Some(server) if Some(&server.node) == pool.active_on.as_ref() => {}
                        other => {
                            return Err(format!(
                                "relayed pair for {} on {} uses client {:?}",
                                blob, node, other
                            ))
                        }
                    }
                }
            }

            for node in pool.nodes_holding(blob) {
                if !state.dm.contains_key(&(node.clone(), blob.clone())) {
                    return Err(format!("missing device-mapper pair for {} on {}", blob, node));
                }
            }

            let clients_for_blob = state
                .clients
                .values()
                .filter(|server| server.export == blob.export_id())
                .count();
            let relayed_nodes = pool
                .nodes_holding(blob)
                .into_iter()
                .filter(|n| Some(n) != pool.active_on.as_ref())
                .count();
            if clients_for_blob != relayed_nodes {
                return Err(format!(
                    "blob {} has {} relay client(s) for {} relayed node(s)",
                    blob, clients_for_blob, relayed_nodes
                ));
            }
        }
        Ok(())
    }

    fn record(state: &mut SimState, op: &str, node: &NodeId, target: impl std::fmt::Display) {
        state.ops.push(format!("{} {} {}", op, node, target));
    }
}

#[async_trait]
impl VolumeManager for SimulatedCluster {
    async fn create_thin_pool(&self, node: &NodeId, pool: &LvRef, _size_bytes: u64) -> Result<(), VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("create_thin_pool", node)?;
        state
            .pools
            .entry(pool.full_name())
            .or_insert(ThinPool { active_on: None });
        Self::record(&mut state, "create_thin_pool", node, pool);
        Ok(())
    }

    async fn create_thin_lv(
        &self,
        node: &NodeId,
        pool: &LvRef,
        lv: &LvRef,
        size_bytes: u64,
    ) -> Result<(), VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("create_thin_lv", node)?;
        match state.pools.get(&pool.full_name()) {
            None => return Err(failed(node, "lvcreate", "Failed to find thin pool").into()),
            Some(p) if p.active_on.as_ref().is_some_and(|a| a != node) => {
                return Err(VolumeError::ActiveElsewhere { lv: pool.full_name() })
            }
            Some(_) => {}
        }
        state.lvs.entry(lv.full_name()).or_insert(ThinLv {
            pool: pool.full_name(),
            size_bytes,
            active_on: None,
        });
        Self::record(&mut state, "create_thin_lv", node, lv);
        Ok(())
    }

    async fn snapshot_thin_lv(&self, node: &NodeId, source: &LvRef, target: &LvRef) -> Result<(), VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("snapshot_thin_lv", node)?;
        let source_lv = state
            .lvs
            .get(&source.full_name())
            .cloned()
            .ok_or_else(|| failed(node, "lvcreate --snapshot", "Failed to find logical volume"))?;
        if state
            .pools
            .get(&source_lv.pool)
            .and_then(|p| p.active_on.as_ref())
            .is_some_and(|a| a != node)
        {
            return Err(VolumeError::ActiveElsewhere { lv: source_lv.pool });
        }
        state.lvs.entry(target.full_name()).or_insert(ThinLv {
            pool: source_lv.pool,
            size_bytes: source_lv.size_bytes,
            active_on: None,
        });
        Self::record(&mut state, "snapshot_thin_lv", node, target);
        Ok(())
    }

    async fn activate_thin_pool(&self, node: &NodeId, pool: &LvRef) -> Result<(), VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("activate_thin_pool", node)?;
        let entry = state
            .pools
            .get_mut(&pool.full_name())
            .ok_or_else(|| failed(node, "lvchange", "Failed to find logical volume"))?;
        if entry.active_on.as_ref().is_some_and(|active| active != node) {
            return Err(VolumeError::ActiveElsewhere { lv: pool.full_name() });
        }
        entry.active_on = Some(node.clone());
        Self::record(&mut state, "activate_thin_pool", node, pool);
        Ok(())
    }

    async fn deactivate_thin_pool(&self, node: &NodeId, pool: &LvRef) -> Result<(), VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("deactivate_thin_pool", node)?;
        let full = pool.full_name();
        if state
            .lvs
            .values()
            .any(|lv| lv.pool == full && lv.active_on.as_ref() == Some(node))
        {
            return Err(failed(node, "lvchange --activate n", "thin pool has active thin volumes").into());
        }
        if let Some(entry) = state.pools.get_mut(&full) {
            if entry.active_on.as_ref() == Some(node) {
                entry.active_on = None;
            }
        }
        Self::record(&mut state, "deactivate_thin_pool", node, pool);
        Ok(())
    }

    async fn activate_thin_lv(&self, node: &NodeId, lv: &LvRef) -> Result<PathBuf, VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("activate_thin_lv", node)?;
        let thin = state
            .lvs
            .get(&lv.full_name())
            .cloned()
            .ok_or_else(|| failed(node, "lvchange", "Failed to find logical volume"))?;
        let pool_here = state
            .pools
            .get(&thin.pool)
            .is_some_and(|p| p.active_on.as_ref() == Some(node));
        if !pool_here {
            return Err(VolumeError::ActiveElsewhere { lv: thin.pool });
        }
        if thin.active_on.as_ref().is_some_and(|a| a != node) {
            return Err(VolumeError::ActiveElsewhere { lv: lv.full_name() });
        }
        if let Some(entry) = state.lvs.get_mut(&lv.full_name()) {
            entry.active_on = Some(node.clone());
        }
        Self::record(&mut state, "activate_thin_lv", node, lv);
        Ok(lv.device_path())
    }

    async fn deactivate_thin_lv(&self, node: &NodeId, lv: &LvRef) -> Result<(), VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("deactivate_thin_lv", node)?;
        let path = lv.device_path();
        if state
            .exports
            .iter()
            .any(|((n, _), backing)| n == node && backing == &path)
        {
            return Err(failed(node, "lvchange --activate n", "Logical volume in use").into());
        }
        if let Some(entry) = state.lvs.get_mut(&lv.full_name()) {
            if entry.active_on.as_ref() == Some(node) {
                entry.active_on = None;
            }
        }
        Self::record(&mut state, "deactivate_thin_lv", node, lv);
        Ok(())
    }

    async fn extend_lv(&self, node: &NodeId, lv: &LvRef, size_bytes: u64) -> Result<(), VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("extend_lv", node)?;
        let pool = state
            .lvs
            .get(&lv.full_name())
            .map(|l| l.pool.clone())
            .ok_or_else(|| failed(node, "lvextend", "Failed to find logical volume"))?;
        if state
            .pools
            .get(&pool)
            .and_then(|p| p.active_on.as_ref())
            .is_some_and(|a| a != node)
        {
            return Err(VolumeError::ActiveElsewhere { lv: pool });
        }
        if let Some(entry) = state.lvs.get_mut(&lv.full_name()) {
            entry.size_bytes = entry.size_bytes.max(size_bytes);
        }
        Self::record(&mut state, "extend_lv", node, lv);
        Ok(())
    }

    async fn remove_lv(&self, node: &NodeId, lv: &LvRef) -> Result<(), VolumeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("remove_lv", node)?;
        let full = lv.full_name();
        if let Some(thin) = state.lvs.get(&full).cloned() {
            if thin.active_on.is_some() {
                return Err(failed(node, "lvremove", "Logical volume is active").into());
            }
            if state
                .pools
                .get(&thin.pool)
                .and_then(|p| p.active_on.as_ref())
                .is_some_and(|a| a != node)
            {
                return Err(VolumeError::ActiveElsewhere { lv: thin.pool });
            }
            state.lvs.remove(&full);
        } else if let Some(pool) = state.pools.get(&full).cloned() {
            if state.lvs.values().any(|l| l.pool == full) {
                return Err(failed(node, "lvremove", "thin pool still has thin volumes").into());
            }
            if pool.active_on.is_some() {
                return Err(failed(node, "lvremove", "Logical volume is active").into());
            }
            state.pools.remove(&full);
        }
        Self::record(&mut state, "remove_lv", node, lv);
        Ok(())
    }
}

#[async_trait]
impl RelayService for SimulatedCluster {
    async fn start_server(&self, node: &NodeId, export: &str, backing_path: &Path) -> Result<String, RelayError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("start_server", node)?;
        let key = (node.clone(), export.to_string());
        if !state.exports.contains_key(&key) {
            let lv_active_here = state
                .lvs
                .iter()
                .any(|(name, lv)| lv_path(name) == backing_path && lv.active_on.as_ref() == Some(node));
            if !lv_active_here {
                return Err(failed(node, "blockdev-add", "Could not open device").into());
            }
            state.exports.insert(key, backing_path.to_path_buf());
        }
        Self::record(&mut state, "start_server", node, export);
        Ok(ServerIdentity::new(node.clone(), export).uri(node.as_str()))
    }

    async fn stop_server(&self, node: &NodeId, export: &str) -> Result<(), RelayError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("stop_server", node)?;
        state.exports.remove(&(node.clone(), export.to_string()));
        Self::record(&mut state, "stop_server", node, export);
        Ok(())
    }

    async fn check_health(&self, node: &NodeId, export: &str) -> Result<(), RelayError> {
        let state = self.state.lock();
        if state.exports.contains_key(&(node.clone(), export.to_string())) {
            Ok(())
        } else {
            Err(RelayError::ExportMissing {
                node: node.clone(),
                export: export.to_string(),
            })
        }
    }

    async fn connect_client(&self, node: &NodeId, server: &ServerIdentity) -> Result<PathBuf, RelayError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("connect_client", node)?;
        if let Some(((_, device), _)) = state
            .clients
            .iter()
            .find(|((n, _), s)| n == node && s.export == server.export)
        {
            return Ok(device.clone());
        }
        if !state
            .exports
            .contains_key(&(server.node.clone(), server.export.clone()))
        {
            return Err(failed(node, "nbd-client", "Connection refused").into());
        }
        let index = state.next_nbd.entry(node.clone()).or_insert(0);
        let device = PathBuf::from(format!("/dev/nbd{}", index));
        *index += 1;
        state.clients.insert((node.clone(), device.clone()), server.clone());
        Self::record(&mut state, "connect_client", node, server);
        Ok(device)
    }

    async fn disconnect_client(&self, node: &NodeId, device: &Path) -> Result<(), RelayError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("disconnect_client", node)?;
        state.clients.remove(&(node.clone(), device.to_path_buf()));
        Self::record(&mut state, "disconnect_client", node, device.display());
        Ok(())
    }

    async fn client_device(&self, node: &NodeId, export: &str) -> Result<Option<PathBuf>, RelayError> {
        let state = self.state.lock();
        Ok(state
            .clients
            .iter()
            .find(|((n, _), s)| n == node && s.export == export)
            .map(|((_, device), _)| device.clone()))
    }
}

#[async_trait]
impl DualDeviceMapper for SimulatedCluster {
    async fn create(&self, node: &NodeId, name: &BlobName, size_bytes: u64) -> Result<PathBuf, DeviceMapperError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("dm_create", node)?;
        state
            .dm
            .entry((node.clone(), name.clone()))
            .or_insert(DmPair {
                size_bytes,
                lower: LowerTable::Error,
                path_failed: true,
            });
        Self::record(&mut state, "dm_create", node, name);
        Ok(name.dm_path())
    }

    async fn resume(
        &self,
        node: &NodeId,
        name: &BlobName,
        _size_bytes: u64,
        backing: &Path,
    ) -> Result<(), DeviceMapperError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("dm_resume", node)?;
        if !state.backing_valid(node, backing) {
            return Err(failed(node, "dmsetup load", "No such device or address").into());
        }
        let pair = state
            .dm
            .get_mut(&(node.clone(), name.clone()))
            .ok_or_else(|| failed(node, "dmsetup load", "No such device or address"))?;
        pair.lower = LowerTable::Linear(backing.to_path_buf());
        pair.path_failed = false;
        Self::record(&mut state, "dm_resume", node, name);
        Ok(())
    }

    async fn suspend(&self, node: &NodeId, name: &BlobName, _skip_fs_sync: bool) -> Result<(), DeviceMapperError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("dm_suspend", node)?;
        let pair = state
            .dm
            .get_mut(&(node.clone(), name.clone()))
            .ok_or_else(|| failed(node, "dmsetup message", "No such device or address"))?;
        let current = match &pair.lower {
            LowerTable::Linear(backing) => Some(backing.clone()),
            LowerTable::Suspended(backing) => backing.clone(),
            LowerTable::Error => None,
        };
        pair.lower = LowerTable::Suspended(current);
        pair.path_failed = true;
        Self::record(&mut state, "dm_suspend", node, name);
        Ok(())
    }

    async fn remove(&self, node: &NodeId, name: &BlobName) -> Result<(), DeviceMapperError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.take_fault("dm_remove", node)?;
        state.dm.remove(&(node.clone(), name.clone()));
        Self::record(&mut state, "dm_remove", node, name);
        Ok(())
    }
}

impl SimulatedCluster {
    /// Nodes that have at least one device-mapper pair.
    pub fn dm_nodes(&self) -> BTreeSet<NodeId> {
        self.state.lock().dm.keys().map(|(n, _)| n.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> (LvRef, LvRef) {
        (LvRef::new("vg0", "p-thinpool"), LvRef::new("vg0", "a"))
    }

    #[tokio::test]
    async fn test_exclusive_activation() {
        let sim = SimulatedCluster::new();
        let (pool, lv) = refs();
        let n1 = NodeId::from("n1");
        let n2 = NodeId::from("n2");
        sim.create_thin_pool(&n1, &pool, 1 << 30).await.unwrap();
        sim.create_thin_lv(&n1, &pool, &lv, 4096).await.unwrap();

        sim.activate_thin_pool(&n1, &pool).await.unwrap();
        assert!(matches!(
            sim.activate_thin_pool(&n2, &pool).await,
            Err(VolumeError::ActiveElsewhere { .. })
        ));
        assert!(matches!(
            sim.activate_thin_lv(&n2, &lv).await,
            Err(VolumeError::ActiveElsewhere { .. })
        ));

        sim.activate_thin_lv(&n1, &lv).await.unwrap();
        assert!(sim.deactivate_thin_pool(&n1, &pool).await.is_err());
        sim.deactivate_thin_lv(&n1, &lv).await.unwrap();
        sim.deactivate_thin_pool(&n1, &pool).await.unwrap();
        sim.activate_thin_pool(&n2, &pool).await.unwrap();
        assert_eq!(sim.pool_active_on(&pool), Some(n2));
    }

    #[tokio::test]
    async fn test_relay_requires_active_lv_and_export() {
        let sim = SimulatedCluster::new();
        let (pool, lv) = refs();
        let n1 = NodeId::from("n1");
        let n2 = NodeId::from("n2");
        sim.create_thin_pool(&n1, &pool, 1 << 30).await.unwrap();
        sim.create_thin_lv(&n1, &pool, &lv, 4096).await.unwrap();

        assert!(sim.start_server(&n1, "a", &lv.device_path()).await.is_err());
        let server = ServerIdentity::new(n1.clone(), "a");
        assert!(sim.connect_client(&n2, &server).await.is_err());

        sim.activate_thin_pool(&n1, &pool).await.unwrap();
        sim.activate_thin_lv(&n1, &lv).await.unwrap();
        sim.start_server(&n1, "a", &lv.device_path()).await.unwrap();
        let device = sim.connect_client(&n2, &server).await.unwrap();
        assert_eq!(sim.connect_client(&n2, &server).await.unwrap(), device);
        assert_eq!(sim.client_device(&n2, "a").await.unwrap(), Some(device));

        assert!(sim.deactivate_thin_lv(&n1, &lv).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let sim = SimulatedCluster::new();
        let n1 = NodeId::from("n1");
        sim.fail_next("dm_create");
        assert!(sim.create(&n1, &BlobName::from("a"), 4096).await.is_err());
        assert!(sim.create(&n1, &BlobName::from("a"), 4096).await.is_ok());
    }
}
