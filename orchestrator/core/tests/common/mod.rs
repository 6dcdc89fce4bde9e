// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared harness: a simulated cluster with one attachment engine per node,
//! all talking to the same in-memory state store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lvblob_core::application::attachment::StandardAttachmentService;
use lvblob_core::application::blob_manager::{BlobService, StandardBlobService};
use lvblob_core::application::host::HostAdapters;
use lvblob_core::application::repository_factory::Repositories;
use lvblob_core::domain::blob::{Blob, BlobName};
use lvblob_core::domain::node_config::AttachmentConfig;
use lvblob_core::domain::pool::{NodeId, PoolName, PoolState};
use lvblob_core::domain::repository::PoolStateStore;
use lvblob_core::infrastructure::event_bus::EventBus;
use lvblob_core::infrastructure::simulated::SimulatedCluster;

pub const VG: &str = "vg0";
pub const BLOB_SIZE: u64 = 1 << 30;

pub fn fast_retries() -> AttachmentConfig {
    AttachmentConfig {
        cas_max_attempts: 50,
        backoff_initial_ms: 1,
        backoff_max_ms: 5,
    }
}

pub struct TestCluster {
    pub sim: SimulatedCluster,
    pub repositories: Repositories,
    pub event_bus: Arc<EventBus>,
    engines: HashMap<NodeId, Arc<StandardAttachmentService>>,
    blob_services: HashMap<NodeId, Arc<StandardBlobService>>,
}

impl TestCluster {
    pub fn new(nodes: &[&str]) -> Self {
        let sim = SimulatedCluster::new();
        let repositories = Repositories::in_memory();
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let adapters = HostAdapters::simulated(&sim);

        let mut engines = HashMap::new();
        let mut blob_services = HashMap::new();
        for node in nodes {
            let id = NodeId::from(*node);
            engines.insert(
                id.clone(),
                Arc::new(StandardAttachmentService::new(
                    id.clone(),
                    repositories.pools.clone(),
                    repositories.blobs.clone(),
                    adapters.clone(),
                    event_bus.clone(),
                    fast_retries(),
                )),
            );
            blob_services.insert(
                id.clone(),
                Arc::new(StandardBlobService::new(
                    id,
                    repositories.pools.clone(),
                    repositories.blobs.clone(),
                    adapters.clone(),
                    event_bus.clone(),
                    fast_retries(),
                )),
            );
        }

        Self {
            sim,
            repositories,
            event_bus,
            engines,
            blob_services,
        }
    }

    pub fn engine(&self, node: &str) -> Arc<StandardAttachmentService> {
        self.engines[&NodeId::from(node)].clone()
    }

    pub fn blobs(&self, node: &str) -> Arc<StandardBlobService> {
        self.blob_services[&NodeId::from(node)].clone()
    }

    pub async fn create_blob(&self, node: &str, name: &str) -> Blob {
        self.blobs(node)
            .create_blob(BlobName::from(name), VG, BLOB_SIZE)
            .await
            .expect("create blob")
    }

    pub async fn pool(&self, pool: &str) -> PoolState {
        self.repositories
            .pools
            .get(&PoolName::from(pool))
            .await
            .expect("read pool")
            .expect("pool exists")
            .value
    }

    /// Assert the record's invariants and that the simulated hosts match it.
    pub async fn assert_consistent(&self, pool: &str) {
        let state = self.pool(pool).await;
        state.check_invariants().expect("record invariants");
        self.sim.verify_pool(&state).expect("physical state matches record");
    }
}

pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
