// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Composition root: wires the stores, host adapters and services of one
//! node from its [`NodeConfigSpec`].

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::attachment::StandardAttachmentService;
use crate::application::blob_manager::StandardBlobService;
use crate::application::host::HostAdapters;
use crate::application::reconcile_driver::ReconcileDriver;
use crate::application::reconciler::{NodeActivationReconciler, PoolActivationReconciler};
use crate::application::repository_factory::{create_repositories, Repositories};
use crate::domain::node_config::NodeConfigSpec;
use crate::domain::pool::NodeId;
use crate::infrastructure::event_bus::EventBus;

pub struct NodeServices {
    pub node: NodeId,
    pub repositories: Repositories,
    pub adapters: HostAdapters,
    pub event_bus: Arc<EventBus>,
    pub attachments: Arc<StandardAttachmentService>,
    pub blobs: Arc<StandardBlobService>,
    pub activation: Arc<PoolActivationReconciler>,
    pub driver: Arc<ReconcileDriver>,
}

impl NodeServices {
    /// Connect to the configured store and build real host adapters.
    pub async fn from_config(spec: &NodeConfigSpec) -> Result<Self> {
        let repositories = create_repositories(&spec.storage.backend)
            .await
            .context("Failed to initialize state store")?;
        Ok(Self::assemble(spec, repositories, HostAdapters::from_config(spec)))
    }

    pub fn assemble(spec: &NodeConfigSpec, repositories: Repositories, adapters: HostAdapters) -> Self {
        let node = spec.node_id();
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let config = spec.attachment.clone();

        let attachments = Arc::new(StandardAttachmentService::new(
            node.clone(),
            repositories.pools.clone(),
            repositories.blobs.clone(),
            adapters.clone(),
            event_bus.clone(),
            config.clone(),
        ));
        let blobs = Arc::new(StandardBlobService::new(
            node.clone(),
            repositories.pools.clone(),
            repositories.blobs.clone(),
            adapters.clone(),
            event_bus.clone(),
            config.clone(),
        ));
        let activation = Arc::new(PoolActivationReconciler::new(
            repositories.activations.clone(),
            event_bus.clone(),
            config,
        ));
        let node_reconciler = Arc::new(NodeActivationReconciler::new(
            node.clone(),
            repositories.activations.clone(),
            attachments.clone(),
            adapters.relay.clone(),
            event_bus.clone(),
        ));
        let driver = Arc::new(ReconcileDriver::new(
            activation.clone(),
            node_reconciler,
            repositories.activations.clone(),
            event_bus.clone(),
        ));

        Self {
            node,
            repositories,
            adapters,
            event_bus,
            attachments,
            blobs,
            activation,
            driver,
        }
    }

    /// Start the event-driven reconcile loop.
    pub fn start_reconciler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.driver.clone().start(shutdown)
    }
}
