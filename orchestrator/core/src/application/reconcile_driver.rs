// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Reconcile Driver
//!
//! Subscribes to the event bus and re-runs the pool and node reconcilers for
//! the pool an event names. Invocations for the same pool never overlap;
//! different pools reconcile concurrently. There is no timer: every trigger
//! is an event (work items changed, an attachment committed, a background
//! task finished).

use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::locks::KeyedLocks;
use crate::application::reconciler::{
    NodeActivationReconciler, PoolActivationReconciler, ReconcileError, ReconcileOutcome,
};
use crate::domain::pool::PoolName;
use crate::domain::repository::ActivationRepository;
use crate::infrastructure::event_bus::{DomainEvent, EventBus, EventBusError};

const RESYNC_CONCURRENCY: usize = 8;

pub struct ReconcileDriver {
    pool_reconciler: Arc<PoolActivationReconciler>,
    node_reconciler: Arc<NodeActivationReconciler>,
    activations: Arc<dyn ActivationRepository>,
    event_bus: Arc<EventBus>,
    locks: KeyedLocks<PoolName>,
}

impl ReconcileDriver {
    pub fn new(
        pool_reconciler: Arc<PoolActivationReconciler>,
        node_reconciler: Arc<NodeActivationReconciler>,
        activations: Arc<dyn ActivationRepository>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            pool_reconciler,
            node_reconciler,
            activations,
            event_bus,
            locks: KeyedLocks::new(),
        }
    }

    /// Run both reconcilers for `pool`, serialized per pool.
    pub async fn reconcile_pool(&self, pool: &PoolName) -> Result<ReconcileOutcome, ReconcileError> {
        self.locks.run(pool, self.reconcile_locked(pool)).await
    }

    /// Pools with a reconcile running or queued.
    pub fn busy_pools(&self) -> usize {
        self.locks.len()
    }

    async fn reconcile_locked(&self, pool: &PoolName) -> Result<ReconcileOutcome, ReconcileError> {
        self.pool_reconciler.reconcile(pool).await?;
        let outcome = self.node_reconciler.reconcile(pool).await?;
        match &outcome {
            ReconcileOutcome::Converged => debug!(pool = %pool, node = %self.node_reconciler.node(), "Converged"),
            ReconcileOutcome::NotYet { reason } => {
                debug!(pool = %pool, node = %self.node_reconciler.node(), reason = %reason, "Not yet converged")
            }
        }
        Ok(outcome)
    }

    /// Reconcile every pool that has an activation resource.
    pub async fn resync(&self) -> Result<usize, ReconcileError> {
        let pools: Vec<PoolName> = self
            .activations
            .list()
            .await?
            .into_iter()
            .map(|v| v.value.pool)
            .collect();
        let count = pools.len();
        futures::stream::iter(pools)
            .for_each_concurrent(RESYNC_CONCURRENCY, |pool| async move {
                if let Err(e) = self.reconcile_pool(&pool).await {
                    warn!(pool = %pool, error = %e, "Reconcile failed during resync");
                }
            })
            .await;
        Ok(count)
    }

    fn trigger(self: &Arc<Self>, pool: PoolName) {
        let driver = self.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.reconcile_pool(&pool).await {
                error!(pool = %pool, error = %e, "Reconcile failed");
            }
        });
    }

    /// Start the event loop. Runs until `shutdown` fires or the bus closes.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(node = %self.node_reconciler.node(), "Starting reconcile driver");

        tokio::spawn(async move {
            let mut receiver = self.event_bus.subscribe();
            if let Err(e) = self.resync().await {
                warn!(error = %e, "Initial resync failed");
            }

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Ok(DomainEvent::Blob(_)) => continue,
                    Ok(event) => self.trigger(event.pool().clone()),
                    Err(EventBusError::Lagged(n)) => {
                        warn!(missed = n, "Reconcile driver lagged; resyncing all pools");
                        let driver = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = driver.resync().await {
                                error!(error = %e, "Resync failed");
                            }
                        });
                    }
                    Err(EventBusError::Closed) => break,
                    Err(EventBusError::Empty) => continue,
                }
            }

            self.node_reconciler.shutdown();
            info!("Reconcile driver stopped");
        })
    }
}
