// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Activation Reconcilers
//!
//! Two cooperating loops over the declarative [`PoolActivation`] resource:
//!
//! - [`PoolActivationReconciler`] owns the work-item mutation path and keeps
//!   the pool's node assignment consistent with its pending work.
//! - [`NodeActivationReconciler`] (one per node) makes the node's holders
//!   match what the assignment asks of it, running engine calls on the
//!   [`TaskRegistry`] so no invocation blocks for the length of an attach or
//!   a migration. On the pool's active node it also restarts relay exports
//!   that vanished under relayed holders (e.g. the storage daemon restarted).
//!
//! A reconcile call returns `Converged`, `NotYet` or an error. `NotYet` is a
//! normal outcome meaning "call me again on the next trigger".

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::attachment::{AttachmentError, AttachmentService};
use crate::application::workers::{TaskError, TaskRegistry, TaskStatus};
use crate::domain::activation::{ActivationDecision, PoolActivation, WorkItem, WorkItemId};
use crate::domain::events::ActivationEvent;
use crate::domain::node_config::AttachmentConfig;
use crate::domain::pool::{Holder, NodeId, PoolName};
use crate::domain::relay::{RelayError, RelayService};
use crate::domain::repository::{ActivationRepository, RepositoryError, Versioned};
use crate::domain::volume::LvRef;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Converged,
    NotYet { reason: String },
}

impl ReconcileOutcome {
    pub fn not_yet(reason: impl Into<String>) -> Self {
        Self::NotYet { reason: reason.into() }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Gave up updating activation of {pool} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { pool: PoolName, attempts: u32 },
}

// ============================================================================
// Pool activation reconciler
// ============================================================================

pub struct PoolActivationReconciler {
    activations: Arc<dyn ActivationRepository>,
    event_bus: Arc<EventBus>,
    config: AttachmentConfig,
}

impl PoolActivationReconciler {
    pub fn new(activations: Arc<dyn ActivationRepository>, event_bus: Arc<EventBus>, config: AttachmentConfig) -> Self {
        Self {
            activations,
            event_bus,
            config,
        }
    }

    /// Apply `mutate` to the pool's activation resource under CAS, creating
    /// the resource if needed. The policy runs on every write.
    async fn mutate<F>(&self, pool: &PoolName, mut mutate: F) -> Result<PoolActivation, ReconcileError>
    where
        F: FnMut(&mut PoolActivation),
    {
        let mut tries = 0;
        loop {
            tries += 1;
            let (mut activation, expected) = match self.activations.get(pool).await? {
                Some(Versioned { value, version }) => (value, Some(version)),
                None => (PoolActivation::new(pool.clone()), None),
            };
            let before = activation.clone();
            mutate(&mut activation);
            let decision = activation.apply_policy();
            if activation == before {
                return Ok(activation);
            }

            match self.activations.compare_and_swap(pool, expected, &activation).await {
                Ok(_) => {
                    if before.work_items != activation.work_items || before.assigned_node != activation.assigned_node {
                        debug!(pool = %pool, decision = ?decision, assigned = ?activation.assigned_node, "Activation updated");
                        self.event_bus.publish_activation_event(ActivationEvent::WorkItemsChanged {
                            pool: pool.clone(),
                            assigned_node: activation.assigned_node.clone(),
                            changed_at: Utc::now(),
                        });
                    }
                    return Ok(activation);
                }
                Err(e) if e.is_conflict() && tries < self.config.cas_max_attempts => {
                    tokio::time::sleep(self.config.backoff(tries)).await;
                }
                Err(e) if e.is_conflict() => {
                    return Err(ReconcileError::ConflictRetriesExhausted {
                        pool: pool.clone(),
                        attempts: tries,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn add_work_item(&self, pool: &PoolName, item: WorkItem) -> Result<PoolActivation, ReconcileError> {
        info!(pool = %pool, blob = %item.blob, kind = item.kind.label(), requester = %item.requester, "Work item added");
        self.mutate(pool, |activation| {
            activation.add_work_item(item.clone());
        })
        .await
    }

    pub async fn complete_work_item(&self, pool: &PoolName, id: WorkItemId) -> Result<PoolActivation, ReconcileError> {
        self.mutate(pool, |activation| {
            activation.complete_work_item(id);
        })
        .await
    }

    /// Re-derive the assignment from the stored work items.
    pub async fn reconcile(&self, pool: &PoolName) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(Versioned { value, .. }) = self.activations.get(pool).await? else {
            return Ok(ReconcileOutcome::Converged);
        };
        let mut normalized = value.clone();
        if normalized.apply_policy() != ActivationDecision::Keep {
            self.mutate(pool, |_| {}).await?;
        }
        Ok(ReconcileOutcome::Converged)
    }

    pub async fn get(&self, pool: &PoolName) -> Result<Option<PoolActivation>, ReconcileError> {
        Ok(self.activations.get(pool).await?.map(|v| v.value))
    }
}

// ============================================================================
// Node activation reconciler
// ============================================================================

pub struct NodeActivationReconciler {
    node: NodeId,
    activations: Arc<dyn ActivationRepository>,
    attachments: Arc<dyn AttachmentService>,
    relay: Arc<dyn RelayService>,
    tasks: TaskRegistry<Result<(), AttachmentError>>,
    event_bus: Arc<EventBus>,
}

fn attach_key(holder: &Holder) -> String {
    format!("attach/{}/{}/{}", holder.node, holder.blob, holder.cookie)
}

fn detach_key(holder: &Holder) -> String {
    format!("detach/{}/{}/{}", holder.node, holder.blob, holder.cookie)
}

impl NodeActivationReconciler {
    pub fn new(
        node: NodeId,
        activations: Arc<dyn ActivationRepository>,
        attachments: Arc<dyn AttachmentService>,
        relay: Arc<dyn RelayService>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            node,
            activations,
            attachments,
            relay,
            tasks: TaskRegistry::new(),
            event_bus,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn shutdown(&self) {
        self.tasks.cancel_all();
    }

    fn spawn(&self, pool: &PoolName, key: String, holder: Holder, attach: bool) {
        let attachments = self.attachments.clone();
        let event_bus = self.event_bus.clone();
        let pool = pool.clone();
        let node = self.node.clone();
        let task = key.clone();
        let work = async move {
            if attach {
                attachments
                    .attach_blob(&holder.blob, Some(holder.node.clone()), &holder.cookie)
                    .await
                    .map(|_| ())
            } else {
                attachments
                    .detach_blob(&holder.blob, &holder.node, &holder.cookie)
                    .await
            }
        };
        // the next reconcile of this pool picks the result up
        self.tasks.start_with(key, work, move |result| {
            event_bus.publish_activation_event(ActivationEvent::TaskFinished {
                pool,
                node,
                task,
                succeeded: result.is_ok(),
                finished_at: Utc::now(),
            });
        });
    }

    /// Poll or start the task for `holder`. `Some(true)` when it finished
    /// successfully, `None` while it runs.
    fn drive(
        &self,
        pool: &PoolName,
        holder: &Holder,
        attach: bool,
        failure: &mut Option<ReconcileError>,
    ) -> Option<bool> {
        let key = if attach { attach_key(holder) } else { detach_key(holder) };
        match self.tasks.poll(&key) {
            TaskStatus::Absent => {
                self.spawn(pool, key, holder.clone(), attach);
                None
            }
            TaskStatus::Pending => None,
            TaskStatus::Done(Ok(Ok(()))) => Some(true),
            TaskStatus::Done(Ok(Err(e))) => {
                warn!(pool = %pool, holder = %holder, attach, error = %e, "Activation task failed");
                failure.get_or_insert(e.into());
                Some(false)
            }
            TaskStatus::Done(Err(e)) => {
                failure.get_or_insert(e.into());
                Some(false)
            }
        }
    }

    /// Restart exports this node should serve but no longer does. Returns
    /// the exports restarted.
    async fn heal_exports(&self, pool: &PoolName) -> Result<Vec<String>, ReconcileError> {
        let Some(state) = self.attachments.get_pool(pool).await? else {
            return Ok(Vec::new());
        };
        if state.active_on.as_ref() != Some(&self.node) {
            return Ok(Vec::new());
        }

        let mut restarted = Vec::new();
        for blob in state.held_blobs() {
            if state.nodes_holding(&blob).iter().all(|n| n == &self.node) {
                continue;
            }
            let export = blob.export_id();
            match self.relay.check_health(&self.node, export).await {
                Ok(()) => {}
                Err(RelayError::ExportMissing { .. }) => {
                    warn!(pool = %pool, node = %self.node, export, "Relay export vanished; restarting it");
                    let lv = LvRef::new(state.volume_group.clone(), blob.lv_name());
                    self.relay
                        .start_server(&self.node, export, &lv.device_path())
                        .await
                        .map_err(AttachmentError::from)?;
                    restarted.push(export.to_string());
                }
                Err(e) => return Err(AttachmentError::from(e).into()),
            }
        }
        Ok(restarted)
    }

    pub async fn reconcile(&self, pool: &PoolName) -> Result<ReconcileOutcome, ReconcileError> {
        let restarted = self.heal_exports(pool).await?;
        if !restarted.is_empty() {
            return Ok(ReconcileOutcome::not_yet(format!("restarted relay export(s) {}", restarted.join(", "))));
        }

        let Some(Versioned { value: activation, version }) = self.activations.get(pool).await? else {
            return Ok(ReconcileOutcome::Converged);
        };

        let desired = activation.desired_holders_for(&self.node);
        let observed = activation.observed_on(&self.node);
        if desired.is_empty() && activation.awaiting_assignment(&self.node) {
            return Ok(ReconcileOutcome::not_yet("pool has pending work but no assigned node"));
        }

        let mut now_observed: BTreeSet<Holder> = observed.clone();
        let mut running = 0usize;
        let mut failure = None;

        for holder in desired.difference(&observed) {
            match self.drive(pool, holder, true, &mut failure) {
                Some(true) => {
                    now_observed.insert(holder.clone());
                }
                Some(false) => {}
                None => running += 1,
            }
        }
        for holder in observed.difference(&desired) {
            match self.drive(pool, holder, false, &mut failure) {
                Some(true) => {
                    now_observed.remove(holder);
                }
                Some(false) => {}
                None => running += 1,
            }
        }

        if now_observed != observed {
            let mut updated = activation.clone();
            updated.observed.retain(|h| h.node != self.node);
            updated.observed.extend(now_observed);
            match self.activations.compare_and_swap(pool, Some(version), &updated).await {
                Ok(_) => debug!(pool = %pool, node = %self.node, "Observed holders updated"),
                // tasks already reaped; they are idempotent and rerun next time
                Err(e) if e.is_conflict() => {
                    return Ok(ReconcileOutcome::not_yet("activation changed while reconciling"))
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }
        if running > 0 {
            return Ok(ReconcileOutcome::not_yet(format!("{} activation task(s) running", running)));
        }
        Ok(ReconcileOutcome::Converged)
    }
}
