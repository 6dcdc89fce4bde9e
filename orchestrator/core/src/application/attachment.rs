// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Attachment Engine Application Service
//!
//! Attach, detach and optimize blobs across the cluster. Every operation
//! follows the same shape:
//!
//! 1. read the pool record and its version,
//! 2. validate the record's invariants,
//! 3. perform the host side effects (all idempotent),
//! 4. commit the new record with one compare-and-swap.
//!
//! Nothing is committed when a side effect fails, so callers simply retry the
//! whole call. A CAS conflict means another caller got there first; the call
//! backs off and starts over from step 1. A detach or migration that already
//! tore something down before losing its CAS first restores what the winning
//! record describes. Calls on one pool are serialized within this process.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::host::{blob_lv, pool_lv, HostAdapters};
use crate::application::locks::KeyedLocks;
use crate::application::migration::{BlobCatalog, PoolMigrator};
use crate::domain::blob::{Blob, BlobError, BlobName};
use crate::domain::device_mapper::DeviceMapperError;
use crate::domain::events::AttachmentEvent;
use crate::domain::node_config::AttachmentConfig;
use crate::domain::pool::{
    Holder, NodeId, PoolName, PoolPhaseEvent, PoolState, PoolTransitionEffect,
};
use crate::domain::relay::{RelayError, ServerIdentity};
use crate::domain::repository::{BlobRepository, PoolStateStore, RepositoryError, Version, Versioned};
use crate::domain::volume::VolumeError;
use crate::infrastructure::event_bus::EventBus;

// ============================================================================
// Errors
// ============================================================================

/// Coarse classification for user-facing surfaces (CLI exit codes, APIs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Blob not found: {0}")]
    BlobNotFound(BlobName),

    #[error("Pool not found: {0}")]
    PoolNotFound(PoolName),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    DeviceMapper(#[from] DeviceMapperError),

    #[error("State store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Gave up on pool {pool} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { pool: PoolName, attempts: u32 },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl AttachmentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidArgument(_)
            | Self::Blob(BlobError::InvalidName(_))
            | Self::Blob(BlobError::InvalidSize(_)) => ErrorCategory::InvalidArgument,
            Self::BlobNotFound(_)
            | Self::PoolNotFound(_)
            | Self::Blob(BlobError::NotFound(_))
            | Self::Repository(RepositoryError::NotFound(_)) => ErrorCategory::NotFound,
            Self::Blob(BlobError::AlreadyExists(_))
            | Self::Blob(BlobError::StillAttached { .. })
            | Self::Blob(BlobError::CannotShrink { .. }) => ErrorCategory::FailedPrecondition,
            _ => ErrorCategory::Internal,
        }
    }

    /// Whether starting the call over may succeed: a lost CAS race, or an
    /// exclusive activation held by a writer whose commit is still in flight.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Repository(e) if e.is_conflict())
            || matches!(self, Self::Volume(VolumeError::ActiveElsewhere { .. }))
    }
}

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait AttachmentService: Send + Sync {
    /// Attach `blob` on `node` (default: the pool's active node, else this
    /// node) for `cookie`. Returns the node used and the stable device path.
    async fn attach_blob(
        &self,
        blob: &BlobName,
        node: Option<NodeId>,
        cookie: &str,
    ) -> Result<(NodeId, PathBuf), AttachmentError>;

    /// Drop the `(blob, node, cookie)` holder. Detaching something that is
    /// not attached succeeds.
    async fn detach_blob(&self, blob: &BlobName, node: &NodeId, cookie: &str) -> Result<(), AttachmentError>;

    /// Move the pool to `node` when it holds `blob` through the relay and has
    /// more attachments in the pool than the active node. Returns whether a
    /// migration happened.
    async fn optimize_attachment_for_node(&self, blob: &BlobName, node: &NodeId) -> Result<bool, AttachmentError>;

    async fn get_pool(&self, pool: &PoolName) -> Result<Option<PoolState>, AttachmentError>;
}

// ============================================================================
// Standard Implementation
// ============================================================================

pub struct StandardAttachmentService {
    local_node: NodeId,
    pools: Arc<dyn PoolStateStore>,
    blobs: Arc<dyn BlobRepository>,
    adapters: HostAdapters,
    migrator: PoolMigrator,
    event_bus: Arc<EventBus>,
    config: AttachmentConfig,
    locks: KeyedLocks<PoolName>,
}

/// Physical state an attempt left behind when its CAS lost.
struct Uncommitted {
    state: PoolState,
    migrated: bool,
}

type UncommittedSlot = Mutex<Option<Uncommitted>>;

/// What an attempt changed, published once its CAS landed.
enum Committed<T> {
    Unchanged(T),
    Changed { value: T, events: Vec<AttachmentEvent> },
}

impl StandardAttachmentService {
    pub fn new(
        local_node: NodeId,
        pools: Arc<dyn PoolStateStore>,
        blobs: Arc<dyn BlobRepository>,
        adapters: HostAdapters,
        event_bus: Arc<EventBus>,
        config: AttachmentConfig,
    ) -> Self {
        Self {
            local_node,
            pools,
            blobs,
            migrator: PoolMigrator::new(adapters.clone()),
            adapters,
            event_bus,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Run `attempt` until it commits, backing off between retryable
    /// failures.
    async fn with_retries<T, F, Fut>(&self, pool_hint: &PoolName, mut attempt: F) -> Result<T, AttachmentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Committed<T>, AttachmentError>>,
    {
        let max_attempts = self.config.cas_max_attempts.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Ok(Committed::Unchanged(value)) => return Ok(value),
                Ok(Committed::Changed { value, events }) => {
                    for event in events {
                        self.event_bus.publish_attachment_event(event);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && tries < max_attempts => {
                    if matches!(e, AttachmentError::Repository(_)) {
                        metrics::counter!("lvblob_cas_conflicts_total").increment(1);
                    }
                    let delay = self.config.backoff(tries);
                    debug!(pool = %pool_hint, attempt = tries, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after conflict");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() && matches!(e, AttachmentError::Repository(_)) => {
                    metrics::counter!("lvblob_cas_conflicts_total").increment(1);
                    warn!(pool = %pool_hint, attempts = tries, "Conflict retries exhausted");
                    return Err(AttachmentError::ConflictRetriesExhausted {
                        pool: pool_hint.clone(),
                        attempts: tries,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_blob(&self, name: &BlobName) -> Result<Option<Blob>, AttachmentError> {
        Ok(self.blobs.find_by_name(name).await?)
    }

    /// Read the pool record and refuse to act on a corrupted one.
    async fn load_pool(&self, blob: &Blob) -> Result<Versioned<PoolState>, AttachmentError> {
        let versioned = self
            .pools
            .get(&blob.pool)
            .await?
            .ok_or_else(|| AttachmentError::PoolNotFound(blob.pool.clone()))?;

        if let Err(violation) = versioned.value.check_invariants() {
            error!(pool = %blob.pool, version = versioned.version.0, state = ?versioned.value, "{}", violation);
            return Err(AttachmentError::InvariantViolation(violation.to_string()));
        }
        if !versioned.value.blobs.contains(&blob.name) {
            let message = format!("blob {} is not registered in pool {}", blob.name, blob.pool);
            error!(pool = %blob.pool, state = ?versioned.value, "{}", message);
            return Err(AttachmentError::InvariantViolation(message));
        }
        Ok(versioned)
    }

    async fn catalog(&self, state: &PoolState) -> Result<BlobCatalog, AttachmentError> {
        let mut catalog = BlobCatalog::new();
        for name in state.held_blobs() {
            let blob = self
                .load_blob(&name)
                .await?
                .ok_or_else(|| AttachmentError::BlobNotFound(name.clone()))?;
            catalog.insert(name, blob);
        }
        Ok(catalog)
    }

    async fn commit(&self, state: &PoolState, version: Version) -> Result<Version, AttachmentError> {
        if let Err(violation) = state.check_invariants() {
            error!(pool = %state.name, state = ?state, "Refusing to commit: {}", violation);
            return Err(AttachmentError::InvariantViolation(violation.to_string()));
        }
        Ok(self.pools.compare_and_swap(&state.name, version, state).await?)
    }

    /// Commit after tearing something down; on a lost race remember what the
    /// hosts now look like so the next attempt can restore the winner's view.
    async fn commit_or_stash(
        &self,
        state: PoolState,
        version: Version,
        migrated: bool,
        slot: &UncommittedSlot,
    ) -> Result<PoolState, AttachmentError> {
        match self.commit(&state, version).await {
            Ok(_) => Ok(state),
            Err(e) => {
                if e.is_retryable() {
                    *slot.lock() = Some(Uncommitted { state, migrated });
                }
                Err(e)
            }
        }
    }

    /// Undo a stashed attempt against the freshly read `current` record.
    async fn restore(&self, slot: &UncommittedSlot, current: &PoolState) -> Result<(), AttachmentError> {
        let stashed = slot.lock().take();
        let Some(uncommitted) = stashed else {
            return Ok(());
        };
        let applied = &uncommitted.state;
        warn!(pool = %current.name, applied_on = ?applied.active_on, recorded_on = ?current.active_on, "Restoring after a lost commit");

        let result = async {
            if uncommitted.migrated {
                if let (Some(moved_to), Some(recorded)) = (&applied.active_on, &current.active_on) {
                    if moved_to != recorded {
                        let mut rollback = applied.clone();
                        let catalog = self.catalog(&rollback).await?;
                        self.migrator.migrate_pool(&mut rollback, &catalog, recorded).await?;
                    }
                }
            }
            let catalog = self.catalog(current).await?;
            self.migrator.restore(current, &catalog).await
        }
        .await;

        if result.is_err() {
            *slot.lock() = Some(uncommitted);
        }
        result
    }

    async fn try_attach(
        &self,
        blob: &Blob,
        node: Option<&NodeId>,
        cookie: &str,
    ) -> Result<Committed<(NodeId, PathBuf)>, AttachmentError> {
        let Versioned { value: mut state, version } = self.load_pool(blob).await?;

        let actual = node
            .or(state.active_on.as_ref())
            .unwrap_or(&self.local_node)
            .clone();
        let holder = Holder::new(blob.name.clone(), actual.clone(), cookie);
        let path = blob.name.dm_path();

        if state.contains(&holder) {
            debug!(holder = %holder, "Holder already present");
            return Ok(Committed::Unchanged((actual, path)));
        }

        let mut events = Vec::new();
        let now = Utc::now();
        let shared = state.has_attachment(&blob.name, &actual);

        let (phase, effect) = state
            .phase()
            .transition(PoolPhaseEvent::FirstHolderAttached { node: actual.clone() })
            .map_err(|e| AttachmentError::InvariantViolation(e.to_string()))?;
        if let PoolTransitionEffect::ActivateOn(target) = effect {
            self.adapters.volumes.activate_thin_pool(&target, &pool_lv(&state)).await?;
            info!(pool = %state.name, node = %target, "Pool activated");
            events.push(AttachmentEvent::PoolActivated {
                pool: state.name.clone(),
                node: target,
                activated_at: now,
            });
        }
        let active = phase
            .active_node()
            .cloned()
            .ok_or_else(|| AttachmentError::InvariantViolation(format!("pool {} has no active node", state.name)))?;
        state.active_on = Some(active.clone());
        if shared {
            // the shared device may have been torn down by a detach that lost its commit
            self.adapters.volumes.activate_thin_pool(&active, &pool_lv(&state)).await?;
        }

        let lv_path = self.adapters.volumes.activate_thin_lv(&active, &blob_lv(blob)).await?;
        let backing = if actual == active {
            lv_path
        } else {
            let export = blob.name.export_id();
            self.adapters.relay.start_server(&active, export, &lv_path).await?;
            self.adapters
                .relay
                .connect_client(&actual, &ServerIdentity::new(active.clone(), export))
                .await?
        };
        let dm_path = self
            .adapters
            .device_mapper
            .create(&actual, &blob.name, blob.size_bytes)
            .await?;
        self.adapters
            .device_mapper
            .resume(&actual, &blob.name, blob.size_bytes, &backing)
            .await?;
        debug!(blob = %blob.name, node = %actual, backing = %backing.display(), "Device attached");
        if dm_path != path {
            return Err(AttachmentError::InvariantViolation(format!(
                "device-mapper returned {} for {}",
                dm_path.display(),
                blob.name
            )));
        }

        state.holders.insert(holder.clone());
        self.commit(&state, version).await?;

        info!(holder = %holder, active_on = %active, "Blob attached");
        metrics::counter!("lvblob_attach_total").increment(1);
        events.push(AttachmentEvent::BlobAttached {
            pool: state.name.clone(),
            holder,
            path: path.clone(),
            direct: actual == active,
            attached_at: now,
        });
        Ok(Committed::Changed {
            value: (actual, path),
            events,
        })
    }

    async fn try_detach(
        &self,
        blob: &Blob,
        node: &NodeId,
        cookie: &str,
        uncommitted: &UncommittedSlot,
    ) -> Result<Committed<()>, AttachmentError> {
        let Versioned { value: mut state, version } = self.load_pool(blob).await?;
        self.restore(uncommitted, &state).await?;
        let holder = Holder::new(blob.name.clone(), node.clone(), cookie);

        if !state.contains(&holder) {
            debug!(holder = %holder, "Nothing to detach");
            return Ok(Committed::Unchanged(()));
        }
        let active = state
            .active_on
            .clone()
            .ok_or_else(|| AttachmentError::InvariantViolation(format!("pool {} has holders but no active node", state.name)))?;

        state.holders.remove(&holder);
        let export = blob.name.export_id();
        let now = Utc::now();
        let mut events = vec![AttachmentEvent::BlobDetached {
            pool: state.name.clone(),
            holder: holder.clone(),
            detached_at: now,
        }];

        let mut tore_down = false;
        if !state.has_attachment(&blob.name, node) {
            tore_down = true;
            self.adapters.device_mapper.remove(node, &blob.name).await?;
            if node != &active {
                if let Some(device) = self.adapters.relay.client_device(node, export).await? {
                    self.adapters.relay.disconnect_client(node, &device).await?;
                }
            }
            debug!(blob = %blob.name, node = %node, "Device detached");
        }

        if !state.blob_has_holders(&blob.name) {
            tore_down = true;
            self.adapters.relay.stop_server(&active, export).await?;
            self.adapters.volumes.deactivate_thin_lv(&active, &blob_lv(blob)).await?;
        }

        let mut migrated = false;
        if !state.node_holds_any(&active) {
            let successor = state.holder_nodes().into_iter().next();
            let (_, effect) = state
                .phase()
                .transition(PoolPhaseEvent::ActiveNodeEmptied { successor })
                .map_err(|e| AttachmentError::InvariantViolation(e.to_string()))?;
            match effect {
                PoolTransitionEffect::MigrateTo { from, to } => {
                    let catalog = self.catalog(&state).await?;
                    migrated = self.migrator.migrate_pool(&mut state, &catalog, &to).await?;
                    tore_down |= migrated;
                    events.push(AttachmentEvent::PoolMigrated {
                        pool: state.name.clone(),
                        from,
                        to,
                        migrated_at: now,
                    });
                }
                PoolTransitionEffect::DeactivateOn(target) => {
                    tore_down = true;
                    self.adapters
                        .volumes
                        .deactivate_thin_pool(&target, &pool_lv(&state))
                        .await?;
                    state.active_on = None;
                    events.push(AttachmentEvent::PoolDeactivated {
                        pool: state.name.clone(),
                        node: target,
                        deactivated_at: now,
                    });
                }
                PoolTransitionEffect::ActivateOn(_) | PoolTransitionEffect::None => {}
            }
        }

        let state = if tore_down {
            self.commit_or_stash(state, version, migrated, uncommitted).await?
        } else {
            self.commit(&state, version).await?;
            state
        };

        info!(holder = %holder, active_on = ?state.active_on, "Blob detached");
        metrics::counter!("lvblob_detach_total").increment(1);
        Ok(Committed::Changed { value: (), events })
    }

    async fn try_optimize(
        &self,
        blob: &Blob,
        node: &NodeId,
        uncommitted: &UncommittedSlot,
    ) -> Result<Committed<bool>, AttachmentError> {
        let Versioned { value: mut state, version } = self.load_pool(blob).await?;
        self.restore(uncommitted, &state).await?;

        let Some(active) = state.active_on.clone() else {
            return Ok(Committed::Unchanged(false));
        };
        if &active == node || !state.has_attachment(&blob.name, node) {
            return Ok(Committed::Unchanged(false));
        }
        let here = state.attachment_count(node);
        let there = state.attachment_count(&active);
        if here <= there {
            debug!(pool = %state.name, node = %node, here, there, "Active node keeps the pool");
            return Ok(Committed::Unchanged(false));
        }

        let (_, effect) = state
            .phase()
            .transition(PoolPhaseEvent::Optimized { node: node.clone() })
            .map_err(|e| AttachmentError::InvariantViolation(e.to_string()))?;
        let PoolTransitionEffect::MigrateTo { from, to } = effect else {
            return Ok(Committed::Unchanged(false));
        };

        let catalog = self.catalog(&state).await?;
        self.migrator.migrate_pool(&mut state, &catalog, &to).await?;
        let state = self.commit_or_stash(state, version, true, uncommitted).await?;

        info!(pool = %state.name, from = %from, to = %to, "Pool moved to its busiest node");
        Ok(Committed::Changed {
            value: true,
            events: vec![AttachmentEvent::PoolMigrated {
                pool: state.name.clone(),
                from,
                to,
                migrated_at: Utc::now(),
            }],
        })
    }
}

#[async_trait]
impl AttachmentService for StandardAttachmentService {
    async fn attach_blob(
        &self,
        blob: &BlobName,
        node: Option<NodeId>,
        cookie: &str,
    ) -> Result<(NodeId, PathBuf), AttachmentError> {
        if cookie.is_empty() {
            return Err(AttachmentError::InvalidArgument("cookie cannot be empty".to_string()));
        }
        let record = self
            .load_blob(blob)
            .await?
            .ok_or_else(|| AttachmentError::BlobNotFound(blob.clone()))?;
        let node = node.as_ref();

        self.locks
            .run(&record.pool, self.with_retries(&record.pool, || self.try_attach(&record, node, cookie)))
            .await
    }

    async fn detach_blob(&self, blob: &BlobName, node: &NodeId, cookie: &str) -> Result<(), AttachmentError> {
        let Some(record) = self.load_blob(blob).await? else {
            debug!(blob = %blob, "Detach of unknown blob");
            return Ok(());
        };

        let uncommitted = UncommittedSlot::default();
        self.locks
            .run(
                &record.pool,
                self.with_retries(&record.pool, || self.try_detach(&record, node, cookie, &uncommitted)),
            )
            .await
    }

    async fn optimize_attachment_for_node(&self, blob: &BlobName, node: &NodeId) -> Result<bool, AttachmentError> {
        let record = self
            .load_blob(blob)
            .await?
            .ok_or_else(|| AttachmentError::BlobNotFound(blob.clone()))?;

        let uncommitted = UncommittedSlot::default();
        self.locks
            .run(
                &record.pool,
                self.with_retries(&record.pool, || self.try_optimize(&record, node, &uncommitted)),
            )
            .await
    }

    async fn get_pool(&self, pool: &PoolName) -> Result<Option<PoolState>, AttachmentError> {
        Ok(self.pools.get(pool).await?.map(|v| v.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            AttachmentError::BlobNotFound(BlobName::from("a")).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            AttachmentError::Blob(BlobError::InvalidName("x".into())).category(),
            ErrorCategory::InvalidArgument
        );
        assert_eq!(
            AttachmentError::Blob(BlobError::StillAttached {
                blob: BlobName::from("a"),
                holders: 1
            })
            .category(),
            ErrorCategory::FailedPrecondition
        );
        assert_eq!(
            AttachmentError::ConflictRetriesExhausted {
                pool: PoolName::from("p"),
                attempts: 8
            }
            .category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_only_conflicts_and_foreign_activation_are_retryable() {
        let conflict = AttachmentError::Repository(RepositoryError::Conflict {
            key: "p".into(),
            expected: Version(3),
        });
        assert!(conflict.is_retryable());
        assert!(AttachmentError::Volume(VolumeError::ActiveElsewhere { lv: "vg/p".into() }).is_retryable());
        assert!(!AttachmentError::Repository(RepositoryError::NotFound("p".into())).is_retryable());
        assert!(!AttachmentError::InvariantViolation("x".into()).is_retryable());
    }
}
