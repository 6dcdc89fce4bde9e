// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Blob Manager Application Service
//!
//! Create, copy, grow and delete blobs. A new blob gets its own pool (a
//! thin-pool LV named after it); a copy is a thin snapshot sharing the
//! source's pool. LVM work runs on the pool's active node, or on this node
//! while the pool is idle.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::attachment::AttachmentError;
use crate::application::host::{blob_lv, pool_lv, HostAdapters};
use crate::domain::blob::{Blob, BlobError, BlobName};
use crate::domain::events::BlobEvent;
use crate::domain::node_config::AttachmentConfig;
use crate::domain::pool::{NodeId, PoolName, PoolState};
use crate::domain::repository::{BlobRepository, PoolStateStore, RepositoryError, Versioned};
use crate::infrastructure::event_bus::EventBus;

#[async_trait]
pub trait BlobService: Send + Sync {
    /// Create `name` with a fresh pool in `volume_group`.
    async fn create_blob(&self, name: BlobName, volume_group: &str, size_bytes: u64) -> Result<Blob, AttachmentError>;

    /// Create `name` as a thin snapshot of `source`, in the source's pool.
    async fn clone_blob(&self, name: BlobName, source: &BlobName) -> Result<Blob, AttachmentError>;

    /// Delete an unattached blob; the pool goes with its last blob.
    async fn delete_blob(&self, name: &BlobName) -> Result<(), AttachmentError>;

    /// Grow an unattached blob.
    async fn expand_blob(&self, name: &BlobName, size_bytes: u64) -> Result<Blob, AttachmentError>;

    async fn get_blob(&self, name: &BlobName) -> Result<Blob, AttachmentError>;

    async fn list_pool_blobs(&self, pool: &PoolName) -> Result<Vec<Blob>, AttachmentError>;
}

pub struct StandardBlobService {
    local_node: NodeId,
    pools: Arc<dyn PoolStateStore>,
    blobs: Arc<dyn BlobRepository>,
    adapters: HostAdapters,
    event_bus: Arc<EventBus>,
    config: AttachmentConfig,
}

impl StandardBlobService {
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
            adapters,
            event_bus,
            config,
        }
    }

    fn lvm_node(&self, state: &PoolState) -> NodeId {
        state.active_on.clone().unwrap_or_else(|| self.local_node.clone())
    }

    /// Pool record for a new blob's pool, created if missing.
    async fn ensure_pool(&self, pool: &PoolName, volume_group: &str) -> Result<Versioned<PoolState>, AttachmentError> {
        if let Some(existing) = self.pools.get(pool).await? {
            return Ok(existing);
        }
        match self.pools.create(&PoolState::new(pool.clone(), volume_group)).await {
            Ok(_) | Err(RepositoryError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.pools
            .get(pool)
            .await?
            .ok_or_else(|| AttachmentError::PoolNotFound(pool.clone()))
    }

    /// Register `blob` in its pool's blob set.
    async fn register(&self, blob: &Blob) -> Result<(), AttachmentError> {
        let mut tries = 0;
        loop {
            tries += 1;
            let Versioned { value: mut state, version } = self
                .pools
                .get(&blob.pool)
                .await?
                .ok_or_else(|| AttachmentError::PoolNotFound(blob.pool.clone()))?;
            if !state.blobs.insert(blob.name.clone()) {
                return Ok(());
            }
            match self.pools.compare_and_swap(&blob.pool, version, &state).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() && tries < self.config.cas_max_attempts => {
                    metrics::counter!("lvblob_cas_conflicts_total").increment(1);
                    tokio::time::sleep(self.config.backoff(tries)).await;
                }
                Err(e) if e.is_conflict() => {
                    return Err(AttachmentError::ConflictRetriesExhausted {
                        pool: blob.pool.clone(),
                        attempts: tries,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Store the blob record, accepting an identical existing one.
    async fn persist(&self, blob: &Blob) -> Result<(), AttachmentError> {
        match self.blobs.insert(blob).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::AlreadyExists(_)) => match self.blobs.find_by_name(&blob.name).await? {
                Some(existing) if &existing == blob => Ok(()),
                _ => Err(BlobError::AlreadyExists(blob.name.clone()).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn publish_created(&self, blob: &Blob) {
        self.event_bus.publish_blob_event(BlobEvent::BlobCreated {
            blob: blob.name.clone(),
            pool: blob.pool.clone(),
            size_bytes: blob.size_bytes,
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl BlobService for StandardBlobService {
    async fn create_blob(&self, name: BlobName, volume_group: &str, size_bytes: u64) -> Result<Blob, AttachmentError> {
        let pool = PoolName::new(name.as_str());
        let blob = Blob::new(name, pool.clone(), volume_group, size_bytes)?;
        if let Some(existing) = self.blobs.find_by_name(&blob.name).await? {
            if existing == blob {
                debug!(blob = %blob.name, "Blob already exists");
                return Ok(existing);
            }
            return Err(BlobError::AlreadyExists(blob.name).into());
        }

        let Versioned { value: state, .. } = self.ensure_pool(&pool, volume_group).await?;
        let node = self.lvm_node(&state);
        let pool_ref = pool_lv(&state);
        self.adapters.volumes.create_thin_pool(&node, &pool_ref, size_bytes).await?;
        self.adapters
            .volumes
            .create_thin_lv(&node, &pool_ref, &blob_lv(&blob), size_bytes)
            .await?;

        self.persist(&blob).await?;
        self.register(&blob).await?;

        info!(blob = %blob.name, pool = %pool, node = %node, size_bytes, "Blob created");
        self.publish_created(&blob);
        Ok(blob)
    }

    async fn clone_blob(&self, name: BlobName, source: &BlobName) -> Result<Blob, AttachmentError> {
        let source = self
            .blobs
            .find_by_name(source)
            .await?
            .ok_or_else(|| AttachmentError::BlobNotFound(source.clone()))?;
        let blob = Blob::new(name, source.pool.clone(), source.volume_group.clone(), source.size_bytes)?;
        if let Some(existing) = self.blobs.find_by_name(&blob.name).await? {
            if existing == blob {
                return Ok(existing);
            }
            return Err(BlobError::AlreadyExists(blob.name).into());
        }

        let Versioned { value: state, .. } = self
            .pools
            .get(&source.pool)
            .await?
            .ok_or_else(|| AttachmentError::PoolNotFound(source.pool.clone()))?;
        let node = self.lvm_node(&state);
        self.adapters
            .volumes
            .snapshot_thin_lv(&node, &blob_lv(&source), &blob_lv(&blob))
            .await?;

        self.persist(&blob).await?;
        self.register(&blob).await?;

        info!(blob = %blob.name, source = %source.name, pool = %blob.pool, "Blob cloned");
        self.publish_created(&blob);
        Ok(blob)
    }

    async fn delete_blob(&self, name: &BlobName) -> Result<(), AttachmentError> {
        let Some(blob) = self.blobs.find_by_name(name).await? else {
            debug!(blob = %name, "Blob already deleted");
            return Ok(());
        };

        let mut tries = 0;
        loop {
            tries += 1;
            let Some(Versioned { value: mut state, version }) = self.pools.get(&blob.pool).await? else {
                break;
            };
            let holders = state.holders.iter().filter(|h| h.blob == blob.name).count();
            if holders > 0 {
                return Err(BlobError::StillAttached {
                    blob: blob.name.clone(),
                    holders,
                }
                .into());
            }

            let node = self.lvm_node(&state);
            self.adapters.volumes.remove_lv(&node, &blob_lv(&blob)).await?;
            state.blobs.remove(&blob.name);

            let result = if state.blobs.is_empty() {
                self.adapters.volumes.remove_lv(&node, &pool_lv(&state)).await?;
                self.pools.delete(&state.name, version).await
            } else {
                self.pools
                    .compare_and_swap(&state.name, version, &state)
                    .await
                    .map(|_| ())
            };
            match result {
                Ok(()) | Err(RepositoryError::NotFound(_)) => break,
                Err(e) if e.is_conflict() && tries < self.config.cas_max_attempts => {
                    metrics::counter!("lvblob_cas_conflicts_total").increment(1);
                    tokio::time::sleep(self.config.backoff(tries)).await;
                }
                Err(e) if e.is_conflict() => {
                    return Err(AttachmentError::ConflictRetriesExhausted {
                        pool: blob.pool.clone(),
                        attempts: tries,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.blobs.delete(&blob.name).await?;
        info!(blob = %blob.name, pool = %blob.pool, "Blob deleted");
        self.event_bus.publish_blob_event(BlobEvent::BlobDeleted {
            blob: blob.name.clone(),
            pool: blob.pool.clone(),
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    async fn expand_blob(&self, name: &BlobName, size_bytes: u64) -> Result<Blob, AttachmentError> {
        let blob = self.get_blob(name).await?;
        if size_bytes < blob.size_bytes {
            return Err(BlobError::CannotShrink {
                blob: blob.name.clone(),
                current: blob.size_bytes,
                requested: size_bytes,
            }
            .into());
        }
        if size_bytes == blob.size_bytes {
            return Ok(blob);
        }
        let expanded = Blob::new(blob.name.clone(), blob.pool.clone(), blob.volume_group.clone(), size_bytes)?;

        let state = self
            .pools
            .get(&blob.pool)
            .await?
            .ok_or_else(|| AttachmentError::PoolNotFound(blob.pool.clone()))?
            .value;
        // live device-mapper tables carry the old size
        let holders = state.holders.iter().filter(|h| h.blob == blob.name).count();
        if holders > 0 {
            return Err(BlobError::StillAttached {
                blob: blob.name.clone(),
                holders,
            }
            .into());
        }

        let node = self.lvm_node(&state);
        self.adapters.volumes.extend_lv(&node, &blob_lv(&blob), size_bytes).await?;
        self.blobs.update(&expanded).await?;

        info!(blob = %blob.name, from = blob.size_bytes, to = size_bytes, "Blob expanded");
        self.event_bus.publish_blob_event(BlobEvent::BlobExpanded {
            blob: expanded.name.clone(),
            pool: expanded.pool.clone(),
            size_bytes,
            expanded_at: Utc::now(),
        });
        Ok(expanded)
    }

    async fn get_blob(&self, name: &BlobName) -> Result<Blob, AttachmentError> {
        self.blobs
            .find_by_name(name)
            .await?
            .ok_or_else(|| AttachmentError::BlobNotFound(name.clone()))
    }

    async fn list_pool_blobs(&self, pool: &PoolName) -> Result<Vec<Blob>, AttachmentError> {
        Ok(self.blobs.find_by_pool(pool).await?)
    }
}
