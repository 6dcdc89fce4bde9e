// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository contracts defined in
//! `crate::domain::repository`.
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresPoolStateStore** - pool records with a `version` column CAS
//! - **PostgresBlobRepository** - blob catalog
//! - **PostgresActivationRepository** - activation resources
//!
//! ## In-Memory Repositories
//!
//! Lock-protected maps for tests and single-node development. The CAS
//! semantics match the PostgreSQL implementations exactly.

pub mod postgres_activation;
pub mod postgres_blob;
pub mod postgres_pool;

pub use postgres_activation::PostgresActivationRepository;
pub use postgres_blob::PostgresBlobRepository;
pub use postgres_pool::PostgresPoolStateStore;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::activation::PoolActivation;
use crate::domain::blob::{Blob, BlobName};
use crate::domain::pool::{PoolName, PoolState};
use crate::domain::repository::{
    ActivationRepository, BlobRepository, PoolStateStore, RepositoryError, Version, Versioned,
};

fn conflict(pool: &PoolName, expected: Version) -> RepositoryError {
    RepositoryError::Conflict {
        key: pool.to_string(),
        expected,
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPoolStateStore {
    pools: Arc<RwLock<HashMap<PoolName, Versioned<PoolState>>>>,
}

impl InMemoryPoolStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolStateStore for InMemoryPoolStateStore {
    async fn get(&self, pool: &PoolName) -> Result<Option<Versioned<PoolState>>, RepositoryError> {
        Ok(self.pools.read().get(pool).cloned())
    }

    async fn create(&self, state: &PoolState) -> Result<Version, RepositoryError> {
        let mut pools = self.pools.write();
        if pools.contains_key(&state.name) {
            return Err(RepositoryError::AlreadyExists(state.name.to_string()));
        }
        pools.insert(
            state.name.clone(),
            Versioned {
                value: state.clone(),
                version: Version::INITIAL,
            },
        );
        Ok(Version::INITIAL)
    }

    async fn compare_and_swap(
        &self,
        pool: &PoolName,
        expected: Version,
        state: &PoolState,
    ) -> Result<Version, RepositoryError> {
        let mut pools = self.pools.write();
        let current = pools
            .get_mut(pool)
            .ok_or_else(|| RepositoryError::NotFound(pool.to_string()))?;
        if current.version != expected {
            return Err(conflict(pool, expected));
        }
        current.value = state.clone();
        current.version = expected.next();
        Ok(current.version)
    }

    async fn delete(&self, pool: &PoolName, expected: Version) -> Result<(), RepositoryError> {
        let mut pools = self.pools.write();
        match pools.get(pool) {
            None => Err(RepositoryError::NotFound(pool.to_string())),
            Some(current) if current.version != expected => Err(conflict(pool, expected)),
            Some(_) => {
                pools.remove(pool);
                Ok(())
            }
        }
    }

    async fn list(&self) -> Result<Vec<Versioned<PoolState>>, RepositoryError> {
        let mut pools: Vec<_> = self.pools.read().values().cloned().collect();
        pools.sort_by(|a, b| a.value.name.cmp(&b.value.name));
        Ok(pools)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBlobRepository {
    blobs: Arc<RwLock<HashMap<BlobName, Blob>>>,
}

impl InMemoryBlobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobRepository for InMemoryBlobRepository {
    async fn insert(&self, blob: &Blob) -> Result<(), RepositoryError> {
        let mut blobs = self.blobs.write();
        if blobs.contains_key(&blob.name) {
            return Err(RepositoryError::AlreadyExists(blob.name.to_string()));
        }
        blobs.insert(blob.name.clone(), blob.clone());
        Ok(())
    }

    async fn update(&self, blob: &Blob) -> Result<(), RepositoryError> {
        let mut blobs = self.blobs.write();
        match blobs.get_mut(&blob.name) {
            Some(existing) => {
                *existing = blob.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(blob.name.to_string())),
        }
    }

    async fn find_by_name(&self, name: &BlobName) -> Result<Option<Blob>, RepositoryError> {
        Ok(self.blobs.read().get(name).cloned())
    }

    async fn find_by_pool(&self, pool: &PoolName) -> Result<Vec<Blob>, RepositoryError> {
        let mut blobs: Vec<_> = self
            .blobs
            .read()
            .values()
            .filter(|b| &b.pool == pool)
            .cloned()
            .collect();
        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blobs)
    }

    async fn delete(&self, name: &BlobName) -> Result<(), RepositoryError> {
        self.blobs.write().remove(name);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryActivationRepository {
    activations: Arc<RwLock<HashMap<PoolName, Versioned<PoolActivation>>>>,
}

impl InMemoryActivationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivationRepository for InMemoryActivationRepository {
    async fn get(&self, pool: &PoolName) -> Result<Option<Versioned<PoolActivation>>, RepositoryError> {
        Ok(self.activations.read().get(pool).cloned())
    }

    async fn compare_and_swap(
        &self,
        pool: &PoolName,
        expected: Option<Version>,
        activation: &PoolActivation,
    ) -> Result<Version, RepositoryError> {
        let mut activations = self.activations.write();
        let version = match (activations.get(pool), expected) {
            (None, None) => Version::INITIAL,
            (Some(current), Some(expected)) if current.version == expected => expected.next(),
            (_, expected) => return Err(conflict(pool, expected.unwrap_or(Version(0)))),
        };
        activations.insert(
            pool.clone(),
            Versioned {
                value: activation.normalized(),
                version,
            },
        );
        Ok(version)
    }

    async fn list(&self) -> Result<Vec<Versioned<PoolActivation>>, RepositoryError> {
        let mut activations: Vec<_> = self.activations.read().values().cloned().collect();
        activations.sort_by(|a, b| a.value.pool.cmp(&b.value.pool));
        Ok(activations)
    }
}
