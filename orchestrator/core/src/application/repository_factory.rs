// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations based on the storage backend
//! configuration, keeping the domain layer free of infrastructure types.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::domain::repository::{ActivationRepository, BlobRepository, PoolStateStore, StorageBackend};
use crate::infrastructure::db::Database;
use crate::infrastructure::repositories::{
    InMemoryActivationRepository, InMemoryBlobRepository, InMemoryPoolStateStore, PostgresActivationRepository,
    PostgresBlobRepository, PostgresPoolStateStore,
};

/// The three stores one node works against.
#[derive(Clone)]
pub struct Repositories {
    pub pools: Arc<dyn PoolStateStore>,
    pub blobs: Arc<dyn BlobRepository>,
    pub activations: Arc<dyn ActivationRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            pools: Arc::new(InMemoryPoolStateStore::new()),
            blobs: Arc::new(InMemoryBlobRepository::new()),
            activations: Arc::new(InMemoryActivationRepository::new()),
        }
    }

    pub fn postgres(database: &Database) -> Self {
        let pool = database.get_pool().clone();
        Self {
            pools: Arc::new(PostgresPoolStateStore::new(pool.clone())),
            blobs: Arc::new(PostgresBlobRepository::new(pool.clone())),
            activations: Arc::new(PostgresActivationRepository::new(pool)),
        }
    }
}

/// Creates the repositories for the configured backend, connecting and
/// migrating the database when one is configured.
pub async fn create_repositories(backend: &StorageBackend) -> Result<Repositories> {
    match backend {
        StorageBackend::InMemory => {
            info!("Using in-memory state store");
            Ok(Repositories::in_memory())
        }
        StorageBackend::Postgres(config) => {
            let database = Database::new(config).await?;
            database.migrate().await?;
            info!("Using PostgreSQL state store");
            Ok(Repositories::postgres(&database))
        }
    }
}
