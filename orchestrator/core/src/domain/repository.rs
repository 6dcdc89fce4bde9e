// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `PoolStateStore` | `PoolState` | `InMemoryPoolStateStore`, `PostgresPoolStateStore` |
//! | `BlobRepository` | `Blob` | `InMemoryBlobRepository`, `PostgresBlobRepository` |
//! | `ActivationRepository` | `PoolActivation` | `InMemoryActivationRepository` |
//!
//! ## Optimistic Concurrency
//!
//! Pool records are the single source of truth for which node holds a pool
//! active. They are never locked; every writer reads a [`Versioned`] record
//! and commits with [`PoolStateStore::compare_and_swap`], which fails with
//! [`RepositoryError::Conflict`] if anyone wrote in between. Callers retry
//! the whole read-modify-write.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::activation::PoolActivation;
use crate::domain::blob::{Blob, BlobName};
use crate::domain::pool::{PoolName, PoolState};

/// Storage backend selection for repositories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageBackend {
    InMemory,
    Postgres(PostgresConfig),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub connection_string: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Monotonic record version used for compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub i64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Versioned key-value store of pool records, keyed by pool name.
#[async_trait]
pub trait PoolStateStore: Send + Sync {
    /// Read a pool record and its current version
    async fn get(&self, pool: &PoolName) -> Result<Option<Versioned<PoolState>>, RepositoryError>;

    /// Create a new pool record; fails with `AlreadyExists` if present
    async fn create(&self, state: &PoolState) -> Result<Version, RepositoryError>;

    /// Replace the record only if it is still at `expected`
    async fn compare_and_swap(
        &self,
        pool: &PoolName,
        expected: Version,
        state: &PoolState,
    ) -> Result<Version, RepositoryError>;

    /// Delete the record only if it is still at `expected`
    async fn delete(&self, pool: &PoolName, expected: Version) -> Result<(), RepositoryError>;

    /// List all pool records
    async fn list(&self) -> Result<Vec<Versioned<PoolState>>, RepositoryError>;
}

/// Repository interface for Blob entities
#[async_trait]
pub trait BlobRepository: Send + Sync {
    /// Insert a blob; fails with `AlreadyExists` if the name is taken
    async fn insert(&self, blob: &Blob) -> Result<(), RepositoryError>;

    /// Overwrite an existing blob (size changes)
    async fn update(&self, blob: &Blob) -> Result<(), RepositoryError>;

    async fn find_by_name(&self, name: &BlobName) -> Result<Option<Blob>, RepositoryError>;

    async fn find_by_pool(&self, pool: &PoolName) -> Result<Vec<Blob>, RepositoryError>;

    async fn delete(&self, name: &BlobName) -> Result<(), RepositoryError>;
}

/// Repository for the declarative activation resources the reconcilers
/// consume (pending work items, assignment and observed state per pool).
#[async_trait]
pub trait ActivationRepository: Send + Sync {
    async fn get(&self, pool: &PoolName)
        -> Result<Option<Versioned<PoolActivation>>, RepositoryError>;

    /// Create (`expected == None`) or replace (`expected == Some(v)`)
    async fn compare_and_swap(
        &self,
        pool: &PoolName,
        expected: Option<Version>,
        activation: &PoolActivation,
    ) -> Result<Version, RepositoryError>;

    async fn list(&self) -> Result<Vec<Versioned<PoolActivation>>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on {key}: expected {expected}")]
    Conflict { key: String, expected: Version },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
