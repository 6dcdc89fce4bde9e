// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Blob Repository

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::blob::{Blob, BlobName};
use crate::domain::pool::PoolName;
use crate::domain::repository::{BlobRepository, RepositoryError};

pub struct PostgresBlobRepository {
    pool: PgPool,
}

impl PostgresBlobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_blob_row(row: sqlx::postgres::PgRow) -> Result<Blob, RepositoryError> {
    let name: String = row.get("name");
    let pool: String = row.get("pool");
    let volume_group: String = row.get("volume_group");
    let size_bytes: i64 = row.get("size_bytes");

    let size_bytes = u64::try_from(size_bytes)
        .map_err(|_| RepositoryError::Serialization(format!("Negative size for blob {}", name)))?;
    Blob::new(BlobName(name), PoolName(pool), volume_group, size_bytes)
        .map_err(|e| RepositoryError::Serialization(e.to_string()))
}

fn size_column(blob: &Blob) -> Result<i64, RepositoryError> {
    i64::try_from(blob.size_bytes)
        .map_err(|_| RepositoryError::Serialization(format!("Size of {} exceeds BIGINT", blob.name)))
}

#[async_trait]
impl BlobRepository for PostgresBlobRepository {
    async fn insert(&self, blob: &Blob) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO blobs (name, pool, volume_group, size_bytes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(blob.name.as_str())
        .bind(blob.pool.as_str())
        .bind(&blob.volume_group)
        .bind(size_column(blob)?)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save blob: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists(blob.name.to_string()));
        }
        Ok(())
    }

    async fn update(&self, blob: &Blob) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE blobs SET pool = $2, volume_group = $3, size_bytes = $4
            WHERE name = $1
            "#,
        )
        .bind(blob.name.as_str())
        .bind(blob.pool.as_str())
        .bind(&blob.volume_group)
        .bind(size_column(blob)?)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to update blob: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(blob.name.to_string()));
        }
        Ok(())
    }

    async fn find_by_name(&self, name: &BlobName) -> Result<Option<Blob>, RepositoryError> {
        let row = sqlx::query("SELECT name, pool, volume_group, size_bytes FROM blobs WHERE name = $1")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.map(parse_blob_row).transpose()
    }

    async fn find_by_pool(&self, pool: &PoolName) -> Result<Vec<Blob>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT name, pool, volume_group, size_bytes FROM blobs WHERE pool = $1 ORDER BY name",
        )
        .bind(pool.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter().map(parse_blob_row).collect()
    }

    async fn delete(&self, name: &BlobName) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM blobs WHERE name = $1")
            .bind(name.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(())
    }
}
