// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Pool State Store
//!
//! Pool records as JSONB with a `version` column. Every write is
//! conditional on the version the writer read.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::pool::{PoolName, PoolState};
use crate::domain::repository::{PoolStateStore, RepositoryError, Version, Versioned};

pub struct PostgresPoolStateStore {
    pool: PgPool,
}

impl PostgresPoolStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish "someone else wrote" from "the record is gone" after a
    /// conditional write touched no row.
    async fn miss(&self, name: &PoolName, expected: Version) -> RepositoryError {
        let exists = sqlx::query("SELECT 1 FROM pool_states WHERE name = $1")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => RepositoryError::Conflict {
                key: name.to_string(),
                expected,
            },
            Ok(None) => RepositoryError::NotFound(name.to_string()),
            Err(e) => RepositoryError::Database(e.to_string()),
        }
    }
}

fn parse_pool_row(row: sqlx::postgres::PgRow) -> Result<Versioned<PoolState>, RepositoryError> {
    let state: serde_json::Value = row.get("state");
    let version: i64 = row.get("version");
    let value: PoolState = serde_json::from_value(state)
        .map_err(|e| RepositoryError::Serialization(format!("Failed to deserialize pool state: {}", e)))?;
    Ok(Versioned {
        value,
        version: Version(version),
    })
}

#[async_trait]
impl PoolStateStore for PostgresPoolStateStore {
    async fn get(&self, pool: &PoolName) -> Result<Option<Versioned<PoolState>>, RepositoryError> {
        let row = sqlx::query("SELECT state, version FROM pool_states WHERE name = $1")
            .bind(pool.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.map(parse_pool_row).transpose()
    }

    async fn create(&self, state: &PoolState) -> Result<Version, RepositoryError> {
        let state_json = serde_json::to_value(state)?;
        let result = sqlx::query(
            r#"
            INSERT INTO pool_states (name, state, version)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(state.name.as_str())
        .bind(state_json)
        .bind(Version::INITIAL.0)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to create pool state: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists(state.name.to_string()));
        }
        Ok(Version::INITIAL)
    }

    async fn compare_and_swap(
        &self,
        pool: &PoolName,
        expected: Version,
        state: &PoolState,
    ) -> Result<Version, RepositoryError> {
        let state_json = serde_json::to_value(state)?;
        let result = sqlx::query(
            r#"
            UPDATE pool_states
            SET state = $2, version = version + 1, updated_at = NOW()
            WHERE name = $1 AND version = $3
            "#,
        )
        .bind(pool.as_str())
        .bind(state_json)
        .bind(expected.0)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to update pool state: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(self.miss(pool, expected).await);
        }
        Ok(expected.next())
    }

    async fn delete(&self, pool: &PoolName, expected: Version) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM pool_states WHERE name = $1 AND version = $2")
            .bind(pool.as_str())
            .bind(expected.0)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.miss(pool, expected).await);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Versioned<PoolState>>, RepositoryError> {
        let rows = sqlx::query("SELECT state, version FROM pool_states ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter().map(parse_pool_row).collect()
    }
}
