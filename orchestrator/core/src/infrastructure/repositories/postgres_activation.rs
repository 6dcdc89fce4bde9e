// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Activation Repository

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::activation::PoolActivation;
use crate::domain::pool::PoolName;
use crate::domain::repository::{ActivationRepository, RepositoryError, Version, Versioned};

pub struct PostgresActivationRepository {
    pool: PgPool,
}

impl PostgresActivationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_activation_row(row: sqlx::postgres::PgRow) -> Result<Versioned<PoolActivation>, RepositoryError> {
    let activation: serde_json::Value = row.get("activation");
    let version: i64 = row.get("version");
    let value: PoolActivation = serde_json::from_value(activation)
        .map_err(|e| RepositoryError::Serialization(format!("Failed to deserialize activation: {}", e)))?;
    Ok(Versioned {
        value,
        version: Version(version),
    })
}

#[async_trait]
impl ActivationRepository for PostgresActivationRepository {
    async fn get(&self, pool: &PoolName) -> Result<Option<Versioned<PoolActivation>>, RepositoryError> {
        let row = sqlx::query("SELECT activation, version FROM pool_activations WHERE pool = $1")
            .bind(pool.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.map(parse_activation_row).transpose()
    }

    async fn compare_and_swap(
        &self,
        pool: &PoolName,
        expected: Option<Version>,
        activation: &PoolActivation,
    ) -> Result<Version, RepositoryError> {
        let activation_json = serde_json::to_value(activation.normalized())?;

        let (result, version) = match expected {
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO pool_activations (pool, activation, version)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (pool) DO NOTHING
                    "#,
                )
                .bind(pool.as_str())
                .bind(activation_json)
                .bind(Version::INITIAL.0)
                .execute(&self.pool)
                .await;
                (result, Version::INITIAL)
            }
            Some(expected) => {
                let result = sqlx::query(
                    r#"
                    UPDATE pool_activations
                    SET activation = $2, version = version + 1, updated_at = NOW()
                    WHERE pool = $1 AND version = $3
                    "#,
                )
                .bind(pool.as_str())
                .bind(activation_json)
                .bind(expected.0)
                .execute(&self.pool)
                .await;
                (result, expected.next())
            }
        };

        let result = result.map_err(|e| RepositoryError::Database(format!("Failed to write activation: {}", e)))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict {
                key: pool.to_string(),
                expected: expected.unwrap_or(Version(0)),
            });
        }
        Ok(version)
    }

    async fn list(&self) -> Result<Vec<Versioned<PoolActivation>>, RepositoryError> {
        let rows = sqlx::query("SELECT activation, version FROM pool_activations ORDER BY pool")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter().map(parse_activation_row).collect()
    }
}
