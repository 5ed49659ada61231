//! PostgreSQL checkpoints

use super::CheckpointStore;
use crate::error::{FederatorError, FederatorResult};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Checkpoint store backed by the `federator_checkpoints` table
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Connect a pool to `url`
    pub async fn connect(url: &str, max_connections: u32) -> FederatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Create the checkpoint table if needed
    pub async fn run_migrations(&self) -> FederatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS federator_checkpoints (
                direction TEXT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Checkpoint table ready");
        Ok(())
    }
}

fn to_db_block(block: u64) -> FederatorResult<i64> {
    i64::try_from(block)
        .map_err(|_| FederatorError::Storage(format!("block {} exceeds BIGINT", block)))
}

fn from_db_block(block: i64) -> FederatorResult<u64> {
    u64::try_from(block)
        .map_err(|_| FederatorError::Storage(format!("negative checkpoint {}", block)))
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, direction: &str) -> FederatorResult<Option<u64>> {
        let row =
            sqlx::query("SELECT block_number FROM federator_checkpoints WHERE direction = $1")
                .bind(direction)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| from_db_block(r.get::<i64, _>("block_number")))
            .transpose()
    }

    async fn save(&self, direction: &str, block: u64) -> FederatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO federator_checkpoints (direction, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (direction)
            DO UPDATE SET block_number = $2, updated_at = NOW()
            "#,
        )
        .bind(direction)
        .bind(to_db_block(block)?)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint {} for {}", block, direction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_conversions() {
        assert_eq!(to_db_block(42).unwrap(), 42);
        assert!(to_db_block(u64::MAX).is_err());
        assert_eq!(from_db_block(42).unwrap(), 42);
        assert!(from_db_block(-1).is_err());
    }
}
