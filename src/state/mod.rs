//! Checkpoint persistence
//!
//! Handles:
//! - The last scanned block per relay direction
//! - Crash consistent writes (a failed save leaves the previous value)
//!
//! The checkpoint only bounds rescans. Whether a transfer was relayed is
//! decided by the destination's processed-flag, never by this store.

mod file;
mod postgres;

pub use file::FileCheckpointStore;
pub use postgres::PgCheckpointStore;

use crate::config::{CheckpointBackend, CheckpointConfig};
use crate::error::{FederatorError, FederatorResult};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::info;

/// Durable per-direction checkpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last scanned block of `direction`, `None` before the first save
    async fn load(&self, direction: &str) -> FederatorResult<Option<u64>>;

    /// Persist `block` as the last scanned block of `direction`
    async fn save(&self, direction: &str, block: u64) -> FederatorResult<()>;
}

/// Open the configured checkpoint backend
pub async fn open(config: &CheckpointConfig) -> FederatorResult<Arc<dyn CheckpointStore>> {
    match config.backend {
        CheckpointBackend::File => {
            let path = config.path.clone().ok_or_else(|| {
                FederatorError::Config("checkpoint.path is required".to_string())
            })?;
            info!("Using file checkpoints under {:?}", path);
            Ok(Arc::new(FileCheckpointStore::new(path)))
        }
        CheckpointBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                FederatorError::Config("checkpoint.database_url is required".to_string())
            })?;
            let store = PgCheckpointStore::connect(url, config.max_connections).await?;
            store.run_migrations().await?;
            info!("Using postgres checkpoints");
            Ok(Arc::new(store))
        }
    }
}
