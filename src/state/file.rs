//! File checkpoints: `<root>/<direction>/lastBlock.txt`

use super::CheckpointStore;
use crate::error::{FederatorError, FederatorResult};

use async_trait::async_trait;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const CHECKPOINT_FILE: &str = "lastBlock.txt";

/// One directory per direction under a common root
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn directory(&self, direction: &str) -> PathBuf {
        self.root.join(direction)
    }
}

fn storage_error(context: &str, path: &Path, e: impl std::fmt::Display) -> FederatorError {
    FederatorError::Storage(format!("{} {:?}: {}", context, path, e))
}

fn read_checkpoint(path: &Path) -> FederatorResult<Option<u64>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(storage_error("cannot read", path, e)),
    };

    contents
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| storage_error("corrupt checkpoint in", path, e))
}

/// Write to a temp file in the same directory, fsync, then rename over the old file
fn write_checkpoint(dir: &Path, block: u64) -> FederatorResult<()> {
    fs::create_dir_all(dir).map_err(|e| storage_error("cannot create", dir, e))?;

    let target = dir.join(CHECKPOINT_FILE);
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| storage_error("cannot stage", dir, e))?;
    tmp.write_all(block.to_string().as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| storage_error("cannot write", tmp.path(), e))?;
    tmp.persist(&target)
        .map_err(|e| storage_error("cannot replace", &target, e.error))?;

    // Make the rename itself durable
    #[cfg(unix)]
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| storage_error("cannot sync", dir, e))?;

    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, direction: &str) -> FederatorResult<Option<u64>> {
        let path = self.directory(direction).join(CHECKPOINT_FILE);
        tokio::task::spawn_blocking(move || read_checkpoint(&path))
            .await
            .map_err(|e| FederatorError::Internal(e.to_string()))?
    }

    async fn save(&self, direction: &str, block: u64) -> FederatorResult<()> {
        let dir = self.directory(direction);
        debug!("Saving checkpoint {} for {}", block, direction);
        tokio::task::spawn_blocking(move || write_checkpoint(&dir, block))
            .await
            .map_err(|e| FederatorError::Internal(e.to_string()))?
    }
}
