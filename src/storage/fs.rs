//! Filesystem-backed [`BlobStore`] for local development.
//!
//! One JSON document per entry at `<root>/<id>.json`. Not intended for
//! production: there is no purge, no replication, and no locking beyond
//! what the filesystem provides.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::BlobStore;
use crate::cache::CacheRecord;
use crate::config::ConfigError;

pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            ConfigError::Validation(format!(
                "blob directory '{}' is not writable: {e}",
                root.display()
            ))
        })?;
        info!(root = %root.display(), "Initializing filesystem blob store");
        Ok(Self { root })
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn read(&self, id: &str) -> Option<CacheRecord> {
        let path = self.object_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "blob object not found");
                return None;
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "blob read failed");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(path = %path.display(), error = %e, "blob document failed to parse");
                None
            }
        }
    }

    async fn write(&self, id: &str, record: &CacheRecord) -> bool {
        let path = self.object_path(id);
        let document = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(id, error = %e, "record failed to serialize");
                return false;
            }
        };
        match tokio::fs::write(&path, document).await {
            Ok(()) => true,
            Err(e) => {
                error!(path = %path.display(), error = %e, "blob write failed");
                false
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.root.is_dir()
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}
