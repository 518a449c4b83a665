//! Local filesystem port (driven/secondary port)
//!
//! CRUD over the local replica, addressed by scope-relative paths.
//! File event delivery is not part of this port; the caller feeds events
//! into the engine through `handle_local_event`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::newtypes::{ContentHash, SyncPath};
use crate::domain::SyncError;

/// Attributes of a local file or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub is_directory: bool,
}

/// Port trait for local filesystem operations
#[async_trait::async_trait]
pub trait IFileSystem: Send + Sync {
    async fn read_file(&self, path: &SyncPath) -> Result<Vec<u8>, SyncError>;

    /// Writes content atomically (readers never see a partial file)
    async fn write_file(&self, path: &SyncPath, data: &[u8]) -> Result<(), SyncError>;

    /// Deletes a file or a folder recursively; missing paths are not an error
    async fn delete_item(&self, path: &SyncPath) -> Result<(), SyncError>;

    async fn create_directory(&self, path: &SyncPath) -> Result<(), SyncError>;

    async fn move_item(&self, from: &SyncPath, to: &SyncPath) -> Result<(), SyncError>;

    /// Returns `None` if the path does not exist
    async fn get_file_attributes(&self, path: &SyncPath)
        -> Result<Option<FileAttributes>, SyncError>;

    /// Returns the direct children of a folder
    async fn list_directory(&self, path: &SyncPath) -> Result<Vec<SyncPath>, SyncError>;

    async fn compute_hash(&self, path: &SyncPath) -> Result<ContentHash, SyncError>;

    /// Free bytes on the volume holding the sync root
    async fn get_available_space(&self) -> Result<u64, SyncError>;
}
