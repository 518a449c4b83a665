//! Cloud API port (driven/secondary port)
//!
//! This module defines the narrow interface the sync core needs from a cloud
//! storage service. Transport and authentication live entirely in the
//! adapter.
//!
//! ## Design Notes
//!
//! - Returns `Result<T, SyncError>` so the engine can route failures by
//!   category (retry network errors, pause on auth failures, and so on).
//! - Paths are scope-relative [`SyncPath`]s; the adapter maps them to the
//!   provider's namespace.
//! - `RemoteEntry` and `RemoteChange` are port-level DTOs; the engine maps
//!   them onto `SyncItem` baselines.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::newtypes::{ContentHash, Cursor, SyncPath, VersionTag};
use crate::domain::SyncError;

/// Progress callback: `(bytes_done, bytes_total)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

// ============================================================================
// DTOs
// ============================================================================

/// Metadata of an item as the cloud reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: SyncPath,
    /// Provider-specific stable identifier
    pub remote_id: String,
    pub is_directory: bool,
    pub size: u64,
    pub content_hash: Option<ContentHash>,
    pub version_tag: Option<VersionTag>,
    pub modified_at: DateTime<Utc>,
}

/// One entry of the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum RemoteChange {
    /// Created or modified
    Upserted(RemoteEntry),
    /// Removed from the cloud
    Deleted { path: SyncPath },
    /// Moved or renamed; `entry.path` is the new location
    Moved { from: SyncPath, entry: RemoteEntry },
}

impl RemoteChange {
    /// The path the change applies to after it takes effect
    pub fn path(&self) -> &SyncPath {
        match self {
            RemoteChange::Upserted(entry) | RemoteChange::Moved { entry, .. } => &entry.path,
            RemoteChange::Deleted { path } => path,
        }
    }
}

/// A batch from the change feed with the cursor to resume from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<RemoteChange>,
    /// Position after this batch; persisted only once the batch is applied
    pub cursor: Option<Cursor>,
    /// True if more changes are immediately available
    pub has_more: bool,
}

// ============================================================================
// ICloudApi trait
// ============================================================================

/// Port trait for cloud storage operations
///
/// ## Implementation Notes
///
/// - `upload_file` with `if_match` must fail with `SyncError::VersionMismatch`
///   when the remote version tag differs.
/// - `get_changes(None)` returns the full state from scratch.
/// - Implementations should report expired credentials as
///   `SyncError::AuthenticationFailed` and throttling as
///   `SyncError::RateLimitExceeded`.
#[async_trait::async_trait]
pub trait ICloudApi: Send + Sync {
    /// Uploads file content, returning the new remote entry
    async fn upload_file(
        &self,
        path: &SyncPath,
        data: Vec<u8>,
        if_match: Option<&VersionTag>,
        progress: Option<ProgressCallback>,
    ) -> Result<RemoteEntry, SyncError>;

    /// Downloads file content together with the entry it was read from
    async fn download_file(
        &self,
        path: &SyncPath,
        progress: Option<ProgressCallback>,
    ) -> Result<(RemoteEntry, Vec<u8>), SyncError>;

    /// Fetches the change feed since `cursor` (`None` = from scratch)
    async fn get_changes(&self, cursor: Option<&Cursor>) -> Result<ChangeSet, SyncError>;

    /// Lists the direct children of a folder
    async fn list_folder(&self, path: &SyncPath) -> Result<Vec<RemoteEntry>, SyncError>;

    /// Creates a folder (succeeds if it already exists)
    async fn create_folder(&self, path: &SyncPath) -> Result<RemoteEntry, SyncError>;

    /// Deletes a file
    async fn delete_file(&self, path: &SyncPath) -> Result<(), SyncError>;

    /// Deletes a folder and its contents
    async fn delete_folder(&self, path: &SyncPath) -> Result<(), SyncError>;

    /// Moves or renames an item
    async fn move_item(&self, from: &SyncPath, to: &SyncPath) -> Result<RemoteEntry, SyncError>;

    /// Gets the metadata of a single item
    async fn get_metadata(&self, path: &SyncPath) -> Result<Option<RemoteEntry>, SyncError>;
}
