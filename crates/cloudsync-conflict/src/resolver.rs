//! Conflict resolution executor
//!
//! Owns the set of pending conflicts and applies resolutions by performing
//! the actual transfers:
//! - `KeepLocal`: push the local version, guarded by the remote version tag
//! - `KeepRemote`: pull the remote version over the local one
//! - `KeepBoth`: move local aside to a conflict copy, then pull remote
//! - `Skip`: nothing changes and the conflict stays pending

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Local, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use cloudsync_core::{
    domain::{
        ConflictInfo, ConflictType, ContentHash, ItemSnapshot, ItemState, Resolution,
        ResolutionSource, SyncError, SyncItem, SyncPath, VersionTag,
    },
    ports::{ICloudApi, IEncryptionService, IFileSystem, IStateRepository, RemoteEntry},
};

use crate::{
    detector::{ConflictDetector, DetectionResult},
    error::ConflictError,
    namer::ConflictNamer,
};

type DateSource = Box<dyn Fn() -> NaiveDate + Send + Sync>;

/// What a resolution did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub path: SyncPath,
    pub resolution: Resolution,
    pub source: ResolutionSource,
    /// False for `Skip`: the conflict is still pending
    pub resolved: bool,
    /// The item after resolution; `None` if it no longer exists anywhere
    pub item: Option<SyncItem>,
    /// A new local file that still has to be uploaded (keep-both)
    pub conflict_copy: Option<SyncPath>,
}

/// Result of a batch resolution operation
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub resolved: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

/// Detects, records and resolves conflicts
pub struct ConflictResolver {
    cloud: Arc<dyn ICloudApi>,
    file_system: Arc<dyn IFileSystem>,
    encryption: Arc<dyn IEncryptionService>,
    repository: Arc<dyn IStateRepository>,
    pending: RwLock<HashMap<SyncPath, ConflictInfo>>,
    today: DateSource,
}

impl ConflictResolver {
    pub fn new(
        cloud: Arc<dyn ICloudApi>,
        file_system: Arc<dyn IFileSystem>,
        encryption: Arc<dyn IEncryptionService>,
        repository: Arc<dyn IStateRepository>,
    ) -> Self {
        Self {
            cloud,
            file_system,
            encryption,
            repository,
            pending: RwLock::new(HashMap::new()),
            today: Box::new(|| Local::now().date_naive()),
        }
    }

    /// Overrides the date used in conflict copy names
    pub fn with_date_source<F>(mut self, today: F) -> Self
    where
        F: Fn() -> NaiveDate + Send + Sync + 'static,
    {
        self.today = Box::new(today);
        self
    }

    /// Loads persisted pending conflicts, returning how many were found
    pub async fn load_pending(&self) -> Result<usize, ConflictError> {
        let conflicts = self.repository.list_conflicts().await?;
        let mut pending = self.pending.write().await;
        pending.clear();
        for conflict in conflicts {
            pending.insert(conflict.path().clone(), conflict);
        }
        debug!(count = pending.len(), "Loaded pending conflicts");
        Ok(pending.len())
    }

    // ========================================================================
    // Detection and bookkeeping
    // ========================================================================

    /// Classifies the observations and records a conflict if one is found
    pub async fn detect_conflict(
        &self,
        item: &SyncItem,
        local: &ItemSnapshot,
        remote: &ItemSnapshot,
    ) -> Result<DetectionResult, ConflictError> {
        let result = ConflictDetector::detect_conflict(item, local, remote);
        if let DetectionResult::Conflicted(conflict) = &result {
            self.record(conflict.as_ref().clone()).await?;
        }
        Ok(result)
    }

    /// Adds a conflict to the pending set, replacing any older one for the path
    pub async fn record(&self, conflict: ConflictInfo) -> Result<(), ConflictError> {
        self.repository.save_conflict(&conflict).await?;
        self.pending
            .write()
            .await
            .insert(conflict.path().clone(), conflict);
        Ok(())
    }

    /// Pending conflicts, oldest first
    pub async fn pending_conflicts(&self) -> Vec<ConflictInfo> {
        let mut conflicts: Vec<ConflictInfo> = self.pending.read().await.values().cloned().collect();
        conflicts.sort_by(|a, b| {
            a.detected_at()
                .cmp(&b.detected_at())
                .then_with(|| a.path().cmp(b.path()))
        });
        conflicts
    }

    pub async fn get_pending(&self, path: &SyncPath) -> Option<ConflictInfo> {
        self.pending.read().await.get(path).cloned()
    }

    pub async fn has_pending(&self, path: &SyncPath) -> bool {
        self.pending.read().await.contains_key(path)
    }

    /// Drops the pending conflict for `path`, if any
    pub async fn forget(&self, path: &SyncPath) -> Result<(), ConflictError> {
        if self.pending.write().await.remove(path).is_some() {
            self.repository.remove_conflict(path).await?;
        }
        Ok(())
    }

    /// Drops every pending conflict from memory (store cleared separately)
    pub async fn clear(&self) {
        self.pending.write().await.clear();
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Applies `resolution` to the pending conflict at `path`
    ///
    /// `item` is the current record for the path, expected to be `Conflicted`.
    pub async fn resolve(
        &self,
        path: &SyncPath,
        resolution: Resolution,
        source: ResolutionSource,
        item: SyncItem,
    ) -> Result<ResolutionOutcome, ConflictError> {
        let conflict = self
            .get_pending(path)
            .await
            .ok_or_else(|| ConflictError::NotFound(path.to_string()))?;

        if !conflict.allows(resolution) {
            return Err(ConflictError::ResolutionNotAllowed {
                path: path.to_string(),
                resolution: resolution.to_string(),
            });
        }

        info!(
            path = %path,
            conflict_type = %conflict.conflict_type(),
            resolution = %resolution,
            source = %source,
            "Applying conflict resolution"
        );

        if resolution == Resolution::Skip {
            debug!(path = %path, "Skip - conflict stays pending");
            return Ok(ResolutionOutcome {
                path: path.clone(),
                resolution,
                source,
                resolved: false,
                item: Some(item),
                conflict_copy: None,
            });
        }

        let (updated, conflict_copy) = match (conflict.conflict_type(), resolution) {
            (ConflictType::ContentContent, Resolution::KeepLocal)
            | (ConflictType::ContentDelete, Resolution::KeepLocal) => {
                let expected = conflict.remote_snapshot().version_tag.as_ref();
                (Some(self.push_local(item, expected).await?), None)
            }
            (ConflictType::ContentContent, Resolution::KeepRemote)
            | (ConflictType::DeleteContent, Resolution::KeepRemote) => {
                (Some(self.pull_remote(item, path).await?), None)
            }
            (ConflictType::ContentContent, Resolution::KeepBoth) => {
                // The local file is only moved aside once the remote body is in hand
                let (entry, data) = self.fetch_remote(path).await?;
                let copy = self.create_conflict_copy(path).await?;
                (Some(self.install_remote(item, path, &entry, &data).await?), Some(copy))
            }
            (ConflictType::DeleteContent, Resolution::KeepLocal) => {
                self.delete_remote(&conflict, &item).await?;
                (None, None)
            }
            (ConflictType::ContentDelete, Resolution::KeepRemote) => {
                self.file_system.delete_item(path).await?;
                (None, None)
            }
            (ConflictType::RenameRename, resolution) => {
                self.resolve_rename(&conflict, item, resolution).await?
            }
            (conflict_type, resolution) => {
                return Err(ConflictError::ResolutionFailed(format!(
                    "{resolution} cannot resolve a {conflict_type} conflict"
                )))
            }
        };

        // Persist: the record may have moved (rename) or disappeared (delete)
        match &updated {
            Some(item) => {
                if item.path() != path {
                    self.repository.delete_item(path).await?;
                }
                self.repository.save_item(item).await?;
            }
            None => self.repository.delete_item(path).await?,
        }
        if let Some(copy) = &conflict_copy {
            if updated.as_ref().map(|i| i.path()) != Some(copy) {
                self.repository.save_item(&SyncItem::new_file(copy.clone())).await?;
            }
        }

        self.forget(path).await?;

        info!(
            path = %path,
            resolution = %resolution,
            conflict_copy = ?conflict_copy.as_ref().map(|p| p.as_str()),
            "Conflict resolved"
        );

        Ok(ResolutionOutcome {
            path: path.clone(),
            resolution,
            source,
            resolved: true,
            item: updated,
            conflict_copy,
        })
    }

    /// Resolves several conflicts with the same strategy
    pub async fn resolve_batch(
        &self,
        conflicts: Vec<SyncItem>,
        resolution: Resolution,
        source: ResolutionSource,
    ) -> BatchResult {
        let mut result = BatchResult::default();

        for item in conflicts {
            let path = item.path().clone();
            match self.resolve(&path, resolution, source, item).await {
                Ok(_) => result.resolved += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "Batch resolution failed for item");
                    result.failed += 1;
                    result.errors.push(format!("{path}: {e}"));
                }
            }
        }

        result
    }

    /// Moves the local file at `path` to a unique sibling conflict copy
    ///
    /// Returns the new path. The original path is left free for the remote
    /// version.
    pub async fn create_conflict_copy(&self, path: &SyncPath) -> Result<SyncPath, ConflictError> {
        let parent = path.parent().unwrap_or_else(SyncPath::root);
        let siblings: HashSet<SyncPath> = self
            .file_system
            .list_directory(&parent)
            .await?
            .into_iter()
            .collect();

        let copy = ConflictNamer::conflict_copy_path(path, (self.today)(), |candidate| {
            siblings.contains(candidate)
        })
        .map_err(|e| ConflictError::ResolutionFailed(e.to_string()))?;

        self.file_system.move_item(path, &copy).await?;
        debug!(original = %path, copy = %copy, "Created conflict copy");
        Ok(copy)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    async fn push_local(
        &self,
        mut item: SyncItem,
        expected: Option<&VersionTag>,
    ) -> Result<SyncItem, ConflictError> {
        let path = item.path().clone();
        debug!(path = %path, "Applying keep-local: uploading local version");

        let data = self.file_system.read_file(&path).await?;
        let local_hash = self.file_system.compute_hash(&path).await?;
        let body = self.encryption.encrypt(data).await?;

        let entry = self
            .cloud
            .upload_file(&path, body, expected, None)
            .await
            .map_err(map_version_mismatch)?;

        apply_entry(&mut item, &entry, Some(local_hash))?;
        Ok(item)
    }

    async fn pull_remote(
        &self,
        item: SyncItem,
        target: &SyncPath,
    ) -> Result<SyncItem, ConflictError> {
        debug!(path = %target, "Applying keep-remote: downloading remote version");

        let (entry, data) = self.fetch_remote(item.path()).await?;
        self.install_remote(item, target, &entry, &data).await
    }

    async fn fetch_remote(
        &self,
        source: &SyncPath,
    ) -> Result<(RemoteEntry, Vec<u8>), ConflictError> {
        let (entry, body) = self.cloud.download_file(source, None).await?;
        let data = self.encryption.decrypt(body).await?;
        Ok((entry, data))
    }

    async fn install_remote(
        &self,
        mut item: SyncItem,
        target: &SyncPath,
        entry: &RemoteEntry,
        data: &[u8],
    ) -> Result<SyncItem, ConflictError> {
        self.file_system.write_file(target, data).await?;
        let local_hash = self.file_system.compute_hash(target).await?;

        item.set_path(target.clone());
        apply_entry(&mut item, entry, Some(local_hash))?;
        Ok(item)
    }

    async fn delete_remote(
        &self,
        conflict: &ConflictInfo,
        item: &SyncItem,
    ) -> Result<(), ConflictError> {
        let path = conflict.path();
        let expected = conflict.remote_snapshot().version_tag.as_ref();

        if let Some(current) = self.cloud.get_metadata(path).await? {
            if current.version_tag.as_ref() != expected {
                return Err(ConflictError::VersionMismatch {
                    expected: expected.map(|t| t.to_string()),
                    actual: current.version_tag.map(|t| t.to_string()),
                });
            }
            if item.is_directory() || current.is_directory {
                self.cloud.delete_folder(path).await?;
            } else {
                self.cloud.delete_file(path).await?;
            }
        }
        Ok(())
    }

    async fn resolve_rename(
        &self,
        conflict: &ConflictInfo,
        mut item: SyncItem,
        resolution: Resolution,
    ) -> Result<(Option<SyncItem>, Option<SyncPath>), ConflictError> {
        let (Some(local_to), Some(remote_to)) = (
            conflict.local_snapshot().renamed_to.clone(),
            conflict.remote_snapshot().renamed_to.clone(),
        ) else {
            return Err(ConflictError::ResolutionFailed(
                "rename conflict without rename targets".to_string(),
            ));
        };

        match resolution {
            Resolution::KeepLocal => {
                let entry = self.cloud.move_item(&remote_to, &local_to).await?;
                let hash = item.content_hash().cloned();
                item.set_path(local_to);
                apply_entry(&mut item, &entry, hash)?;
                Ok((Some(item), None))
            }
            Resolution::KeepRemote => {
                self.file_system.move_item(&local_to, &remote_to).await?;
                item.set_path(remote_to.clone());
                let hash = self.file_system.compute_hash(&remote_to).await?;
                let entry = self.cloud.get_metadata(&remote_to).await?.ok_or_else(|| {
                    ConflictError::Transfer(SyncError::FileNotFound(remote_to.to_string()))
                })?;
                apply_entry(&mut item, &entry, Some(hash))?;
                Ok((Some(item), None))
            }
            Resolution::KeepBoth => {
                // Local keeps its name as a new item; remote name is pulled down
                item.set_path(remote_to.clone());
                let pulled = self.pull_remote(item, &remote_to).await?;
                Ok((Some(pulled), Some(local_to)))
            }
            Resolution::Skip => Ok((Some(item), None)),
        }
    }
}

/// Records the cloud entry as the new synced baseline
fn apply_entry(
    item: &mut SyncItem,
    entry: &RemoteEntry,
    local_hash: Option<ContentHash>,
) -> Result<(), ConflictError> {
    item.set_remote_id(Some(entry.remote_id.clone()));
    if !item.can_transition_to(&ItemState::Synced) {
        item.transition_to(ItemState::Conflicted)
            .map_err(|e| ConflictError::ResolutionFailed(e.to_string()))?;
    }
    item.mark_synced(local_hash, entry.version_tag.clone(), entry.size, Utc::now())
        .map_err(|e| ConflictError::ResolutionFailed(format!("state transition: {e}")))
}

fn map_version_mismatch(err: SyncError) -> ConflictError {
    match err {
        SyncError::VersionMismatch {
            expected, actual, ..
        } => ConflictError::VersionMismatch { expected, actual },
        other => ConflictError::Transfer(other),
    }
}
