//! Conflict detection logic
//!
//! Classifies a pair of fresh observations (local and remote) against the
//! last synced baseline recorded in a [`SyncItem`]. The outcome is either a
//! clean one-directional action or a [`ConflictInfo`].
//!
//! Rules, in order:
//! 1. Both sides renamed to different targets is a rename conflict.
//! 2. Both sides present with the same content hash is never a conflict,
//!    whatever the timestamps say.
//! 3. A deletion on one side against a change on the other is a
//!    delete/content conflict.
//! 4. Changes on both sides are a content conflict. When a hash is missing,
//!    "changed" falls back to `modified_at` being newer than the baseline.

use tracing::{debug, info};

use cloudsync_core::domain::{
    ConflictInfo, ConflictType, ItemSnapshot, Resolution, SyncItem, SyncPath,
};

use crate::policy::PolicyEngine;

/// What to do for a path when there is no conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Nothing to transfer; refresh the baseline if needed
    InSync,
    /// Push local content to the cloud
    Upload,
    /// Pull remote content to disk
    Download,
    /// Remote deleted, remove the local copy
    DeleteLocal,
    /// Local deleted, remove the remote copy
    DeleteRemote,
    /// Gone on both sides; drop the record
    Forget,
}

/// Result of conflict detection check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionResult {
    /// No conflict: safe to apply the given action
    NoConflict(SyncDirection),
    /// Both sides diverged
    Conflicted(Box<ConflictInfo>),
}

impl DetectionResult {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DetectionResult::Conflicted(_))
    }
}

/// Detects conflicts between local and remote file versions
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classifies `local` and `remote` against `item`'s baseline
    ///
    /// An absent side is described by a deleted snapshot. Deterministic: the
    /// same inputs always yield the same classification.
    pub fn detect_conflict(
        item: &SyncItem,
        local: &ItemSnapshot,
        remote: &ItemSnapshot,
    ) -> DetectionResult {
        let path = item.path();

        // Rename on both sides
        if let (Some(local_to), Some(remote_to)) = (&local.renamed_to, &remote.renamed_to) {
            if local_to == remote_to {
                return DetectionResult::NoConflict(SyncDirection::InSync);
            }
            return Self::conflict(path, ConflictType::RenameRename, local, remote);
        }

        // Convergent edit: identical content is never a conflict
        if !local.deleted && !remote.deleted {
            if let (Some(lh), Some(rh)) = (&local.content_hash, &remote.content_hash) {
                if lh == rh {
                    debug!(path = %path, "Identical content on both sides, no conflict");
                    return DetectionResult::NoConflict(SyncDirection::InSync);
                }
            }
        }

        let local_changed = Self::local_changed(item, local);
        let remote_changed = Self::remote_changed(item, remote);
        let has_baseline = item.last_synced_at().is_some();

        match (local.deleted, remote.deleted) {
            (true, true) => DetectionResult::NoConflict(SyncDirection::Forget),
            (true, false) => {
                if !has_baseline {
                    // Never synced and absent locally: plain download
                    DetectionResult::NoConflict(SyncDirection::Download)
                } else if remote_changed {
                    Self::conflict(path, ConflictType::DeleteContent, local, remote)
                } else {
                    DetectionResult::NoConflict(SyncDirection::DeleteRemote)
                }
            }
            (false, true) => {
                if !has_baseline {
                    DetectionResult::NoConflict(SyncDirection::Upload)
                } else if local_changed {
                    Self::conflict(path, ConflictType::ContentDelete, local, remote)
                } else {
                    DetectionResult::NoConflict(SyncDirection::DeleteLocal)
                }
            }
            (false, false) => match (local_changed, remote_changed) {
                (true, true) => Self::conflict(path, ConflictType::ContentContent, local, remote),
                (true, false) => DetectionResult::NoConflict(SyncDirection::Upload),
                (false, true) => DetectionResult::NoConflict(SyncDirection::Download),
                (false, false) => DetectionResult::NoConflict(SyncDirection::InSync),
            },
        }
    }

    /// Returns true if the local side moved away from the baseline
    pub fn local_changed(item: &SyncItem, local: &ItemSnapshot) -> bool {
        let Some(synced_at) = item.last_synced_at() else {
            return !local.deleted;
        };
        if local.deleted {
            return true;
        }
        match (&local.content_hash, item.content_hash()) {
            (Some(current), Some(baseline)) => current != baseline,
            _ => local.modified_at > synced_at,
        }
    }

    /// Returns true if the remote side moved away from the baseline
    pub fn remote_changed(item: &SyncItem, remote: &ItemSnapshot) -> bool {
        let Some(synced_at) = item.last_synced_at() else {
            return !remote.deleted;
        };
        if remote.deleted {
            return true;
        }
        if let (Some(current), Some(baseline)) = (&remote.version_tag, item.remote_version_tag())
        {
            return current != baseline;
        }
        match (&remote.content_hash, item.content_hash()) {
            (Some(current), Some(baseline)) => current != baseline,
            _ => remote.modified_at > synced_at,
        }
    }

    /// Returns the policy's resolution for `conflict`, if it is allowed
    ///
    /// `None` means the conflict waits for the user.
    pub fn should_auto_resolve(
        policy: &PolicyEngine,
        conflict: &ConflictInfo,
    ) -> Option<Resolution> {
        policy
            .evaluate(conflict.path().as_str())
            .filter(|r| conflict.allows(*r))
    }

    fn conflict(
        path: &SyncPath,
        conflict_type: ConflictType,
        local: &ItemSnapshot,
        remote: &ItemSnapshot,
    ) -> DetectionResult {
        info!(
            path = %path,
            conflict_type = %conflict_type,
            local_hash = ?local.content_hash,
            remote_hash = ?remote.content_hash,
            "Conflict detected"
        );
        DetectionResult::Conflicted(Box::new(ConflictInfo::new(
            path.clone(),
            conflict_type,
            local.clone(),
            remote.clone(),
        )))
    }
}
