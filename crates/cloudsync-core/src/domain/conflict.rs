//! Conflict domain entities
//!
//! This module defines types for describing a divergence between the local
//! and remote replicas of one path, and how it gets resolved.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ConflictId, ContentHash, SyncPath, VersionTag};

/// A point-in-time observation of one side of a path
///
/// `content_hash` may be `None` while the hash is still being computed or
/// when the provider does not expose one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub content_hash: Option<ContentHash>,
    pub version_tag: Option<VersionTag>,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// True when the item no longer exists on this side
    pub deleted: bool,
    /// Set when the item was renamed on this side
    pub renamed_to: Option<SyncPath>,
}

impl ItemSnapshot {
    /// Snapshot of an existing item
    pub fn present(content_hash: Option<ContentHash>, size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            content_hash,
            version_tag: None,
            size,
            modified_at,
            deleted: false,
            renamed_to: None,
        }
    }

    /// Snapshot of an item deleted on this side
    pub fn deleted(modified_at: DateTime<Utc>) -> Self {
        Self {
            content_hash: None,
            version_tag: None,
            size: 0,
            modified_at,
            deleted: true,
            renamed_to: None,
        }
    }

    pub fn with_version_tag(mut self, tag: VersionTag) -> Self {
        self.version_tag = Some(tag);
        self
    }

    pub fn with_renamed_to(mut self, path: SyncPath) -> Self {
        self.renamed_to = Some(path);
        self
    }
}

/// Kind of divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed the content
    ContentContent,
    /// Local changed, remote deleted
    ContentDelete,
    /// Local deleted, remote changed
    DeleteContent,
    /// Both sides renamed the item to different names
    RenameRename,
}

impl ConflictType {
    pub fn name(&self) -> &'static str {
        match self {
            ConflictType::ContentContent => "content_content",
            ConflictType::ContentDelete => "content_delete",
            ConflictType::DeleteContent => "delete_content",
            ConflictType::RenameRename => "rename_rename",
        }
    }

    /// Resolutions that make sense for this kind of conflict
    pub fn resolution_options(&self) -> Vec<Resolution> {
        match self {
            ConflictType::ContentContent | ConflictType::RenameRename => vec![
                Resolution::KeepLocal,
                Resolution::KeepRemote,
                Resolution::KeepBoth,
                Resolution::Skip,
            ],
            ConflictType::ContentDelete | ConflictType::DeleteContent => {
                vec![Resolution::KeepLocal, Resolution::KeepRemote, Resolution::Skip]
            }
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How a conflict should be or was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Push the local version, overwriting remote
    KeepLocal,
    /// Pull the remote version, overwriting local
    KeepRemote,
    /// Rename local to a conflict copy, then pull remote
    KeepBoth,
    /// Leave both sides untouched; the item stays conflicted
    Skip,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resolution::KeepLocal => "keep_local",
            Resolution::KeepRemote => "keep_remote",
            Resolution::KeepBoth => "keep_both",
            Resolution::Skip => "skip",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Resolution {
    type Err = super::errors::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep_local" => Ok(Resolution::KeepLocal),
            "keep_remote" => Ok(Resolution::KeepRemote),
            "keep_both" => Ok(Resolution::KeepBoth),
            "skip" => Ok(Resolution::Skip),
            other => Err(super::errors::DomainError::ValidationFailed(format!(
                "Unknown resolution: {other}"
            ))),
        }
    }
}

/// Who or what initiated the resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    User,
    Policy,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionSource::User => write!(f, "user"),
            ResolutionSource::Policy => write!(f, "policy"),
        }
    }
}

/// A detected divergence between local and remote state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    id: ConflictId,
    path: SyncPath,
    local_snapshot: ItemSnapshot,
    remote_snapshot: ItemSnapshot,
    conflict_type: ConflictType,
    detected_at: DateTime<Utc>,
    resolution_options: Vec<Resolution>,
}

impl ConflictInfo {
    /// Creates a new conflict record; options follow from the conflict type
    pub fn new(
        path: SyncPath,
        conflict_type: ConflictType,
        local_snapshot: ItemSnapshot,
        remote_snapshot: ItemSnapshot,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            path,
            local_snapshot,
            remote_snapshot,
            conflict_type,
            detected_at: Utc::now(),
            resolution_options: conflict_type.resolution_options(),
        }
    }

    /// Restores a persisted conflict
    pub fn restore(
        id: ConflictId,
        path: SyncPath,
        conflict_type: ConflictType,
        local_snapshot: ItemSnapshot,
        remote_snapshot: ItemSnapshot,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            detected_at,
            id,
            ..Self::new(path, conflict_type, local_snapshot, remote_snapshot)
        }
    }

    pub fn id(&self) -> &ConflictId {
        &self.id
    }

    pub fn path(&self) -> &SyncPath {
        &self.path
    }

    pub fn local_snapshot(&self) -> &ItemSnapshot {
        &self.local_snapshot
    }

    pub fn remote_snapshot(&self) -> &ItemSnapshot {
        &self.remote_snapshot
    }

    pub fn conflict_type(&self) -> ConflictType {
        self.conflict_type
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    pub fn resolution_options(&self) -> &[Resolution] {
        &self.resolution_options
    }

    /// Returns true if `resolution` is offered for this conflict
    pub fn allows(&self, resolution: Resolution) -> bool {
        self.resolution_options.contains(&resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_conflict_offers_all_options() {
        let now = Utc::now();
        let info = ConflictInfo::new(
            "/report.docx".parse().unwrap(),
            ConflictType::ContentContent,
            ItemSnapshot::present(None, 1, now),
            ItemSnapshot::present(None, 2, now),
        );
        assert_eq!(info.resolution_options().len(), 4);
        assert!(info.allows(Resolution::KeepBoth));
    }

    #[test]
    fn test_delete_conflicts_do_not_offer_keep_both() {
        assert!(!ConflictType::ContentDelete
            .resolution_options()
            .contains(&Resolution::KeepBoth));
        assert!(ConflictType::DeleteContent
            .resolution_options()
            .contains(&Resolution::Skip));
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("keep_both".parse::<Resolution>().unwrap(), Resolution::KeepBoth);
        assert!("merge".parse::<Resolution>().is_err());
        assert_eq!(Resolution::KeepLocal.to_string(), "keep_local");
    }
}
