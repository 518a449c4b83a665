//! SyncItem domain entity
//!
//! A SyncItem is the tracked pairing of one scope-relative path between the
//! local replica and the cloud. It records the last synced baseline (content
//! hash, remote version tag, timestamps) that conflict detection compares
//! fresh observations against.
//!
//! ## State Machine
//!
//! ```text
//!   ┌───────────┐  admit   ┌─────────┐  success  ┌────────┐
//!   │ NotSynced │ ───────► │ Syncing │ ────────► │ Synced │
//!   └───────────┘          └─────────┘           └────────┘
//!        ▲                   │     │                 │
//!        │  local change     │     │ conflict        │ delete requested
//!        └───────────────────┼─────┼─────────────────┤
//!                            │     ▼                 ▼
//!                  failure   │  ┌────────────┐  ┌───────────────┐
//!                            ▼  │ Conflicted │  │ PendingDelete │
//!                      ┌───────┐└────────────┘  └───────────────┘
//!                      │ Error │
//!                      └───────┘
//! ```
//!
//! `Syncing` may roll back to any state: a cancelled transfer leaves the
//! item in the state it had before the transfer started. `Error` may move to
//! any state so the item can be retried.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ContentHash, SyncPath, VersionTag};

// ============================================================================
// ItemState enum
// ============================================================================

/// Synchronization state of a single item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Observed but never synced (or changed since the last sync)
    #[default]
    NotSynced,
    /// A transfer for this path is in flight
    Syncing,
    /// Both replicas hold the same content
    Synced,
    /// Both replicas diverged; waiting for a resolution
    Conflicted,
    /// The last attempt failed terminally
    Error(String),
    /// Deletion requested, not yet acknowledged by both sides
    PendingDelete,
}

impl ItemState {
    /// Returns true if a transfer is in flight
    pub fn is_syncing(&self) -> bool {
        matches!(self, ItemState::Syncing)
    }

    /// Returns true if the item needs user attention
    pub fn needs_attention(&self) -> bool {
        matches!(self, ItemState::Conflicted | ItemState::Error(_))
    }

    /// Returns true if the item has work left to do
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ItemState::NotSynced | ItemState::Syncing | ItemState::PendingDelete
        )
    }

    /// Returns the state name as a string (without error details)
    pub fn name(&self) -> &'static str {
        match self {
            ItemState::NotSynced => "not_synced",
            ItemState::Syncing => "syncing",
            ItemState::Synced => "synced",
            ItemState::Conflicted => "conflicted",
            ItemState::Error(_) => "error",
            ItemState::PendingDelete => "pending_delete",
        }
    }

    /// Parses a state name produced by [`ItemState::name`]
    ///
    /// Error details are not part of the name and are supplied separately.
    pub fn from_name(name: &str, error_message: Option<String>) -> Result<Self, DomainError> {
        match name {
            "not_synced" => Ok(ItemState::NotSynced),
            "syncing" => Ok(ItemState::Syncing),
            "synced" => Ok(ItemState::Synced),
            "conflicted" => Ok(ItemState::Conflicted),
            "error" => Ok(ItemState::Error(error_message.unwrap_or_default())),
            "pending_delete" => Ok(ItemState::PendingDelete),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown item state: {other}"
            ))),
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Error(reason) => write!(f, "error: {reason}"),
            other => write!(f, "{}", other.name()),
        }
    }
}

// ============================================================================
// ErrorInfo struct
// ============================================================================

/// Details of the last failure recorded for an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code (see `SyncError::code`)
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Number of attempts made before giving up
    pub retry_count: u32,
    /// When the failure was recorded
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    /// Creates a new ErrorInfo stamped with the current time
    pub fn new(code: impl Into<String>, message: impl Into<String>, retry_count: u32) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retry_count,
            occurred_at: Utc::now(),
        }
    }
}

// ============================================================================
// SyncItem entity
// ============================================================================

/// A file or folder tracked by the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    path: SyncPath,
    remote_id: Option<String>,
    is_directory: bool,
    /// Local content hash at the last sync
    content_hash: Option<ContentHash>,
    /// Remote version tag at the last sync
    remote_version_tag: Option<VersionTag>,
    size: u64,
    modified_at: DateTime<Utc>,
    state: ItemState,
    last_synced_at: Option<DateTime<Utc>>,
    error_info: Option<ErrorInfo>,
}

impl SyncItem {
    /// Creates a new file item in the `NotSynced` state
    pub fn new_file(path: SyncPath) -> Self {
        Self {
            path,
            remote_id: None,
            is_directory: false,
            content_hash: None,
            remote_version_tag: None,
            size: 0,
            modified_at: Utc::now(),
            state: ItemState::NotSynced,
            last_synced_at: None,
            error_info: None,
        }
    }

    /// Creates a new folder item in the `NotSynced` state
    pub fn new_directory(path: SyncPath) -> Self {
        Self {
            is_directory: true,
            ..Self::new_file(path)
        }
    }

    // --- Getters ---

    pub fn path(&self) -> &SyncPath {
        &self.path
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub fn remote_version_tag(&self) -> Option<&VersionTag> {
        self.remote_version_tag.as_ref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn state(&self) -> &ItemState {
        &self.state
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.error_info.as_ref()
    }

    // --- Builder-style setters ---

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = modified_at;
        self
    }

    pub fn with_content_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn with_remote_version_tag(mut self, tag: VersionTag) -> Self {
        self.remote_version_tag = Some(tag);
        self
    }

    // --- Mutators ---

    /// Records a new local observation without touching the baseline
    pub fn observe_local(&mut self, size: u64, modified_at: DateTime<Utc>) {
        self.size = size;
        self.modified_at = modified_at;
    }

    pub fn set_remote_id(&mut self, remote_id: Option<String>) {
        self.remote_id = remote_id;
    }

    /// Moves the item to a new path (rename or move)
    pub fn set_path(&mut self, path: SyncPath) {
        self.path = path;
    }

    /// Records a successful sync: new baseline, `Synced` state
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if the item cannot become synced
    pub fn mark_synced(
        &mut self,
        content_hash: Option<ContentHash>,
        version_tag: Option<VersionTag>,
        size: u64,
        synced_at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.transition_to(ItemState::Synced)?;
        self.content_hash = content_hash;
        self.remote_version_tag = version_tag;
        self.size = size;
        self.last_synced_at = Some(synced_at);
        self.error_info = None;
        Ok(())
    }

    /// Records a terminal failure
    pub fn mark_error(&mut self, info: ErrorInfo) -> Result<(), DomainError> {
        self.transition_to(ItemState::Error(info.message.clone()))?;
        self.error_info = Some(info);
        Ok(())
    }

    /// Restores a previous state without validating the transition
    ///
    /// Only valid while `Syncing`, used when a transfer is cancelled.
    pub fn rollback_to(&mut self, previous: ItemState) -> Result<(), DomainError> {
        if !self.state.is_syncing() {
            return Err(DomainError::InvalidState {
                from: self.state.name().to_string(),
                to: previous.name().to_string(),
            });
        }
        self.state = previous;
        Ok(())
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Returns true if the item may move to `target`
    pub fn can_transition_to(&self, target: &ItemState) -> bool {
        // Error can go anywhere (retry)
        if matches!(self.state, ItemState::Error(_)) {
            return true;
        }

        match (&self.state, target) {
            (ItemState::NotSynced, ItemState::Syncing) => true,
            (ItemState::NotSynced, ItemState::Synced) => true, // convergent edit
            (ItemState::NotSynced, ItemState::Conflicted) => true,
            (ItemState::NotSynced, ItemState::PendingDelete) => true,
            (ItemState::NotSynced, ItemState::Error(_)) => true,

            (ItemState::Syncing, ItemState::Synced) => true,
            (ItemState::Syncing, ItemState::Conflicted) => true,
            (ItemState::Syncing, ItemState::Error(_)) => true,
            (ItemState::Syncing, ItemState::NotSynced) => true,

            (ItemState::Synced, ItemState::NotSynced) => true,
            (ItemState::Synced, ItemState::Syncing) => true,
            (ItemState::Synced, ItemState::Conflicted) => true,
            (ItemState::Synced, ItemState::PendingDelete) => true,
            (ItemState::Synced, ItemState::Error(_)) => true,
            (ItemState::Synced, ItemState::Synced) => true, // idempotent re-apply

            (ItemState::Conflicted, ItemState::Syncing) => true,
            (ItemState::Conflicted, ItemState::Synced) => true,
            (ItemState::Conflicted, ItemState::Conflicted) => true,
            (ItemState::Conflicted, ItemState::PendingDelete) => true,
            (ItemState::Conflicted, ItemState::Error(_)) => true,

            (ItemState::PendingDelete, ItemState::Syncing) => true,
            (ItemState::PendingDelete, ItemState::NotSynced) => true,
            (ItemState::PendingDelete, ItemState::Conflicted) => true,
            (ItemState::PendingDelete, ItemState::Error(_)) => true,

            _ => false,
        }
    }

    /// Transitions to `target`
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` for a disallowed transition
    pub fn transition_to(&mut self, target: ItemState) -> Result<(), DomainError> {
        if !self.can_transition_to(&target) {
            return Err(DomainError::InvalidState {
                from: self.state.name().to_string(),
                to: target.name().to_string(),
            });
        }
        self.state = target;
        Ok(())
    }
}
