//! Offline modification entities
//!
//! Mutations recorded while the cloud is unreachable. Content is never stored
//! inline; `payload_ref` points at a blob or hash the replayer resolves.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ModificationId, SyncPath};

/// The mutation recorded for a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OfflineOperation {
    Create,
    Update,
    Delete,
    Move { from: SyncPath, to: SyncPath },
    Rename { from: SyncPath, to: SyncPath },
}

impl OfflineOperation {
    pub fn name(&self) -> &'static str {
        match self {
            OfflineOperation::Create => "create",
            OfflineOperation::Update => "update",
            OfflineOperation::Delete => "delete",
            OfflineOperation::Move { .. } => "move",
            OfflineOperation::Rename { .. } => "rename",
        }
    }

    /// Returns true for operations that carry file content
    pub fn carries_content(&self) -> bool {
        matches!(self, OfflineOperation::Create | OfflineOperation::Update)
    }
}

impl fmt::Display for OfflineOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfflineOperation::Move { from, to } => write!(f, "move {from} -> {to}"),
            OfflineOperation::Rename { from, to } => write!(f, "rename {from} -> {to}"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A queued mutation
///
/// The `id` is `None` until the queue persists the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineModification {
    id: Option<ModificationId>,
    path: SyncPath,
    operation: OfflineOperation,
    payload_ref: Option<String>,
    queued_at: DateTime<Utc>,
}

impl OfflineModification {
    /// Creates an unpersisted modification stamped with the current time
    pub fn new(path: SyncPath, operation: OfflineOperation) -> Self {
        Self {
            id: None,
            path,
            operation,
            payload_ref: None,
            queued_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: ModificationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_payload_ref(mut self, payload_ref: impl Into<String>) -> Self {
        self.payload_ref = Some(payload_ref.into());
        self
    }

    pub fn with_queued_at(mut self, queued_at: DateTime<Utc>) -> Self {
        self.queued_at = queued_at;
        self
    }

    pub fn id(&self) -> Option<ModificationId> {
        self.id
    }

    pub fn path(&self) -> &SyncPath {
        &self.path
    }

    pub fn operation(&self) -> &OfflineOperation {
        &self.operation
    }

    pub fn payload_ref(&self) -> Option<&str> {
        self.payload_ref.as_deref()
    }

    pub fn queued_at(&self) -> DateTime<Utc> {
        self.queued_at
    }

    /// Replaces the payload in place (coalescing)
    pub fn set_payload_ref(&mut self, payload_ref: Option<String>) {
        self.payload_ref = payload_ref;
    }

    /// True if this entry touches `path`, either directly or as a move source/target
    pub fn touches(&self, path: &SyncPath) -> bool {
        if &self.path == path {
            return true;
        }
        match &self.operation {
            OfflineOperation::Move { from, to } | OfflineOperation::Rename { from, to } => {
                from == path || to == path
            }
            _ => false,
        }
    }
}
