//! Events published by the sync core
//!
//! These are the payloads of the engine's multi-subscriber streams. Every
//! event carries enough context to be rendered without querying the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bandwidth::{NetworkQuality, NetworkType, TransferStatus, TransferType};
use super::conflict::{ConflictInfo, Resolution, ResolutionSource};
use super::newtypes::{SyncPath, TransferId};
use super::sync_item::ItemState;

// ============================================================================
// Engine state
// ============================================================================

/// Whole-engine state
///
/// ```text
/// idle ──start──► syncing ──pause──► paused ──resume──► syncing
///   ▲                │                  │
///   └──── stop ──────┴──────────────────┘
/// syncing ──failure──► error(msg) ──reset──► idle
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Syncing,
    Paused,
    Error(String),
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Syncing => "syncing",
            EngineState::Paused => "paused",
            EngineState::Error(_) => "error",
        }
    }

    pub fn can_transition_to(&self, target: &EngineState) -> bool {
        matches!(
            (self, target),
            (EngineState::Idle, EngineState::Syncing)
                | (EngineState::Paused, EngineState::Syncing)
                | (EngineState::Error(_), EngineState::Syncing)
                | (EngineState::Syncing, EngineState::Paused)
                | (EngineState::Syncing, EngineState::Idle)
                | (EngineState::Syncing, EngineState::Error(_))
                | (EngineState::Paused, EngineState::Idle)
                | (EngineState::Paused, EngineState::Error(_))
                | (EngineState::Error(_), EngineState::Idle)
                | (EngineState::Idle, EngineState::Error(_))
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Error(msg) => write!(f, "error: {msg}"),
            other => write!(f, "{}", other.name()),
        }
    }
}

// ============================================================================
// Stream payloads
// ============================================================================

/// What happened to an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    StateChanged,
}

/// Per-item change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChange {
    pub path: SyncPath,
    pub change_type: ChangeType,
    pub state: ItemState,
    pub timestamp: DateTime<Utc>,
}

impl ItemChange {
    pub fn new(path: SyncPath, change_type: ChangeType, state: ItemState) -> Self {
        Self {
            path,
            change_type,
            state,
            timestamp: Utc::now(),
        }
    }
}

/// Conflict lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConflictEvent {
    Detected(ConflictInfo),
    Resolved {
        path: SyncPath,
        resolution: Resolution,
        source: ResolutionSource,
        /// Sibling created by `keep_both`
        conflict_copy: Option<SyncPath>,
    },
}

/// A folder's selection changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionChange {
    pub path: SyncPath,
    pub is_selected: bool,
    /// Bytes entering (or leaving) the local replica
    pub affected_size: u64,
}

/// Kind of offline-cache change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheUpdateKind {
    Cached,
    Removed,
    Updated,
}

/// Offline-cache registry change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUpdate {
    pub path: SyncPath,
    pub kind: CacheUpdateKind,
    pub size: u64,
}

/// Current transfer rates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthUsage {
    pub upload_bytes_per_second: u64,
    pub download_bytes_per_second: u64,
    pub active_uploads: usize,
    pub active_downloads: usize,
}

/// Connectivity change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatusChange {
    pub available: bool,
    pub network_type: NetworkType,
    pub quality: NetworkQuality,
}

/// A transfer moved through its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatusChange {
    pub transfer_id: TransferId,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_transitions() {
        assert!(EngineState::Idle.can_transition_to(&EngineState::Syncing));
        assert!(EngineState::Syncing.can_transition_to(&EngineState::Paused));
        assert!(EngineState::Paused.can_transition_to(&EngineState::Syncing));
        assert!(EngineState::Syncing.can_transition_to(&EngineState::Error("x".into())));
        assert!(EngineState::Error("x".into()).can_transition_to(&EngineState::Idle));
        assert!(!EngineState::Idle.can_transition_to(&EngineState::Paused));
        assert!(!EngineState::Idle.can_transition_to(&EngineState::Idle));
    }

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Paused.to_string(), "paused");
        assert_eq!(
            EngineState::Error("authentication failed".into()).to_string(),
            "error: authentication failed"
        );
    }
}
