//! State repository port (driven/secondary port)
//!
//! This module defines the interface for persisting synchronization state:
//! sync items, the change-feed cursor, the offline queue, pending conflicts,
//! the folder selection and the offline cache registry.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//!   When the store detects corruption it reports it as
//!   [`SyncError::SyncDatabaseCorrupted`] inside the `anyhow::Error`, which
//!   [`is_corruption`] recognises.
//! - All write operations take references to domain entities, allowing
//!   the caller to retain ownership.

use std::collections::HashMap;

use crate::domain::{
    newtypes::{Cursor, ModificationId, SyncPath},
    sync_item::ItemState,
    ConflictInfo, OfflineCacheEntry, OfflineModification, SyncError, SyncItem,
};

// ============================================================================
// ItemFilter struct
// ============================================================================

/// Filter criteria for querying sync items
///
/// All fields are optional; when `None`, no filtering is applied for that
/// field. Multiple filters are combined with AND logic.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Filter by item state
    pub state: Option<ItemState>,
    /// Items at or beneath this path
    pub path_prefix: Option<SyncPath>,
}

impl ItemFilter {
    /// Creates a new empty filter (matches all items)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: ItemState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_path_prefix(mut self, path_prefix: SyncPath) -> Self {
        self.path_prefix = Some(path_prefix);
        self
    }
}

/// Returns true if `err` reports a corrupted store
pub fn is_corruption(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::SyncDatabaseCorrupted(_))
    )
}

// ============================================================================
// IStateRepository trait
// ============================================================================

/// Port trait for persistent sync state
#[async_trait::async_trait]
pub trait IStateRepository: Send + Sync {
    // --- Sync items ---

    /// Inserts or updates an item, keyed by path
    async fn save_item(&self, item: &SyncItem) -> anyhow::Result<()>;

    async fn get_item(&self, path: &SyncPath) -> anyhow::Result<Option<SyncItem>>;

    async fn query_items(&self, filter: &ItemFilter) -> anyhow::Result<Vec<SyncItem>>;

    async fn delete_item(&self, path: &SyncPath) -> anyhow::Result<()>;

    /// Item counts keyed by state name
    async fn count_items_by_state(&self) -> anyhow::Result<HashMap<String, u64>>;

    // --- Change-feed cursor ---

    async fn get_cursor(&self) -> anyhow::Result<Option<Cursor>>;

    /// Stores the cursor; `None` clears it
    async fn save_cursor(&self, cursor: Option<&Cursor>) -> anyhow::Result<()>;

    // --- Offline queue ---

    /// Appends a modification and returns its assigned, strictly increasing id
    async fn append_modification(
        &self,
        modification: &OfflineModification,
    ) -> anyhow::Result<ModificationId>;

    /// Replaces the payload of an existing modification in place
    async fn update_modification_payload(
        &self,
        id: ModificationId,
        payload_ref: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn remove_modifications(&self, ids: &[ModificationId]) -> anyhow::Result<()>;

    /// All queued modifications in id order
    async fn list_modifications(&self) -> anyhow::Result<Vec<OfflineModification>>;

    // --- Conflicts ---

    /// Stores a pending conflict, replacing any previous one for the same path
    async fn save_conflict(&self, conflict: &ConflictInfo) -> anyhow::Result<()>;

    async fn remove_conflict(&self, path: &SyncPath) -> anyhow::Result<()>;

    async fn list_conflicts(&self) -> anyhow::Result<Vec<ConflictInfo>>;

    // --- Selection ---

    /// Replaces the persisted set of selected folder roots
    async fn save_selection(&self, selected: &[SyncPath]) -> anyhow::Result<()>;

    /// `None` if no selection was ever saved (everything selected)
    async fn load_selection(&self) -> anyhow::Result<Option<Vec<SyncPath>>>;

    // --- Offline cache ---

    async fn save_cache_entry(&self, entry: &OfflineCacheEntry) -> anyhow::Result<()>;

    async fn remove_cache_entry(&self, path: &SyncPath) -> anyhow::Result<()>;

    async fn list_cache_entries(&self) -> anyhow::Result<Vec<OfflineCacheEntry>>;

    // --- Maintenance ---

    /// Removes items, cursor and pending conflicts; keeps the offline queue,
    /// selection and cache registry
    async fn clear_sync_state(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_corruption() {
        let err = anyhow::Error::new(SyncError::SyncDatabaseCorrupted("bad page".into()));
        assert!(is_corruption(&err));
        assert!(!is_corruption(&anyhow::anyhow!("disk full")));
    }

    #[test]
    fn test_item_filter_builder() {
        let filter = ItemFilter::new()
            .with_state(ItemState::Conflicted)
            .with_path_prefix("/docs".parse().unwrap());
        assert_eq!(filter.state, Some(ItemState::Conflicted));
        assert_eq!(filter.path_prefix.unwrap().as_str(), "/docs");
    }
}
