//! CloudSync Sync - Synchronization engine
//!
//! Provides:
//! - The sync state machine and per-item pipeline
//! - Selective sync over an arena folder tree
//! - A durable, coalescing offline queue
//! - Weighted bandwidth scheduling with token-bucket pacing
//! - The "available offline" cache registry
//!
//! ## Modules
//!
//! - [`engine`] - `SyncEngine`: remote change feed, local scan, transfers, conflicts
//! - [`selective`] - `SelectiveSyncManager` and the tri-state folder tree
//! - [`offline_queue`] - `OfflineQueue` with same-path coalescing and ordered replay
//! - [`offline_cache`] - `OfflineCache` registry and LRU cleanup
//! - [`bandwidth`] - `BandwidthScheduler`: fair shares, sync windows, throttling
//! - [`events`] - `EventHub` broadcast streams
//! - [`retry`] - Backoff and per-call timeouts
//! - [`path_locks`] - Per-path serialization
//! - [`scheduler`] - Periodic and on-demand sync triggering
//! - [`filesystem`] - Local filesystem adapter (atomic writes, SHA-256)

pub mod bandwidth;
pub mod engine;
pub mod events;
pub mod filesystem;
pub mod offline_cache;
pub mod offline_queue;
pub mod path_locks;
pub mod retry;
pub mod scheduler;
pub mod selective;

pub use bandwidth::BandwidthScheduler;
pub use engine::{ItemOutcome, LocalEvent, SyncEngine, SyncResult};
pub use events::EventHub;
pub use filesystem::LocalFileSystem;
pub use offline_cache::OfflineCache;
pub use offline_queue::{ModificationReplayer, OfflineQueue, ReplayReport};
pub use retry::RetryPolicy;
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use selective::{FolderNode, FolderTree, SelectionDiff, SelectiveSyncManager};

use cloudsync_core::domain::SyncError;

/// Lifts a state-store failure into the sync taxonomy
///
/// Corruption reported by the store arrives as a wrapped
/// `SyncError::SyncDatabaseCorrupted` and is passed through unchanged.
pub(crate) fn storage_error(err: anyhow::Error) -> SyncError {
    match err.downcast::<SyncError>() {
        Ok(sync) => sync,
        Err(other) => SyncError::Io(format!("state store: {other:#}")),
    }
}
