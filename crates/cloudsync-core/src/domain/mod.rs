//! Domain entities and business logic
//!
//! This module contains the core domain types for the sync core:
//! - Newtypes for type-safe identifiers and validated paths
//! - Sync items and their state machine
//! - Conflict descriptions and resolutions
//! - Folder selection state
//! - Offline modifications and the offline cache registry
//! - Bandwidth allocation, network conditions and sync windows
//! - Progress counters and event payloads
//! - Error taxonomy

pub mod bandwidth;
pub mod cache;
pub mod conflict;
pub mod errors;
pub mod events;
pub mod folder;
pub mod newtypes;
pub mod offline;
pub mod progress;
pub mod sync_item;

// Re-export commonly used types
pub use bandwidth::{
    in_sync_window, BandwidthAllocation, DayOfWeek, NetworkQuality, NetworkType, SyncTimeWindow,
    TimeOfDay, TransferPriority, TransferStatus, TransferType,
};
pub use cache::{CachePriority, CacheUsage, OfflineCacheEntry};
pub use conflict::{ConflictInfo, ConflictType, ItemSnapshot, Resolution, ResolutionSource};
pub use errors::{DomainError, ErrorCategory, SyncError};
pub use events::{
    BandwidthUsage, CacheUpdate, CacheUpdateKind, ChangeType, ConflictEvent, EngineState,
    ItemChange, NetworkStatusChange, SelectionChange, TransferStatusChange,
};
pub use folder::SelectionState;
pub use newtypes::*;
pub use offline::{OfflineModification, OfflineOperation};
pub use progress::SyncProgress;
pub use sync_item::{ErrorInfo, ItemState, SyncItem};
