//! CloudSync Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `SyncItem`, `ConflictInfo`, `OfflineModification`, `BandwidthAllocation`
//! - **Error taxonomy** - `SyncError` classifying network, filesystem, sync, config and auth failures
//! - **Port definitions** - Traits for adapters: `ICloudApi`, `IFileSystem`, `IEncryptionService`,
//!   `INotificationService`, `IStateRepository`
//! - **Configuration** - YAML-backed `Config` with validation and a builder
//!
//! # Architecture
//!
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement; the
//! orchestration lives in `cloudsync-sync`.

pub mod config;
pub mod domain;
pub mod ports;

#[cfg(feature = "test-util")]
pub mod testing;
