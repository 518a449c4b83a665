//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ICloudApi`] - Cloud storage operations and the change feed
//! - [`IFileSystem`] - Local replica operations
//! - [`IEncryptionService`] - Transfer body encryption
//! - [`INotificationService`] - User notifications
//! - [`IStateRepository`] - Persistent sync state

pub mod cloud_api;
pub mod encryption;
pub mod file_system;
pub mod notification;
pub mod state_repository;

pub use cloud_api::{ChangeSet, ICloudApi, ProgressCallback, RemoteChange, RemoteEntry};
pub use encryption::{IEncryptionService, NoEncryption};
pub use file_system::{FileAttributes, IFileSystem};
pub use notification::{INotificationService, Notification, NotificationPriority};
pub use state_repository::{is_corruption, IStateRepository, ItemFilter};
