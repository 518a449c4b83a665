//! CloudSync Conflict - Conflict detection and resolution
//!
//! Provides:
//! - Hash-first conflict classification against the last synced baseline
//! - Conflict copy naming for keep-both resolutions
//! - Configurable automatic resolution by glob pattern
//! - Resolution execution against the cloud and local ports

pub mod detector;
pub mod error;
pub mod namer;
pub mod policy;
pub mod resolver;

pub use detector::{ConflictDetector, DetectionResult, SyncDirection};
pub use error::ConflictError;
pub use namer::ConflictNamer;
pub use policy::{ConflictRule, PolicyEngine};
pub use resolver::{BatchResult, ConflictResolver, ResolutionOutcome};
