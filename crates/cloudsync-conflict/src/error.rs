//! Error types for the conflict engine

use cloudsync_core::domain::SyncError;
use thiserror::Error;

/// Errors that can occur during conflict detection and resolution
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The remote version moved while resolving; the caller must re-detect
    #[error("remote version changed during resolution (expected {expected:?}, got {actual:?})")]
    VersionMismatch {
        expected: Option<String>,
        actual: Option<String>,
    },

    /// The chosen resolution is not offered for this conflict
    #[error("resolution '{resolution}' is not available for {path}")]
    ResolutionNotAllowed { path: String, resolution: String },

    /// Resolution operation failed (upload, download, or rename)
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    /// No pending conflict for the path
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Invalid glob pattern or strategy in a conflict rule
    #[error("invalid glob pattern: {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A port call failed
    #[error("transfer failed: {0}")]
    Transfer(#[from] SyncError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ConflictError {
    /// Maps the error back onto the sync taxonomy for callers that route by kind
    pub fn into_sync_error(self, path: &str) -> SyncError {
        match self {
            ConflictError::VersionMismatch { expected, actual } => SyncError::VersionMismatch {
                path: path.to_string(),
                expected,
                actual,
            },
            ConflictError::Transfer(e) => e,
            ConflictError::Storage(e) => match e.downcast::<SyncError>() {
                Ok(sync) => sync,
                Err(other) => SyncError::Io(other.to_string()),
            },
            ConflictError::NotFound(p) => SyncError::FileNotFound(p),
            other => SyncError::ConflictDetected(other.to_string()),
        }
    }
}
