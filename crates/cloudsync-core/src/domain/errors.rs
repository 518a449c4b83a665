//! Domain error types
//!
//! This module defines two error families:
//! - [`DomainError`] for validation failures and invalid state transitions
//!   inside domain entities.
//! - [`SyncError`], the taxonomy every port and the sync engine speak. Each
//!   variant belongs to an [`ErrorCategory`] and is either retryable or not.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid content hash
    #[error("Invalid hash format: {0}")]
    InvalidHash(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Invalid version tag
    #[error("Invalid version tag: {0}")]
    InvalidVersionTag(String),

    /// Invalid change-feed cursor
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

// ============================================================================
// SyncError taxonomy
// ============================================================================

/// Broad classification of a [`SyncError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Filesystem,
    Sync,
    Config,
    Auth,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Filesystem => "filesystem",
            ErrorCategory::Sync => "sync",
            ErrorCategory::Config => "config",
            ErrorCategory::Auth => "auth",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced by ports and the synchronization pipeline
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    // --- network ---
    /// The cloud endpoint cannot be reached
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A single cloud call exceeded its timeout
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    /// The remote service answered with a server-side failure
    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// The remote service is throttling requests
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        /// Server hint for when to retry, in seconds
        retry_after_secs: Option<u64>,
    },

    // --- filesystem ---
    /// The file does not exist locally or remotely
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Access to the path was refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Not enough free space to store a download
    #[error("Insufficient disk space: need {needed} bytes, {available} available")]
    DiskSpaceInsufficient { needed: u64, available: u64 },

    /// Another process holds the file
    #[error("File in use: {0}")]
    FileInUse(String),

    /// Any other local I/O failure
    #[error("IO error: {0}")]
    Io(String),

    // --- sync ---
    /// Both replicas changed the same item
    #[error("Conflict detected: {0}")]
    ConflictDetected(String),

    /// The local state store is unreadable
    #[error("Sync database corrupted: {0}")]
    SyncDatabaseCorrupted(String),

    /// Transferred content does not match its declared hash
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// The remote version moved since it was last observed
    #[error("Version mismatch for {path} (expected {expected:?}, got {actual:?})")]
    VersionMismatch {
        path: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    // --- config / quota ---
    /// The engine or a request is misconfigured
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The remote refuses this file type
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Remote storage quota exhausted
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    // --- auth ---
    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The operation was cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,

    /// A domain-level validation error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

impl SyncError {
    /// Returns the taxonomy category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::NetworkUnavailable(_)
            | SyncError::ConnectionTimeout(_)
            | SyncError::ServerError { .. }
            | SyncError::RateLimitExceeded { .. } => ErrorCategory::Network,
            SyncError::FileNotFound(_)
            | SyncError::PermissionDenied(_)
            | SyncError::DiskSpaceInsufficient { .. }
            | SyncError::FileInUse(_)
            | SyncError::Io(_) => ErrorCategory::Filesystem,
            SyncError::ConflictDetected(_)
            | SyncError::SyncDatabaseCorrupted(_)
            | SyncError::ChecksumMismatch { .. }
            | SyncError::VersionMismatch { .. }
            | SyncError::Cancelled => ErrorCategory::Sync,
            SyncError::InvalidConfiguration(_)
            | SyncError::UnsupportedFileType(_)
            | SyncError::QuotaExceeded(_)
            | SyncError::Domain(_) => ErrorCategory::Config,
            SyncError::AuthenticationFailed(_) => ErrorCategory::Auth,
        }
    }

    /// Returns true if the failing call may succeed when repeated
    ///
    /// Network failures, timeouts, server errors, throttling and files
    /// held by another process are retryable. Conflicts are never retried;
    /// they always route to the conflict resolver.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_)
                | SyncError::ConnectionTimeout(_)
                | SyncError::ServerError { .. }
                | SyncError::RateLimitExceeded { .. }
                | SyncError::FileInUse(_)
        )
    }

    /// Stable machine-readable code, used in item error records
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NetworkUnavailable(_) => "NETWORK_UNAVAILABLE",
            SyncError::ConnectionTimeout(_) => "CONNECTION_TIMEOUT",
            SyncError::ServerError { .. } => "SERVER_ERROR",
            SyncError::RateLimitExceeded { .. } => "RATE_LIMITED",
            SyncError::FileNotFound(_) => "FILE_NOT_FOUND",
            SyncError::PermissionDenied(_) => "PERMISSION_DENIED",
            SyncError::DiskSpaceInsufficient { .. } => "DISK_SPACE_INSUFFICIENT",
            SyncError::FileInUse(_) => "FILE_IN_USE",
            SyncError::Io(_) => "IO_ERROR",
            SyncError::ConflictDetected(_) => "CONFLICT",
            SyncError::SyncDatabaseCorrupted(_) => "DATABASE_CORRUPTED",
            SyncError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            SyncError::VersionMismatch { .. } => "VERSION_MISMATCH",
            SyncError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            SyncError::UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            SyncError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            SyncError::AuthenticationFailed(_) => "AUTH_FAILED",
            SyncError::Cancelled => "CANCELLED",
            SyncError::Domain(_) => "DOMAIN_ERROR",
        }
    }

    /// Maps a local I/O error to the filesystem part of the taxonomy
    pub fn from_io(path: impl Into<String>, err: &std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => SyncError::FileNotFound(path),
            std::io::ErrorKind::PermissionDenied => SyncError::PermissionDenied(path),
            std::io::ErrorKind::WouldBlock => SyncError::FileInUse(path),
            _ => SyncError::Io(format!("{path}: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("/bad//path".to_string());
        assert_eq!(err.to_string(), "Invalid path: /bad//path");

        let err = DomainError::InvalidState {
            from: "synced".to_string(),
            to: "not_synced".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from synced to not_synced"
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            SyncError::ConnectionTimeout("get_changes".into()).category(),
            ErrorCategory::Network
        );
        assert_eq!(
            SyncError::DiskSpaceInsufficient {
                needed: 10,
                available: 1
            }
            .category(),
            ErrorCategory::Filesystem
        );
        assert_eq!(
            SyncError::SyncDatabaseCorrupted("malformed".into()).category(),
            ErrorCategory::Sync
        );
        assert_eq!(
            SyncError::QuotaExceeded("full".into()).category(),
            ErrorCategory::Config
        );
        assert_eq!(
            SyncError::AuthenticationFailed("expired".into()).category(),
            ErrorCategory::Auth
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::NetworkUnavailable("offline".into()).is_retryable());
        assert!(SyncError::RateLimitExceeded {
            retry_after_secs: Some(5)
        }
        .is_retryable());
        assert!(SyncError::ServerError {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(SyncError::FileInUse("/a.txt".into()).is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!SyncError::ConflictDetected("/a.txt".into()).is_retryable());
        assert!(!SyncError::AuthenticationFailed("bad token".into()).is_retryable());
        assert!(!SyncError::PermissionDenied("/a.txt".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_from_io_maps_kinds() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(
            SyncError::from_io("/x", &err),
            SyncError::FileNotFound("/x".into())
        );

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            SyncError::from_io("/x", &err),
            SyncError::PermissionDenied("/x".into())
        );
    }

    #[test]
    fn test_domain_error_converts() {
        let err: SyncError = DomainError::InvalidPath("..".into()).into();
        assert_eq!(err.category(), ErrorCategory::Config);
        assert_eq!(err.code(), "DOMAIN_ERROR");
    }
}
