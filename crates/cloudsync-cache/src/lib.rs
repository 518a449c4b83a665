//! CloudSync Cache - Local state persistence
//!
//! SQLite-based store for:
//! - Sync items and their last synced baseline
//! - The change-feed cursor
//! - The offline modification queue
//! - Pending conflicts
//! - The folder selection and the offline cache registry
//!
//! ## Architecture
//!
//! This crate implements the `IStateRepository` port from `cloudsync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteStateRepository`] - Full `IStateRepository` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use cloudsync_cache::{DatabasePool, SqliteStateRepository};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/cloudsync/state.db")).await?;
//! let repo = SqliteStateRepository::new(pool.pool().clone());
//! // Use repo as IStateRepository...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteStateRepository;

/// SQLite primary result codes that mean the file is unusable
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The database file is damaged or not a database
    #[error("Database corrupted: {0}")]
    Corrupted(String),
}

impl CacheError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, CacheError::Corrupted(_))
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        if is_corruption_error(&e) {
            CacheError::Corrupted(e.to_string())
        } else {
            CacheError::QueryFailed(e.to_string())
        }
    }
}

/// Returns true if SQLite reported a corrupt or foreign file
pub(crate) fn is_corruption_error(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        // Extended result codes keep the primary code in the low byte
        .map(|code| matches!(code & 0xff, SQLITE_CORRUPT | SQLITE_NOTADB))
        .unwrap_or(false)
}
