//! Database connection pool management
//!
//! Provides a wrapper around SQLx's SqlitePool with:
//! - Automatic directory creation for database files
//! - WAL journal mode for concurrent reads
//! - Automatic schema migration on first connection
//! - Recovery from a corrupted database file
//! - In-memory mode for testing

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Manages a pool of SQLite connections for CloudSync state persistence
///
/// The pool is configured with:
/// - WAL journal mode for concurrent read access
/// - 5 max connections for file-based databases
/// - 1 connection for in-memory databases (required for data persistence)
/// - 5-second busy timeout to handle write contention
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Creates a new database pool connected to the specified file
    ///
    /// This will:
    /// 1. Create parent directories if they don't exist
    /// 2. Create the database file if it doesn't exist
    /// 3. Enable WAL journal mode
    /// 4. Run schema migrations
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupted` if the file is not a usable database,
    /// `CacheError::ConnectionFailed` if the connection cannot be established,
    /// or `CacheError::MigrationFailed` if schema migrations fail.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| match CacheError::from(e) {
                CacheError::Corrupted(msg) => CacheError::Corrupted(msg),
                other => CacheError::ConnectionFailed(format!(
                    "Failed to connect to database at {}: {}",
                    db_path.display(),
                    other
                )),
            })?;

        Self::run_migrations(&pool).await?;

        tracing::info!(
            path = %db_path.display(),
            "Database pool initialized"
        );

        Ok(Self { pool })
    }

    /// Opens the database, replacing it with an empty one if it is corrupted
    ///
    /// The damaged file is kept next to the original with a `.corrupt`
    /// suffix. Returns the pool and whether a fresh database was created,
    /// in which case the caller must rebuild sync state from the cloud.
    pub async fn open_or_recreate(db_path: &Path) -> Result<(Self, bool), CacheError> {
        match Self::new(db_path).await {
            Ok(pool) => match pool.check_integrity().await {
                Ok(()) => Ok((pool, false)),
                Err(CacheError::Corrupted(reason)) => {
                    pool.close().await;
                    Self::recreate(db_path, &reason).await
                }
                Err(e) => Err(e),
            },
            Err(CacheError::Corrupted(reason)) => Self::recreate(db_path, &reason).await,
            Err(e) => Err(e),
        }
    }

    async fn recreate(db_path: &Path, reason: &str) -> Result<(Self, bool), CacheError> {
        let backup = PathBuf::from(format!("{}.corrupt", db_path.display()));
        tracing::warn!(
            path = %db_path.display(),
            backup = %backup.display(),
            reason = %reason,
            "State database corrupted, starting from an empty one"
        );
        std::fs::rename(db_path, &backup).map_err(|e| {
            CacheError::ConnectionFailed(format!(
                "Failed to move corrupted database aside: {}",
                e
            ))
        })?;
        for suffix in ["-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
        let pool = Self::new(db_path).await?;
        Ok((pool, true))
    }

    /// Creates an in-memory database pool for testing
    ///
    /// Uses a single connection to ensure data persistence across queries
    /// (SQLite in-memory databases are per-connection).
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the connection cannot be established,
    /// or `CacheError::MigrationFailed` if schema migrations fail.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("Failed to create in-memory database: {}", e))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::debug!("In-memory database pool initialized");

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs SQLite's quick integrity check
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupted` if the check reports any problem.
    pub async fn check_integrity(&self) -> Result<(), CacheError> {
        let result: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        if result == "ok" {
            Ok(())
        } else {
            Err(CacheError::Corrupted(result))
        }
    }

    /// Closes every connection in the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs the initial schema migration
    async fn run_migrations(pool: &SqlitePool) -> Result<(), CacheError> {
        let migration_sql = include_str!("migrations/20260301_initial.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .map_err(|e| match CacheError::from(e) {
                CacheError::Corrupted(msg) => CacheError::Corrupted(msg),
                other => {
                    CacheError::MigrationFailed(format!("Failed to run initial migration: {}", other))
                }
            })?;

        tracing::debug!("Database migrations completed");
        Ok(())
    }
}
