//! SQLite implementation of IStateRepository
//!
//! This module provides the concrete SQLite-based implementation of the
//! state repository port defined in cloudsync-core. It handles all domain
//! type serialization/deserialization and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type              | SQL Type | Strategy                                   |
//! |--------------------------|----------|--------------------------------------------|
//! | SyncPath                 | TEXT     | Path string via `.as_str()` / `SyncPath::new()` |
//! | ContentHash, VersionTag  | TEXT     | String via `.as_str()`                     |
//! | ConflictId               | TEXT     | UUID string via `.to_string()` / `FromStr` |
//! | DateTime<Utc>            | TEXT     | ISO 8601 via `to_rfc3339()`                |
//! | ItemState                | TEXT     | `name()`, errors as `error:<message>`      |
//! | ErrorInfo                | TEXT     | serde_json serialization                   |
//! | OfflineOperation         | TEXT     | serde_json serialization                   |
//! | ItemSnapshot             | TEXT     | serde_json serialization                   |
//! | Selection roots          | TEXT     | serde_json array                           |
//!
//! ## Error Mapping
//!
//! SQLite corruption errors surface as `SyncError::SyncDatabaseCorrupted`
//! inside the returned `anyhow::Error` so callers can rebuild state.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use cloudsync_core::domain::{
    CachePriority, ConflictId, ConflictInfo, ConflictType, Cursor, ItemSnapshot, ItemState,
    ModificationId, OfflineCacheEntry, OfflineModification, OfflineOperation, SyncError, SyncItem,
    SyncPath,
};
use cloudsync_core::ports::{IStateRepository, ItemFilter};

use crate::{is_corruption_error, CacheError};

/// SQLite-based implementation of the state repository port
///
/// Provides persistent storage for all sync state using SQLite.
/// All operations are performed through a connection pool for concurrency.
pub struct SqliteStateRepository {
    pool: SqlitePool,
}

impl SqliteStateRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Converts a query failure into the port's error, flagging corruption
fn db_err(e: sqlx::Error) -> anyhow::Error {
    if is_corruption_error(&e) {
        tracing::error!(error = %e, "State database reported corruption");
        anyhow::Error::new(SyncError::SyncDatabaseCorrupted(e.to_string()))
    } else {
        anyhow::Error::new(CacheError::from(e))
    }
}

/// Serialize an ItemState to a string for storage
///
/// Simple states are stored by name (e.g., "synced", "pending_delete").
/// The Error variant is stored as "error:<message>".
fn item_state_to_string(state: &ItemState) -> String {
    match state {
        ItemState::Error(msg) => format!("error:{}", msg),
        other => other.name().to_string(),
    }
}

/// Deserialize an ItemState from its stored string representation
fn item_state_from_string(s: &str) -> Result<ItemState, CacheError> {
    if let Some(msg) = s.strip_prefix("error:") {
        return Ok(ItemState::Error(msg.to_string()));
    }
    ItemState::from_name(s, None).map_err(|e| CacheError::SerializationError(e.to_string()))
}

/// Parse a DateTime<Utc> from an ISO 8601 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Try parsing without timezone (SQLite default format)
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn parse_path(s: &str) -> Result<SyncPath, CacheError> {
    SyncPath::from_str(s)
        .map_err(|e| CacheError::SerializationError(format!("Invalid SyncPath '{}': {}", s, e)))
}

fn from_json<T: serde::de::DeserializeOwned>(what: &str, s: &str) -> Result<T, CacheError> {
    serde_json::from_str(s)
        .map_err(|e| CacheError::SerializationError(format!("Invalid {} JSON: {}", what, e)))
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value)
        .map_err(|e| CacheError::SerializationError(format!("Failed to serialize {}: {}", what, e)))
}

// ============================================================================
// Row mapping functions
// ============================================================================

/// Reconstruct a SyncItem from a database row
///
/// Uses serde JSON deserialization to reconstruct the SyncItem since
/// the struct has private fields that can only be set through constructors
/// or deserialization.
fn sync_item_from_row(row: &SqliteRow) -> Result<SyncItem, CacheError> {
    let path: String = row.get("path");
    let remote_id: Option<String> = row.get("remote_id");
    let is_directory: bool = row.get("is_directory");
    let content_hash: Option<String> = row.get("content_hash");
    let remote_version_tag: Option<String> = row.get("remote_version_tag");
    let size_bytes: i64 = row.get("size_bytes");
    let modified_at_str: String = row.get("modified_at");
    let state_str: String = row.get("state");
    let last_synced_at_str: Option<String> = row.get("last_synced_at");
    let error_info_str: Option<String> = row.get("error_info");

    let state = item_state_from_string(&state_str)?;
    let modified_at = parse_datetime(&modified_at_str)?;
    let last_synced_at = match last_synced_at_str {
        Some(ref s) if !s.is_empty() => Some(parse_datetime(s)?),
        _ => None,
    };
    let error_info: serde_json::Value = match error_info_str {
        Some(ref s) if !s.is_empty() => from_json("error_info", s)?,
        _ => serde_json::Value::Null,
    };

    let item_json = serde_json::json!({
        "path": path,
        "remote_id": remote_id,
        "is_directory": is_directory,
        "content_hash": content_hash,
        "remote_version_tag": remote_version_tag,
        "size": size_bytes.max(0) as u64,
        "modified_at": modified_at.to_rfc3339(),
        "state": state,
        "last_synced_at": last_synced_at.map(|dt| dt.to_rfc3339()),
        "error_info": error_info,
    });

    serde_json::from_value(item_json).map_err(|e| {
        CacheError::SerializationError(format!("Failed to reconstruct SyncItem from row: {}", e))
    })
}

/// Reconstruct a queued OfflineModification from a database row
fn modification_from_row(row: &SqliteRow) -> Result<OfflineModification, CacheError> {
    let id: i64 = row.get("id");
    let path_str: String = row.get("path");
    let operation_str: String = row.get("operation");
    let payload_ref: Option<String> = row.get("payload_ref");
    let queued_at_str: String = row.get("queued_at");

    let operation: OfflineOperation = from_json("operation", &operation_str)?;
    let mut modification = OfflineModification::new(parse_path(&path_str)?, operation)
        .with_id(ModificationId::new(id))
        .with_queued_at(parse_datetime(&queued_at_str)?);
    modification.set_payload_ref(payload_ref);
    Ok(modification)
}

/// Reconstruct a pending ConflictInfo from a database row
fn conflict_from_row(row: &SqliteRow) -> Result<ConflictInfo, CacheError> {
    let path_str: String = row.get("path");
    let id_str: String = row.get("id");
    let conflict_type_str: String = row.get("conflict_type");
    let local_str: String = row.get("local_snapshot");
    let remote_str: String = row.get("remote_snapshot");
    let detected_at_str: String = row.get("detected_at");

    let id = ConflictId::from_str(&id_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid ConflictId '{}': {}", id_str, e))
    })?;
    let conflict_type: ConflictType = serde_json::from_str(&format!("\"{}\"", conflict_type_str))
        .map_err(|e| {
            CacheError::SerializationError(format!(
                "Invalid ConflictType '{}': {}",
                conflict_type_str, e
            ))
        })?;
    let local: ItemSnapshot = from_json("local_snapshot", &local_str)?;
    let remote: ItemSnapshot = from_json("remote_snapshot", &remote_str)?;

    Ok(ConflictInfo::restore(
        id,
        parse_path(&path_str)?,
        conflict_type,
        local,
        remote,
        parse_datetime(&detected_at_str)?,
    ))
}

/// Reconstruct an OfflineCacheEntry from a database row
fn cache_entry_from_row(row: &SqliteRow) -> Result<OfflineCacheEntry, CacheError> {
    let path_str: String = row.get("path");
    let size_bytes: i64 = row.get("size_bytes");
    let priority_str: String = row.get("priority");
    let cached_at_str: String = row.get("cached_at");
    let last_accessed_str: String = row.get("last_accessed_at");

    let priority = CachePriority::from_str(&priority_str)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;

    Ok(OfflineCacheEntry {
        path: parse_path(&path_str)?,
        size: size_bytes.max(0) as u64,
        priority,
        cached_at: parse_datetime(&cached_at_str)?,
        last_accessed_at: parse_datetime(&last_accessed_str)?,
    })
}

// ============================================================================
// IStateRepository implementation
// ============================================================================

#[async_trait::async_trait]
impl IStateRepository for SqliteStateRepository {
    // --- SyncItem operations ---

    async fn save_item(&self, item: &SyncItem) -> anyhow::Result<()> {
        let path = item.path().as_str();
        let error_info = match item.error_info() {
            Some(ei) => Some(to_json("error_info", ei)?),
            None => None,
        };

        sqlx::query(
            "INSERT OR REPLACE INTO sync_items \
             (path, remote_id, is_directory, content_hash, remote_version_tag, \
              size_bytes, modified_at, state, last_synced_at, error_info) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(path)
        .bind(item.remote_id())
        .bind(item.is_directory())
        .bind(item.content_hash().map(|h| h.as_str()))
        .bind(item.remote_version_tag().map(|t| t.as_str()))
        .bind(item.size() as i64)
        .bind(item.modified_at().to_rfc3339())
        .bind(item_state_to_string(item.state()))
        .bind(item.last_synced_at().map(|dt| dt.to_rfc3339()))
        .bind(&error_info)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        tracing::trace!(path = %path, state = %item.state(), "Saved sync item");
        Ok(())
    }

    async fn get_item(&self, path: &SyncPath) -> anyhow::Result<Option<SyncItem>> {
        let row = sqlx::query("SELECT * FROM sync_items WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(sync_item_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn query_items(&self, filter: &ItemFilter) -> anyhow::Result<Vec<SyncItem>> {
        let mut sql = String::from("SELECT * FROM sync_items WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(ref state) = filter.state {
            match state {
                // Any error message matches
                ItemState::Error(_) => sql.push_str(" AND state LIKE 'error:%'"),
                other => {
                    sql.push_str(" AND state = ?");
                    binds.push(item_state_to_string(other));
                }
            }
        }

        if let Some(ref prefix) = filter.path_prefix {
            if !prefix.is_root() {
                // Prefix match on whole components; avoids LIKE escaping
                let with_slash = format!("{}/", prefix.as_str());
                sql.push_str(" AND (path = ? OR substr(path, 1, ?) = ?)");
                binds.push(prefix.as_str().to_string());
                binds.push(with_slash.chars().count().to_string());
                binds.push(with_slash);
            }
        }

        sql.push_str(" ORDER BY path");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(sync_item_from_row(row)?);
        }

        Ok(items)
    }

    async fn delete_item(&self, path: &SyncPath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sync_items WHERE path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        tracing::trace!(path = %path, "Deleted sync item");
        Ok(())
    }

    async fn count_items_by_state(&self) -> anyhow::Result<HashMap<String, u64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) as count FROM sync_items GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut counts = HashMap::new();
        for row in &rows {
            let state_str: String = row.get("state");
            let count: i64 = row.get("count");

            // Error rows with different messages fold into one "error" bucket
            let state = item_state_from_string(&state_str)?;
            *counts.entry(state.name().to_string()).or_insert(0) += count as u64;
        }

        Ok(counts)
    }

    // --- Cursor operations ---

    async fn get_cursor(&self) -> anyhow::Result<Option<Cursor>> {
        let value: Option<String> = sqlx::query_scalar("SELECT cursor FROM sync_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match value {
            Some(s) => Ok(Some(Cursor::new(s).map_err(|e| {
                CacheError::SerializationError(format!("Invalid cursor: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    async fn save_cursor(&self, cursor: Option<&Cursor>) -> anyhow::Result<()> {
        match cursor {
            Some(cursor) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO sync_cursor (id, cursor, updated_at) VALUES (1, ?, ?)",
                )
                .bind(cursor.as_str())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query("DELETE FROM sync_cursor")
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
            }
        }
        tracing::trace!(cleared = cursor.is_none(), "Saved change cursor");
        Ok(())
    }

    // --- Offline queue operations ---

    async fn append_modification(
        &self,
        modification: &OfflineModification,
    ) -> anyhow::Result<ModificationId> {
        let operation = to_json("operation", modification.operation())?;

        let result = sqlx::query(
            "INSERT INTO offline_queue (path, operation, payload_ref, queued_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(modification.path().as_str())
        .bind(&operation)
        .bind(modification.payload_ref())
        .bind(modification.queued_at().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let id = ModificationId::new(result.last_insert_rowid());
        tracing::trace!(id = %id, path = %modification.path(), "Queued offline modification");
        Ok(id)
    }

    async fn update_modification_payload(
        &self,
        id: ModificationId,
        payload_ref: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE offline_queue SET payload_ref = ? WHERE id = ?")
            .bind(payload_ref)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove_modifications(&self, ids: &[ModificationId]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for id in ids {
            sqlx::query("DELETE FROM offline_queue WHERE id = ?")
                .bind(id.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        tracing::trace!(count = ids.len(), "Removed offline modifications");
        Ok(())
    }

    async fn list_modifications(&self) -> anyhow::Result<Vec<OfflineModification>> {
        let rows = sqlx::query("SELECT * FROM offline_queue ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut modifications = Vec::with_capacity(rows.len());
        for row in &rows {
            modifications.push(modification_from_row(row)?);
        }
        Ok(modifications)
    }

    // --- Conflict operations ---

    async fn save_conflict(&self, conflict: &ConflictInfo) -> anyhow::Result<()> {
        let local = to_json("local_snapshot", conflict.local_snapshot())?;
        let remote = to_json("remote_snapshot", conflict.remote_snapshot())?;

        sqlx::query(
            "INSERT OR REPLACE INTO conflicts \
             (path, id, conflict_type, local_snapshot, remote_snapshot, detected_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(conflict.path().as_str())
        .bind(conflict.id().to_string())
        .bind(conflict.conflict_type().name())
        .bind(&local)
        .bind(&remote)
        .bind(conflict.detected_at().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        tracing::trace!(path = %conflict.path(), "Saved pending conflict");
        Ok(())
    }

    async fn remove_conflict(&self, path: &SyncPath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM conflicts WHERE path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_conflicts(&self) -> anyhow::Result<Vec<ConflictInfo>> {
        let rows = sqlx::query("SELECT * FROM conflicts ORDER BY detected_at ASC, path ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut conflicts = Vec::with_capacity(rows.len());
        for row in &rows {
            conflicts.push(conflict_from_row(row)?);
        }
        Ok(conflicts)
    }

    // --- Selection operations ---

    async fn save_selection(&self, selected: &[SyncPath]) -> anyhow::Result<()> {
        let roots: Vec<&str> = selected.iter().map(SyncPath::as_str).collect();
        let roots = to_json("selection", &roots)?;

        sqlx::query("INSERT OR REPLACE INTO selection (id, roots, updated_at) VALUES (1, ?, ?)")
            .bind(&roots)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        tracing::debug!(roots = selected.len(), "Saved folder selection");
        Ok(())
    }

    async fn load_selection(&self) -> anyhow::Result<Option<Vec<SyncPath>>> {
        let roots: Option<String> = sqlx::query_scalar("SELECT roots FROM selection WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        let Some(roots) = roots else {
            return Ok(None);
        };
        let roots: Vec<String> = from_json("selection", &roots)?;
        let mut paths = Vec::with_capacity(roots.len());
        for root in &roots {
            paths.push(parse_path(root)?);
        }
        Ok(Some(paths))
    }

    // --- Offline cache operations ---

    async fn save_cache_entry(&self, entry: &OfflineCacheEntry) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO offline_cache \
             (path, size_bytes, priority, cached_at, last_accessed_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.path.as_str())
        .bind(entry.size as i64)
        .bind(entry.priority.name())
        .bind(entry.cached_at.to_rfc3339())
        .bind(entry.last_accessed_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_cache_entry(&self, path: &SyncPath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM offline_cache WHERE path = ?")
            .bind(path.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_cache_entries(&self) -> anyhow::Result<Vec<OfflineCacheEntry>> {
        let rows = sqlx::query("SELECT * FROM offline_cache ORDER BY path")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(cache_entry_from_row(row)?);
        }
        Ok(entries)
    }

    // --- Maintenance ---

    async fn clear_sync_state(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for table in ["sync_items", "sync_cursor", "conflicts"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        tracing::info!("Cleared sync state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_state_round_trip() {
        for state in [
            ItemState::NotSynced,
            ItemState::Syncing,
            ItemState::Synced,
            ItemState::Conflicted,
            ItemState::PendingDelete,
            ItemState::Error("disk: full".to_string()),
        ] {
            let stored = item_state_to_string(&state);
            assert_eq!(item_state_from_string(&stored).unwrap(), state);
        }
        assert!(item_state_from_string("hydrated").is_err());
    }

    #[test]
    fn test_parse_datetime_formats() {
        assert!(parse_datetime("2024-05-01T10:00:00+00:00").is_ok());
        assert!(parse_datetime("2024-05-01 10:00:00").is_ok());
        assert!(parse_datetime("yesterday").is_err());
    }
}
