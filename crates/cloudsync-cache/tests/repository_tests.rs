//! Integration tests for SqliteStateRepository
//!
//! These tests verify the IStateRepository methods using an in-memory
//! SQLite database. Each test function creates a fresh database to
//! ensure test isolation.

use chrono::{Duration, Utc};

use cloudsync_cache::{CacheError, DatabasePool, SqliteStateRepository};
use cloudsync_core::domain::{
    CachePriority, ConflictInfo, ConflictType, ContentHash, Cursor, ErrorInfo, ItemSnapshot,
    ItemState, OfflineCacheEntry, OfflineModification, OfflineOperation, SyncItem, SyncPath,
    VersionTag,
};
use cloudsync_core::ports::{is_corruption, IStateRepository, ItemFilter};

// ============================================================================
// Test helpers
// ============================================================================

/// Create a fresh in-memory repository for each test
async fn setup() -> SqliteStateRepository {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    SqliteStateRepository::new(pool.pool().clone())
}

fn path(s: &str) -> SyncPath {
    s.parse().unwrap()
}

fn synced_item(p: &str) -> SyncItem {
    let mut item = SyncItem::new_file(path(p)).with_remote_id("remote-1");
    item.transition_to(ItemState::Syncing).unwrap();
    item.mark_synced(
        Some(ContentHash::new("abc123".to_string()).unwrap()),
        Some(VersionTag::new("v7".to_string()).unwrap()),
        2048,
        Utc::now(),
    )
    .unwrap();
    item
}

// ============================================================================
// SyncItem tests
// ============================================================================

#[tokio::test]
async fn test_save_and_get_item() {
    let repo = setup().await;
    let item = synced_item("/Documents/report.docx");
    repo.save_item(&item).await.unwrap();

    let retrieved = repo
        .get_item(&path("/Documents/report.docx"))
        .await
        .unwrap()
        .expect("item should exist");

    assert_eq!(retrieved.path(), item.path());
    assert_eq!(retrieved.remote_id(), Some("remote-1"));
    assert_eq!(retrieved.state(), &ItemState::Synced);
    assert_eq!(retrieved.size(), 2048);
    assert_eq!(retrieved.content_hash().unwrap().as_str(), "abc123");
    assert_eq!(retrieved.remote_version_tag().unwrap().as_str(), "v7");
    assert!(retrieved.last_synced_at().is_some());
}

#[tokio::test]
async fn test_get_item_not_found() {
    let repo = setup().await;
    assert!(repo.get_item(&path("/missing.txt")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_save_item_upserts_by_path() {
    let repo = setup().await;
    let mut item = synced_item("/a.txt");
    repo.save_item(&item).await.unwrap();

    item.transition_to(ItemState::Syncing).unwrap();
    item.mark_error(ErrorInfo::new("PERMISSION_DENIED", "read-only", 3))
        .unwrap();
    repo.save_item(&item).await.unwrap();

    let all = repo.query_items(&ItemFilter::new()).await.unwrap();
    assert_eq!(all.len(), 1);
    let stored = &all[0];
    assert_eq!(stored.state(), &ItemState::Error("read-only".to_string()));
    let info = stored.error_info().unwrap();
    assert_eq!(info.code, "PERMISSION_DENIED");
    assert_eq!(info.retry_count, 3);
}

#[tokio::test]
async fn test_directory_flag_survives_storage() {
    let repo = setup().await;
    repo.save_item(&SyncItem::new_directory(path("/Photos")))
        .await
        .unwrap();
    let stored = repo.get_item(&path("/Photos")).await.unwrap().unwrap();
    assert!(stored.is_directory());
    assert_eq!(stored.state(), &ItemState::NotSynced);
}

#[tokio::test]
async fn test_query_items_by_state_and_prefix() {
    let repo = setup().await;
    repo.save_item(&synced_item("/docs/a.txt")).await.unwrap();
    repo.save_item(&synced_item("/docs/sub/b.txt")).await.unwrap();
    repo.save_item(&synced_item("/docs2/c.txt")).await.unwrap();
    repo.save_item(&SyncItem::new_file(path("/docs/new.txt")))
        .await
        .unwrap();

    let under_docs = repo
        .query_items(&ItemFilter::new().with_path_prefix(path("/docs")))
        .await
        .unwrap();
    let paths: Vec<&str> = under_docs.iter().map(|i| i.path().as_str()).collect();
    // "/docs2" shares the string prefix but is not beneath "/docs"
    assert_eq!(paths, vec!["/docs/a.txt", "/docs/new.txt", "/docs/sub/b.txt"]);

    let synced_docs = repo
        .query_items(
            &ItemFilter::new()
                .with_state(ItemState::Synced)
                .with_path_prefix(path("/docs")),
        )
        .await
        .unwrap();
    assert_eq!(synced_docs.len(), 2);

    let everything = repo
        .query_items(&ItemFilter::new().with_path_prefix(SyncPath::root()))
        .await
        .unwrap();
    assert_eq!(everything.len(), 4);
}

#[tokio::test]
async fn test_query_items_error_state_matches_any_message() {
    let repo = setup().await;
    let mut item = SyncItem::new_file(path("/x.bin"));
    item.mark_error(ErrorInfo::new("IO_ERROR", "bad sector", 0))
        .unwrap();
    repo.save_item(&item).await.unwrap();
    repo.save_item(&synced_item("/y.bin")).await.unwrap();

    let errors = repo
        .query_items(&ItemFilter::new().with_state(ItemState::Error(String::new())))
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path().as_str(), "/x.bin");
}

#[tokio::test]
async fn test_delete_item() {
    let repo = setup().await;
    repo.save_item(&synced_item("/gone.txt")).await.unwrap();
    repo.delete_item(&path("/gone.txt")).await.unwrap();
    assert!(repo.get_item(&path("/gone.txt")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_count_items_by_state() {
    let repo = setup().await;
    repo.save_item(&synced_item("/a")).await.unwrap();
    repo.save_item(&synced_item("/b")).await.unwrap();
    repo.save_item(&SyncItem::new_file(path("/c"))).await.unwrap();

    let mut e1 = SyncItem::new_file(path("/e1"));
    e1.mark_error(ErrorInfo::new("IO_ERROR", "one", 0)).unwrap();
    let mut e2 = SyncItem::new_file(path("/e2"));
    e2.mark_error(ErrorInfo::new("IO_ERROR", "two", 0)).unwrap();
    repo.save_item(&e1).await.unwrap();
    repo.save_item(&e2).await.unwrap();

    let counts = repo.count_items_by_state().await.unwrap();
    assert_eq!(counts.get("synced"), Some(&2));
    assert_eq!(counts.get("not_synced"), Some(&1));
    assert_eq!(counts.get("error"), Some(&2));
}

// ============================================================================
// Cursor tests
// ============================================================================

#[tokio::test]
async fn test_cursor_save_replace_and_clear() {
    let repo = setup().await;
    assert!(repo.get_cursor().await.unwrap().is_none());

    let first = Cursor::new("c1".to_string()).unwrap();
    let second = Cursor::new("c2".to_string()).unwrap();
    repo.save_cursor(Some(&first)).await.unwrap();
    repo.save_cursor(Some(&second)).await.unwrap();
    assert_eq!(repo.get_cursor().await.unwrap(), Some(second));

    repo.save_cursor(None).await.unwrap();
    assert!(repo.get_cursor().await.unwrap().is_none());
}

// ============================================================================
// Offline queue tests
// ============================================================================

#[tokio::test]
async fn test_modification_ids_strictly_increase() {
    let repo = setup().await;
    let a = repo
        .append_modification(&OfflineModification::new(path("/a"), OfflineOperation::Create))
        .await
        .unwrap();
    let b = repo
        .append_modification(&OfflineModification::new(path("/b"), OfflineOperation::Update))
        .await
        .unwrap();
    assert!(b > a);

    // Removing the newest entry must not let its id be reused
    repo.remove_modifications(&[b]).await.unwrap();
    let c = repo
        .append_modification(&OfflineModification::new(path("/c"), OfflineOperation::Delete))
        .await
        .unwrap();
    assert!(c > b);
}

#[tokio::test]
async fn test_list_modifications_in_id_order_with_payloads() {
    let repo = setup().await;
    let queued_at = Utc::now() - Duration::minutes(10);
    let first = OfflineModification::new(path("/notes.md"), OfflineOperation::Update)
        .with_payload_ref("payload-1")
        .with_queued_at(queued_at);
    let id = repo.append_modification(&first).await.unwrap();
    repo.append_modification(&OfflineModification::new(
        path("/old.md"),
        OfflineOperation::Rename {
            from: path("/old.md"),
            to: path("/new.md"),
        },
    ))
    .await
    .unwrap();

    repo.update_modification_payload(id, Some("payload-2"))
        .await
        .unwrap();

    let queue = repo.list_modifications().await.unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].id(), Some(id));
    assert_eq!(queue[0].payload_ref(), Some("payload-2"));
    assert_eq!(
        queue[0].queued_at().timestamp(),
        queued_at.timestamp(),
        "queue time must come from storage, not from now()"
    );
    assert!(matches!(
        queue[1].operation(),
        OfflineOperation::Rename { to, .. } if to.as_str() == "/new.md"
    ));
}

#[tokio::test]
async fn test_remove_modifications_empty_is_noop() {
    let repo = setup().await;
    repo.remove_modifications(&[]).await.unwrap();
    assert!(repo.list_modifications().await.unwrap().is_empty());
}

// ============================================================================
// Conflict tests
// ============================================================================

#[tokio::test]
async fn test_conflict_round_trip() {
    let repo = setup().await;
    let now = Utc::now();
    let conflict = ConflictInfo::new(
        path("/report.docx"),
        ConflictType::ContentContent,
        ItemSnapshot::present(Some(ContentHash::new("l".into()).unwrap()), 10, now),
        ItemSnapshot::present(Some(ContentHash::new("r".into()).unwrap()), 12, now)
            .with_version_tag(VersionTag::new("v2".into()).unwrap()),
    );
    repo.save_conflict(&conflict).await.unwrap();

    let stored = repo.list_conflicts().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id(), conflict.id());
    assert_eq!(stored[0].conflict_type(), ConflictType::ContentContent);
    assert_eq!(stored[0].remote_snapshot(), conflict.remote_snapshot());
    assert_eq!(stored[0].resolution_options(), conflict.resolution_options());

    repo.remove_conflict(&path("/report.docx")).await.unwrap();
    assert!(repo.list_conflicts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_conflict_replaced_per_path() {
    let repo = setup().await;
    let now = Utc::now();
    for conflict_type in [ConflictType::ContentContent, ConflictType::ContentDelete] {
        repo.save_conflict(&ConflictInfo::new(
            path("/a.txt"),
            conflict_type,
            ItemSnapshot::present(None, 1, now),
            ItemSnapshot::deleted(now),
        ))
        .await
        .unwrap();
    }
    let stored = repo.list_conflicts().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].conflict_type(), ConflictType::ContentDelete);
}

// ============================================================================
// Selection tests
// ============================================================================

#[tokio::test]
async fn test_selection_never_saved_vs_empty() {
    let repo = setup().await;
    assert!(repo.load_selection().await.unwrap().is_none());

    repo.save_selection(&[]).await.unwrap();
    assert_eq!(repo.load_selection().await.unwrap(), Some(vec![]));

    repo.save_selection(&[path("/Documents"), path("/Photos/2024")])
        .await
        .unwrap();
    assert_eq!(
        repo.load_selection().await.unwrap(),
        Some(vec![path("/Documents"), path("/Photos/2024")])
    );
}

// ============================================================================
// Offline cache tests
// ============================================================================

#[tokio::test]
async fn test_cache_entries() {
    let repo = setup().await;
    let pinned = OfflineCacheEntry::new(path("/keep.pdf"), 500, CachePriority::Pinned);
    let normal = OfflineCacheEntry::new(path("/maybe.pdf"), 700, CachePriority::Normal);
    repo.save_cache_entry(&pinned).await.unwrap();
    repo.save_cache_entry(&normal).await.unwrap();

    let entries = repo.list_cache_entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path.as_str(), "/keep.pdf");
    assert_eq!(entries[0].priority, CachePriority::Pinned);
    assert_eq!(entries[1].size, 700);

    repo.remove_cache_entry(&path("/maybe.pdf")).await.unwrap();
    assert_eq!(repo.list_cache_entries().await.unwrap().len(), 1);
}

// ============================================================================
// Maintenance tests
// ============================================================================

#[tokio::test]
async fn test_clear_sync_state_keeps_queue_selection_and_cache() {
    let repo = setup().await;
    let now = Utc::now();
    repo.save_item(&synced_item("/a.txt")).await.unwrap();
    repo.save_cursor(Some(&Cursor::new("c9".into()).unwrap()))
        .await
        .unwrap();
    repo.save_conflict(&ConflictInfo::new(
        path("/a.txt"),
        ConflictType::ContentContent,
        ItemSnapshot::present(None, 1, now),
        ItemSnapshot::present(None, 2, now),
    ))
    .await
    .unwrap();
    repo.append_modification(&OfflineModification::new(path("/b.txt"), OfflineOperation::Create))
        .await
        .unwrap();
    repo.save_selection(&[path("/Documents")]).await.unwrap();
    repo.save_cache_entry(&OfflineCacheEntry::new(path("/c"), 1, CachePriority::Low))
        .await
        .unwrap();

    repo.clear_sync_state().await.unwrap();

    assert!(repo.query_items(&ItemFilter::new()).await.unwrap().is_empty());
    assert!(repo.get_cursor().await.unwrap().is_none());
    assert!(repo.list_conflicts().await.unwrap().is_empty());
    assert_eq!(repo.list_modifications().await.unwrap().len(), 1);
    assert!(repo.load_selection().await.unwrap().is_some());
    assert_eq!(repo.list_cache_entries().await.unwrap().len(), 1);
}

// ============================================================================
// File-backed database tests
// ============================================================================

#[tokio::test]
async fn test_file_database_persists_across_pools() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("state.db");

    {
        let pool = DatabasePool::new(&db_path).await.unwrap();
        let repo = SqliteStateRepository::new(pool.pool().clone());
        repo.save_item(&synced_item("/persist.txt")).await.unwrap();
        pool.close().await;
    }

    let pool = DatabasePool::new(&db_path).await.unwrap();
    let repo = SqliteStateRepository::new(pool.pool().clone());
    assert!(repo.get_item(&path("/persist.txt")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_open_or_recreate_replaces_garbage_file() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    std::fs::write(&db_path, vec![0x42u8; 8192]).unwrap();

    let (pool, recreated) = DatabasePool::open_or_recreate(&db_path).await.unwrap();
    assert!(recreated);
    assert!(dir.path().join("state.db.corrupt").exists());

    let repo = SqliteStateRepository::new(pool.pool().clone());
    repo.save_item(&synced_item("/fresh.txt")).await.unwrap();
    assert!(repo.get_item(&path("/fresh.txt")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_open_or_recreate_keeps_healthy_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    {
        let pool = DatabasePool::new(&db_path).await.unwrap();
        SqliteStateRepository::new(pool.pool().clone())
            .save_item(&synced_item("/kept.txt"))
            .await
            .unwrap();
        pool.close().await;
    }

    let (pool, recreated) = DatabasePool::open_or_recreate(&db_path).await.unwrap();
    assert!(!recreated);
    let repo = SqliteStateRepository::new(pool.pool().clone());
    assert!(repo.get_item(&path("/kept.txt")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_garbage_file_reports_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    std::fs::write(&db_path, vec![0x42u8; 8192]).unwrap();

    match DatabasePool::new(&db_path).await {
        Err(e) => assert!(e.is_corruption(), "unexpected error: {e}"),
        Ok(_) => panic!("garbage file must not open cleanly"),
    }

    let err = anyhow::Error::new(cloudsync_core::domain::SyncError::SyncDatabaseCorrupted(
        "x".into(),
    ));
    assert!(is_corruption(&err));
    assert!(!CacheError::QueryFailed("x".into()).is_corruption());
}
