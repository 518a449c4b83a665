//! Integration tests for SyncEngine
//!
//! Each test wires an engine to the in-memory cloud and filesystem and a
//! fresh in-memory SQLite state store.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use cloudsync_cache::{DatabasePool, SqliteStateRepository};
use cloudsync_core::config::{Config, ConfigBuilder};
use cloudsync_core::domain::{
    ChangeType, Cursor, EngineState, ItemState, OfflineOperation, Resolution, SyncError,
    SyncPath,
};
use cloudsync_core::ports::{ICloudApi, IStateRepository, NoEncryption};
use cloudsync_core::testing::{InMemoryCloud, InMemoryFileSystem, RecordingNotifier};
use cloudsync_sync::{ItemOutcome, LocalEvent, RetryPolicy, SyncEngine};

// ============================================================================
// Test helpers
// ============================================================================

struct Harness {
    engine: Arc<SyncEngine>,
    cloud: Arc<InMemoryCloud>,
    fs: Arc<InMemoryFileSystem>,
    notifier: Arc<RecordingNotifier>,
    repo: Arc<SqliteStateRepository>,
}

fn path(s: &str) -> SyncPath {
    s.parse().unwrap()
}

async fn harness_with(config: Config) -> Harness {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    let repo = Arc::new(SqliteStateRepository::new(pool.pool().clone()));
    let cloud = Arc::new(InMemoryCloud::new());
    let fs = Arc::new(InMemoryFileSystem::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let engine = SyncEngine::new(
        config,
        cloud.clone(),
        fs.clone(),
        Arc::new(NoEncryption),
        notifier.clone(),
        repo.clone(),
    )
    .unwrap()
    .with_retry_policy(RetryPolicy::new(
        2,
        Duration::from_millis(1),
        Duration::from_millis(5),
        Duration::from_secs(5),
    ))
    .with_conflict_date_source(|| NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    engine.initialize().await.unwrap();

    Harness {
        engine: Arc::new(engine),
        cloud,
        fs,
        notifier,
        repo,
    }
}

async fn harness() -> Harness {
    harness_with(Config::default()).await
}

async fn item_state(h: &Harness, p: &str) -> Option<ItemState> {
    h.repo
        .get_item(&path(p))
        .await
        .unwrap()
        .map(|i| i.state().clone())
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_first_sync_converges_both_sides() {
    let h = harness().await;
    h.cloud.put_remote("/Docs/a.txt", b"remote-a");
    h.fs.put("/Docs/b.txt", b"local-b");

    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.downloaded, 1);
    assert_eq!(result.uploaded, 1);
    assert!(result.errors.is_empty());
    assert_eq!(h.fs.content("/Docs/a.txt").as_deref(), Some(&b"remote-a"[..]));
    assert_eq!(h.cloud.content("/Docs/b.txt").as_deref(), Some(&b"local-b"[..]));
    assert_eq!(item_state(&h, "/Docs/a.txt").await, Some(ItemState::Synced));
    assert_eq!(item_state(&h, "/Docs/b.txt").await, Some(ItemState::Synced));
    assert_eq!(h.engine.state(), EngineState::Idle);

    let progress = h.engine.progress();
    assert_eq!(progress.total_items, 2);
    assert_eq!(progress.completed_items, 2);
}

#[tokio::test]
async fn test_second_cycle_is_a_no_op() {
    let h = harness().await;
    h.cloud.put_remote("/Docs/a.txt", b"remote-a");
    h.fs.put("/Docs/b.txt", b"local-b");
    h.engine.start_sync().await.unwrap();
    let uploads = h.cloud.calls("upload_file");
    let downloads = h.cloud.calls("download_file");

    let result = h.engine.start_sync().await.unwrap();

    assert!(result.is_empty(), "unexpected work: {result:?}");
    assert_eq!(h.cloud.calls("upload_file"), uploads);
    assert_eq!(h.cloud.calls("download_file"), downloads);
}

/// Syncs /a.txt and /gone.txt, then edits, deletes and moves them remotely
///
/// Returns the cursor from before the remote changes.
async fn synced_then_changed_remotely(h: &Harness) -> Option<Cursor> {
    h.cloud.put_remote("/a.txt", b"one");
    h.cloud.put_remote("/gone.txt", b"bye");
    h.engine.start_sync().await.unwrap();
    let before = h.repo.get_cursor().await.unwrap();

    h.cloud.put_remote("/a.txt", b"two");
    h.cloud.delete_remote("/gone.txt");
    h.cloud.move_remote("/a.txt", "/b.txt");
    before
}

#[tokio::test]
async fn test_edit_then_move_brings_down_the_new_content() {
    let h = harness().await;
    synced_then_changed_remotely(&h).await;

    let result = h.engine.start_sync().await.unwrap();

    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert!(!h.fs.exists("/a.txt"));
    assert!(!h.fs.exists("/gone.txt"));
    assert_eq!(h.fs.content("/b.txt").as_deref(), Some(&b"two"[..]));
    assert_eq!(item_state(&h, "/b.txt").await, Some(ItemState::Synced));
    assert_eq!(item_state(&h, "/a.txt").await, None);
    assert_eq!(
        h.repo.get_cursor().await.unwrap(),
        Some(h.cloud.latest_cursor())
    );
}

#[tokio::test]
async fn test_redelivered_batch_changes_nothing() {
    let h = harness().await;
    let rewound = synced_then_changed_remotely(&h).await;
    h.engine.start_sync().await.unwrap();
    let tag = h
        .repo
        .get_item(&path("/b.txt"))
        .await
        .unwrap()
        .unwrap()
        .remote_version_tag()
        .cloned();
    let uploads = h.cloud.calls("upload_file");

    // The same upsert, delete and move arrive a second time
    h.repo.save_cursor(rewound.as_ref()).await.unwrap();
    let result = h.engine.start_sync().await.unwrap();

    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!((result.downloaded, result.uploaded, result.deleted), (0, 0, 0));
    assert_eq!(h.cloud.calls("upload_file"), uploads);
    assert_eq!(h.fs.content("/b.txt").as_deref(), Some(&b"two"[..]));
    assert!(!h.fs.exists("/a.txt"));
    assert_eq!(item_state(&h, "/a.txt").await, None);
    let item = h.repo.get_item(&path("/b.txt")).await.unwrap().unwrap();
    assert_eq!(item.state(), &ItemState::Synced);
    assert_eq!(item.remote_version_tag().cloned(), tag);
    assert_eq!(
        h.repo.get_cursor().await.unwrap(),
        Some(h.cloud.latest_cursor())
    );

    let result = h.engine.start_sync().await.unwrap();
    assert!(result.is_empty(), "unexpected work: {result:?}");
}

#[tokio::test]
async fn test_identical_content_on_both_sides_is_not_transferred() {
    let h = harness().await;
    h.cloud.put_remote("/same.txt", b"same");
    h.fs.put("/same.txt", b"same");

    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.conflicts, 0);
    assert_eq!(h.cloud.calls("download_file"), 0);
    assert_eq!(h.cloud.calls("upload_file"), 0);
    assert_eq!(item_state(&h, "/same.txt").await, Some(ItemState::Synced));
}

#[tokio::test]
async fn test_remote_edit_and_delete_propagate() {
    let h = harness().await;
    h.cloud.put_remote("/a.txt", b"one");
    h.cloud.put_remote("/b.txt", b"gone soon");
    h.engine.start_sync().await.unwrap();

    h.cloud.put_remote("/a.txt", b"two");
    h.cloud.delete_remote("/b.txt");
    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.downloaded, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(h.fs.content("/a.txt").as_deref(), Some(&b"two"[..]));
    assert!(!h.fs.exists("/b.txt"));
    assert_eq!(item_state(&h, "/b.txt").await, None);
}

#[tokio::test]
async fn test_local_edit_and_delete_propagate() {
    let h = harness().await;
    h.fs.put("/a.txt", b"one");
    h.fs.put("/b.txt", b"doomed");
    h.engine.start_sync().await.unwrap();

    h.fs.put("/a.txt", b"one, edited");
    h.fs.remove("/b.txt");
    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.uploaded, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(h.cloud.content("/a.txt").as_deref(), Some(&b"one, edited"[..]));
    assert!(h.cloud.entry("/b.txt").is_none());
}

#[tokio::test]
async fn test_excluded_files_are_never_uploaded() {
    let h = harness().await;
    h.fs.put("/scratch.tmp", b"junk");
    h.fs.put("/keep.txt", b"keep");

    h.engine.start_sync().await.unwrap();

    assert!(h.cloud.entry("/scratch.tmp").is_none());
    assert!(h.cloud.entry("/keep.txt").is_some());
}

#[tokio::test]
async fn test_local_events_run_the_pipeline() {
    let h = harness().await;
    h.fs.put("/notes.txt", b"draft");

    let outcome = h
        .engine
        .handle_local_event(LocalEvent::Created(path("/notes.txt")))
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::Uploaded);

    // Replaying the same event finds nothing to do
    let outcome = h
        .engine
        .handle_local_event(LocalEvent::Modified(path("/notes.txt")))
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::InSync);

    h.fs.remove("/notes.txt");
    let outcome = h
        .engine
        .handle_local_event(LocalEvent::Deleted(path("/notes.txt")))
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::DeletedRemote);
    assert!(h.cloud.entry("/notes.txt").is_none());
}

// ============================================================================
// Moves
// ============================================================================

#[tokio::test]
async fn test_user_move_is_applied_on_both_sides() {
    let h = harness().await;
    h.cloud.put_remote("/Docs/a.txt", b"content");
    h.engine.start_sync().await.unwrap();

    let outcome = h
        .engine
        .move_item(&path("/Docs/a.txt"), &path("/Archive/a.txt"))
        .await
        .unwrap();

    assert_eq!(outcome, ItemOutcome::Moved { to: path("/Archive/a.txt") });
    assert!(h.cloud.entry("/Docs/a.txt").is_none());
    assert_eq!(h.cloud.content("/Archive/a.txt").as_deref(), Some(&b"content"[..]));
    assert_eq!(h.fs.content("/Archive/a.txt").as_deref(), Some(&b"content"[..]));
    assert_eq!(item_state(&h, "/Docs/a.txt").await, None);
    assert_eq!(item_state(&h, "/Archive/a.txt").await, Some(ItemState::Synced));

    // The feed echoes the move back; applying it changes nothing
    let result = h.engine.start_sync().await.unwrap();
    assert!(result.is_empty(), "unexpected work: {result:?}");
    assert_eq!(h.cloud.calls("download_file"), 1);
}

#[tokio::test]
async fn test_remote_move_moves_the_local_copy() {
    let h = harness().await;
    h.cloud.put_remote("/Docs/a.txt", b"content");
    h.engine.start_sync().await.unwrap();

    h.cloud.move_remote("/Docs/a.txt", "/Docs/renamed.txt");
    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.downloaded, 0);
    assert!(!h.fs.exists("/Docs/a.txt"));
    assert_eq!(h.fs.content("/Docs/renamed.txt").as_deref(), Some(&b"content"[..]));
    assert_eq!(item_state(&h, "/Docs/renamed.txt").await, Some(ItemState::Synced));
}

// ============================================================================
// Offline queue
// ============================================================================

#[tokio::test]
async fn test_offline_changes_replay_in_order() {
    let h = harness().await;
    assert!(h.engine.set_network_available(false).await.is_none());

    h.fs.put("/a.txt", b"a1");
    h.engine
        .handle_local_event(LocalEvent::Created(path("/a.txt")))
        .await
        .unwrap();
    h.fs.put("/b.txt", b"b1");
    h.engine
        .handle_local_event(LocalEvent::Created(path("/b.txt")))
        .await
        .unwrap();
    h.fs.put("/a.txt", b"a2");
    let outcome = h
        .engine
        .handle_local_event(LocalEvent::Modified(path("/a.txt")))
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::Queued);

    // The second edit of /a.txt folds into its create
    let pending = h.engine.offline_queue().pending_modifications().await;
    let order: Vec<_> = pending.iter().map(|m| m.path().to_string()).collect();
    assert_eq!(order, vec!["/a.txt", "/b.txt"]);
    assert_eq!(pending[0].operation(), &OfflineOperation::Create);
    assert_eq!(h.cloud.calls("upload_file"), 0);

    let before = h.cloud.latest_cursor();
    let report = h.engine.set_network_available(true).await.unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(report.remaining, 0);
    let feed = h.cloud.get_changes(Some(&before)).await.unwrap();
    let uploaded: Vec<_> = feed.changes.iter().map(|c| c.path().to_string()).collect();
    assert_eq!(uploaded, vec!["/a.txt", "/b.txt"]);
    assert_eq!(h.cloud.content("/a.txt").as_deref(), Some(&b"a2"[..]));
}

#[tokio::test]
async fn test_cycle_detects_outage_and_replays_on_recovery() {
    let h = harness().await;
    h.cloud
        .set_offline(Some(SyncError::NetworkUnavailable("no route".into())));

    let result = h.engine.start_sync().await.unwrap();
    assert_eq!(result.errors.len(), 1);
    assert!(!h.engine.offline_queue().is_network_available());
    assert_eq!(h.engine.state(), EngineState::Idle);

    h.fs.put("/while-offline.txt", b"queued");
    let outcome = h
        .engine
        .handle_local_event(LocalEvent::Created(path("/while-offline.txt")))
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::Queued);

    h.cloud.set_offline(None);
    let result = h.engine.start_sync().await.unwrap();

    assert!(result.errors.is_empty(), "{result:?}");
    assert!(h.engine.offline_queue().is_network_available());
    assert_eq!(h.engine.offline_queue().pending_count().await, 0);
    assert_eq!(
        h.cloud.content("/while-offline.txt").as_deref(),
        Some(&b"queued"[..])
    );
}

#[tokio::test]
async fn test_offline_move_is_queued_as_rename() {
    let h = harness().await;
    h.fs.put("/old.txt", b"x");
    h.engine.start_sync().await.unwrap();
    h.engine.set_network_available(false).await;

    let outcome = h
        .engine
        .move_item(&path("/old.txt"), &path("/new.txt"))
        .await
        .unwrap();

    assert_eq!(outcome, ItemOutcome::Queued);
    assert!(h.fs.exists("/new.txt"));
    let pending = h.engine.offline_queue().pending_modifications().await;
    assert!(matches!(
        pending[0].operation(),
        OfflineOperation::Rename { .. }
    ));

    h.engine.set_network_available(true).await.unwrap();
    assert!(h.cloud.entry("/old.txt").is_none());
    assert_eq!(h.cloud.content("/new.txt").as_deref(), Some(&b"x"[..]));
}

// ============================================================================
// Selective sync
// ============================================================================

#[tokio::test]
async fn test_selection_changes_remove_and_restore_local_copies() {
    let h = harness().await;
    h.cloud.put_remote("/Docs/a.txt", b"doc");
    h.cloud.put_remote("/Photos/p.jpg", b"photo");
    h.engine.start_sync().await.unwrap();
    assert!(h.fs.exists("/Photos/p.jpg"));

    h.engine
        .selection()
        .deselect_folders(&[path("/Photos")])
        .await
        .unwrap();
    let result = h.engine.apply_selection_changes().await.unwrap();

    assert_eq!(result.deleted, 1);
    assert!(!h.fs.exists("/Photos/p.jpg"));
    assert!(h.cloud.entry("/Photos/p.jpg").is_some(), "never deleted remotely");
    assert!(h.fs.exists("/Docs/a.txt"));

    // Out of scope content stays in the cloud only
    h.cloud.put_remote("/Photos/q.jpg", b"another");
    h.engine.start_sync().await.unwrap();
    assert!(!h.fs.exists("/Photos/q.jpg"));

    h.engine
        .selection()
        .select_folder(&path("/Photos"), true)
        .await
        .unwrap();
    let result = h.engine.apply_selection_changes().await.unwrap();

    assert_eq!(result.downloaded, 2);
    assert_eq!(h.fs.content("/Photos/p.jpg").as_deref(), Some(&b"photo"[..]));
    assert_eq!(h.fs.content("/Photos/q.jpg").as_deref(), Some(&b"another"[..]));
}

#[tokio::test]
async fn test_offline_pin_survives_deselection() {
    let h = harness().await;
    h.cloud.put_remote("/Photos/keep.jpg", b"pinned");
    h.cloud.put_remote("/Photos/drop.jpg", b"dropped");
    h.engine.start_sync().await.unwrap();

    h.engine
        .make_available_offline(&path("/Photos/keep.jpg"))
        .await
        .unwrap();
    h.engine
        .selection()
        .deselect_folders(&[path("/Photos")])
        .await
        .unwrap();
    h.engine.apply_selection_changes().await.unwrap();

    assert!(h.fs.exists("/Photos/keep.jpg"));
    assert!(!h.fs.exists("/Photos/drop.jpg"));

    assert!(h.engine.remove_from_offline(&path("/Photos/keep.jpg")).await.unwrap());
    assert!(!h.fs.exists("/Photos/keep.jpg"));
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn test_keep_both_policy_creates_dated_conflict_copy() {
    let config = ConfigBuilder::new()
        .conflicts_default_strategy("keep_both")
        .build();
    let h = harness_with(config).await;
    h.cloud.put_remote("/report.docx", b"v1");
    h.engine.start_sync().await.unwrap();

    h.fs.put("/report.docx", b"local edit");
    h.cloud.put_remote("/report.docx", b"remote edit");
    let result = h.engine.start_sync().await.unwrap();

    let copy = "/report (conflicted copy 2024-05-01).docx";
    assert_eq!(result.conflicts, 1);
    assert_eq!(h.fs.content("/report.docx").as_deref(), Some(&b"remote edit"[..]));
    assert_eq!(h.fs.content(copy).as_deref(), Some(&b"local edit"[..]));
    assert_eq!(h.cloud.content(copy).as_deref(), Some(&b"local edit"[..]));
    assert_eq!(h.cloud.content("/report.docx").as_deref(), Some(&b"remote edit"[..]));
    assert!(h.engine.pending_conflicts().await.is_empty());
    assert_eq!(item_state(&h, copy).await, Some(ItemState::Synced));
    assert!(h.notifier.sent().iter().any(|n| n.category == "conflict"));
}

#[tokio::test]
async fn test_ask_user_conflict_waits_for_resolution() {
    let h = harness().await;
    h.cloud.put_remote("/plan.txt", b"base");
    h.engine.start_sync().await.unwrap();

    h.fs.put("/plan.txt", b"mine");
    h.cloud.put_remote("/plan.txt", b"theirs");
    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.conflicts, 1);
    assert_eq!(item_state(&h, "/plan.txt").await, Some(ItemState::Conflicted));
    assert_eq!(h.engine.pending_conflicts().await.len(), 1);
    assert_eq!(h.fs.content("/plan.txt").as_deref(), Some(&b"mine"[..]));

    // A pending conflict is left alone by later cycles
    let result = h.engine.start_sync().await.unwrap();
    assert_eq!(result.uploaded + result.downloaded, 0);

    let outcome = h
        .engine
        .resolve_conflict(&path("/plan.txt"), Resolution::KeepLocal)
        .await
        .unwrap();
    assert!(outcome.resolved);
    assert_eq!(h.cloud.content("/plan.txt").as_deref(), Some(&b"mine"[..]));
    assert_eq!(item_state(&h, "/plan.txt").await, Some(ItemState::Synced));
    assert!(h.engine.pending_conflicts().await.is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_auth_failure_enters_error_and_asks_for_sign_in() {
    let h = harness().await;
    h.cloud.fail_next(
        "get_changes",
        SyncError::AuthenticationFailed("token expired".into()),
    );

    let err = h.engine.start_sync().await.unwrap_err();

    assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    assert!(matches!(h.engine.state(), EngineState::Error(_)));
    let auth: Vec<_> = h
        .notifier
        .sent()
        .into_iter()
        .filter(|n| n.category == "auth")
        .collect();
    assert_eq!(auth.len(), 1);

    // Item work is refused until the user signs in again
    h.fs.put("/a.txt", b"x");
    let err = h.engine.sync_file(&path("/a.txt")).await.unwrap_err();
    assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    assert_eq!(h.cloud.calls("upload_file"), 0);

    h.engine.reset().unwrap();
    assert_eq!(h.engine.state(), EngineState::Idle);
    let result = h.engine.start_sync().await.unwrap();
    assert_eq!(result.uploaded, 1);
}

#[tokio::test]
async fn test_permission_denied_marks_item_and_notifies() {
    let h = harness().await;
    h.fs.put("/secret.txt", b"x");
    h.fs.put("/open.txt", b"y");
    h.fs.fail_path(
        "/secret.txt",
        SyncError::PermissionDenied("/secret.txt".into()),
    );

    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.uploaded, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(matches!(
        item_state(&h, "/secret.txt").await,
        Some(ItemState::Error(_))
    ));
    assert!(h.notifier.sent().iter().any(|n| n.category == "permission"));
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_insufficient_disk_space_fails_item_and_keeps_cursor() {
    let h = harness().await;
    h.cloud.put_remote("/big.bin", &[7u8; 100]);
    h.fs.set_available_space(10);

    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.downloaded, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(!h.fs.exists("/big.bin"));
    assert!(matches!(
        item_state(&h, "/big.bin").await,
        Some(ItemState::Error(_))
    ));
    assert!(h.notifier.sent().iter().any(|n| n.category == "error"));
    // The batch failed, so it is delivered again next cycle
    assert!(h.repo.get_cursor().await.unwrap().is_none());

    h.fs.set_available_space(u64::MAX);
    let result = h.engine.start_sync().await.unwrap();
    assert_eq!(result.downloaded, 1);
    assert!(h.repo.get_cursor().await.unwrap().is_some());
    assert_eq!(item_state(&h, "/big.bin").await, Some(ItemState::Synced));
}

#[tokio::test]
async fn test_cancelled_download_rolls_back() {
    let config = ConfigBuilder::new()
        .bandwidth_download_limit(Some(1024))
        .build();
    let h = harness_with(config).await;
    h.cloud.put_remote("/slow.bin", &[1u8; 64 * 1024]);

    let engine = h.engine.clone();
    let cycle = tokio::spawn(async move { engine.start_sync().await });

    let session = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some((id, _)) = h.engine.active_sessions().into_iter().next() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("download should start");
    assert_eq!(item_state(&h, "/slow.bin").await, Some(ItemState::Syncing));

    assert!(h.engine.cancel(session));
    let result = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(result.downloaded, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(!h.fs.exists("/slow.bin"));
    assert_eq!(item_state(&h, "/slow.bin").await, Some(ItemState::NotSynced));
    assert!(h.engine.active_sessions().is_empty());
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let h = harness().await;
    h.fs.put("/a.txt", b"x");
    h.cloud
        .fail_next("upload_file", SyncError::ConnectionTimeout("slow".into()));

    let result = h.engine.start_sync().await.unwrap();

    assert_eq!(result.uploaded, 1);
    assert_eq!(h.cloud.calls("upload_file"), 2);
}

// ============================================================================
// Engine state and recovery
// ============================================================================

#[tokio::test]
async fn test_invalid_transitions_are_rejected() {
    let h = harness().await;
    assert!(h.engine.pause_sync(false).is_err());
    assert!(h.engine.resume_sync().is_err());
    assert!(h.engine.stop_sync().is_ok());
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_nothing_selected_is_a_configuration_error() {
    let h = harness().await;
    h.engine.selection().deselect_all().await.unwrap();

    let err = h.engine.start_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn test_rebuild_reconciles_without_transfers() {
    let h = harness().await;
    h.cloud.put_remote("/Docs/a.txt", b"a");
    h.fs.put("/Docs/b.txt", b"b");
    h.engine.start_sync().await.unwrap();
    let downloads = h.cloud.calls("download_file");

    let result = h.engine.rebuild_state().await.unwrap();

    assert_eq!(result.downloaded, 0);
    assert_eq!(h.cloud.calls("download_file"), downloads);
    assert_eq!(item_state(&h, "/Docs/a.txt").await, Some(ItemState::Synced));
    assert_eq!(item_state(&h, "/Docs/b.txt").await, Some(ItemState::Synced));
    assert!(h.repo.get_cursor().await.unwrap().is_some());
}

#[tokio::test]
async fn test_item_events_are_published() {
    let h = harness().await;
    let mut items = h.engine.events().item_changes();
    h.cloud.put_remote("/a.txt", b"x");

    h.engine.start_sync().await.unwrap();

    let mut saw_added = false;
    while let Ok(change) = items.try_recv() {
        if change.path == path("/a.txt") && change.change_type == ChangeType::Added {
            saw_added = true;
        }
    }
    assert!(saw_added);
}
