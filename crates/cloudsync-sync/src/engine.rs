//! Synchronization engine
//!
//! The [`SyncEngine`] keeps a local replica and a cloud drive converged. It
//! owns the engine state machine, the per-item pipeline and the wiring
//! between the selection, the offline queue, the offline cache, the
//! bandwidth scheduler and the conflict resolver.
//!
//! ## Sync Flow
//!
//! 1. **Offline queue**: replay modifications recorded while disconnected
//! 2. **Remote changes** (pull): consume the change feed from the stored
//!    cursor; the cursor advances only after a whole batch applied cleanly
//! 3. **Local changes** (push): scan the replica for new, modified and
//!    deleted files
//!
//! Every intent for a path, from the feed, the scan, a local event or a
//! replayed modification, goes through the same steps under that path's
//! lock: scope check, conflict classification, bandwidth admission,
//! transfer, state update and event publication.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cloudsync_conflict::{
    ConflictDetector, ConflictResolver, DetectionResult, PolicyEngine, ResolutionOutcome,
    SyncDirection,
};
use cloudsync_core::config::Config;
use cloudsync_core::domain::{
    ChangeType, ConflictEvent, ConflictInfo, ContentHash, DomainError, EngineState, ErrorCategory,
    ErrorInfo, ItemChange, ItemSnapshot, ItemState, NetworkQuality, NetworkType,
    OfflineModification, OfflineOperation, Resolution, ResolutionSource, SessionId, SyncError,
    SyncItem, SyncPath, SyncProgress, TransferId, TransferPriority, TransferStatus, TransferType,
    VersionTag,
};
use cloudsync_core::ports::{
    FileAttributes, ICloudApi, IEncryptionService, IFileSystem, INotificationService,
    IStateRepository, ItemFilter, Notification, RemoteChange, RemoteEntry,
};

use crate::bandwidth::BandwidthScheduler;
use crate::events::EventHub;
use crate::offline_cache::OfflineCache;
use crate::offline_queue::{ModificationReplayer, OfflineQueue, ReplayReport};
use crate::path_locks::PathLocks;
use crate::retry::RetryPolicy;
use crate::selective::SelectiveSyncManager;
use crate::storage_error;

/// Bytes paced through the bandwidth scheduler per step
const TRANSFER_CHUNK: u64 = 256 * 1024;

/// Upper bound on how long a notification may hold up the pipeline
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Results
// ============================================================================

/// Summary of a sync cycle or a folder sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub downloaded: u32,
    pub uploaded: u32,
    pub deleted: u32,
    pub conflicts: u32,
    /// Per-item failures that did not abort the cycle
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncResult {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Downloaded => self.downloaded += 1,
            ItemOutcome::Uploaded => self.uploaded += 1,
            ItemOutcome::DeletedLocal | ItemOutcome::DeletedRemote => self.deleted += 1,
            ItemOutcome::Conflicted | ItemOutcome::Resolved(_) => self.conflicts += 1,
            _ => {}
        }
    }

    fn record_error(&mut self, path: &SyncPath, err: &SyncError) {
        self.errors.push(format!("{path}: {err}"));
    }

    pub fn merge(&mut self, other: SyncResult) {
        self.downloaded += other.downloaded;
        self.uploaded += other.uploaded;
        self.deleted += other.deleted;
        self.conflicts += other.conflicts;
        self.errors.extend(other.errors);
    }

    /// True if nothing changed and nothing failed
    pub fn is_empty(&self) -> bool {
        self.downloaded == 0
            && self.uploaded == 0
            && self.deleted == 0
            && self.conflicts == 0
            && self.errors.is_empty()
    }
}

/// What the pipeline did for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Excluded or outside the selection
    OutOfScope,
    /// Both sides already agree
    InSync,
    Uploaded,
    Downloaded,
    DeletedLocal,
    DeletedRemote,
    /// Gone on both sides; the record was dropped
    Forgotten,
    Moved { to: SyncPath },
    /// Waiting for a resolution
    Conflicted,
    /// Conflict detected and settled by policy
    Resolved(Resolution),
    /// Recorded in the offline queue
    Queued,
}

/// A change observed in the local replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created(SyncPath),
    Modified(SyncPath),
    Deleted(SyncPath),
    Moved { from: SyncPath, to: SyncPath },
}

impl LocalEvent {
    /// Path the event leaves behind (the target for moves)
    pub fn path(&self) -> &SyncPath {
        match self {
            LocalEvent::Created(p) | LocalEvent::Modified(p) | LocalEvent::Deleted(p) => p,
            LocalEvent::Moved { to, .. } => to,
        }
    }
}

/// Pipeline result plus a conflict copy left to upload once the lock is released
struct Reconciled {
    outcome: ItemOutcome,
    conflict_copy: Option<SyncPath>,
}

impl From<ItemOutcome> for Reconciled {
    fn from(outcome: ItemOutcome) -> Self {
        Self {
            outcome,
            conflict_copy: None,
        }
    }
}

/// What a folder pass found for the folder itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FolderPlan {
    Present,
    /// Synced before, now only local: the cloud deleted it
    RemoteGone,
    /// Synced before, now only remote: the user deleted it
    LocalGone,
    Gone,
}

#[derive(Debug, Clone)]
struct LiveItem {
    state: ItemState,
    size: u64,
    is_directory: bool,
}

/// Errors that abort a whole cycle instead of a single item
///
/// A cancelled transfer session only fails its own item; cancellation is
/// fatal once the run itself was stopped.
fn is_fatal(err: &SyncError, run: &CancellationToken) -> bool {
    match err {
        SyncError::AuthenticationFailed(_) | SyncError::SyncDatabaseCorrupted(_) => true,
        SyncError::Cancelled => run.is_cancelled(),
        _ => false,
    }
}

fn remote_snapshot(entry: Option<&RemoteEntry>) -> ItemSnapshot {
    match entry {
        Some(entry) => {
            let snapshot =
                ItemSnapshot::present(entry.content_hash.clone(), entry.size, entry.modified_at);
            match &entry.version_tag {
                Some(tag) => snapshot.with_version_tag(tag.clone()),
                None => snapshot,
            }
        }
        None => ItemSnapshot::deleted(Utc::now()),
    }
}

/// Re-roots `path` from under `from` to under `to`
fn rebase(path: &SyncPath, from: &SyncPath, to: &SyncPath) -> Result<SyncPath, SyncError> {
    let suffix = &path.as_str()[from.as_str().len()..];
    Ok(format!("{}{}", to.as_str(), suffix).parse::<SyncPath>()?)
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Orchestrates synchronization between the local replica and the cloud
pub struct SyncEngine {
    config: Config,
    cloud: Arc<dyn ICloudApi>,
    file_system: Arc<dyn IFileSystem>,
    encryption: Arc<dyn IEncryptionService>,
    notifier: Arc<dyn INotificationService>,
    repository: Arc<dyn IStateRepository>,
    events: Arc<EventHub>,
    bandwidth: Arc<BandwidthScheduler>,
    selection: Arc<SelectiveSyncManager>,
    queue: Arc<OfflineQueue>,
    cache: Arc<OfflineCache>,
    resolver: ConflictResolver,
    policy: PolicyEngine,
    retry: RetryPolicy,
    locks: PathLocks,
    /// Held for the duration of a cycle
    cycle: tokio::sync::Mutex<()>,
    /// Parent of every session token; replaced on stop
    run_token: Mutex<CancellationToken>,
    sessions: DashMap<SessionId, (SyncPath, CancellationToken)>,
    live: Mutex<HashMap<SyncPath, LiveItem>>,
    auth_failed: AtomicBool,
    max_concurrent: usize,
}

impl SyncEngine {
    /// Creates an engine; call [`SyncEngine::initialize`] before syncing
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` for malformed exclude patterns
    pub fn new(
        config: Config,
        cloud: Arc<dyn ICloudApi>,
        file_system: Arc<dyn IFileSystem>,
        encryption: Arc<dyn IEncryptionService>,
        notifier: Arc<dyn INotificationService>,
        repository: Arc<dyn IStateRepository>,
    ) -> Result<Self, SyncError> {
        let events = Arc::new(EventHub::new());
        let bandwidth = Arc::new(BandwidthScheduler::new(&config.bandwidth, events.clone()));
        let selection = Arc::new(SelectiveSyncManager::new(
            &config.sync.exclude_patterns,
            repository.clone(),
            events.clone(),
        )?);
        let queue = Arc::new(OfflineQueue::new(repository.clone()));
        let cache = Arc::new(OfflineCache::new(
            &config.offline,
            repository.clone(),
            events.clone(),
        ));
        let resolver = ConflictResolver::new(
            cloud.clone(),
            file_system.clone(),
            encryption.clone(),
            repository.clone(),
        );
        let policy = PolicyEngine::from_config(&config.conflicts);
        let retry = RetryPolicy::from_config(
            &config.retry,
            Duration::from_secs(config.sync.transfer_timeout),
        );
        let max_concurrent = config.sync.max_concurrent_transfers.max(1);

        Ok(Self {
            config,
            cloud,
            file_system,
            encryption,
            notifier,
            repository,
            events,
            bandwidth,
            selection,
            queue,
            cache,
            resolver,
            policy,
            retry,
            locks: PathLocks::new(),
            cycle: tokio::sync::Mutex::new(()),
            run_token: Mutex::new(CancellationToken::new()),
            sessions: DashMap::new(),
            live: Mutex::new(HashMap::new()),
            auth_failed: AtomicBool::new(false),
            max_concurrent,
        })
    }

    /// Overrides the date used in conflict copy names
    pub fn with_conflict_date_source<F>(mut self, today: F) -> Self
    where
        F: Fn() -> NaiveDate + Send + Sync + 'static,
    {
        self.resolver = ConflictResolver::new(
            self.cloud.clone(),
            self.file_system.clone(),
            self.encryption.clone(),
            self.repository.clone(),
        )
        .with_date_source(today);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Restores persisted state: selection, queue, cache, conflicts and items
    ///
    /// A corrupted store is rebuilt from the cloud.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), SyncError> {
        match self.load_state().await {
            Err(SyncError::SyncDatabaseCorrupted(msg)) => {
                warn!(error = %msg, "State store corrupted, rebuilding");
                self.rebuild_state().await.map(|_| ())
            }
            other => other,
        }
    }

    async fn load_state(&self) -> Result<(), SyncError> {
        if !self.selection.load().await? {
            self.selection
                .seed_from_config(&self.config.sync.selected_folders)
                .await?;
        }
        let queued = self.queue.load().await?;
        let cached = self.cache.load().await?;
        let conflicts = self
            .resolver
            .load_pending()
            .await
            .map_err(|e| e.into_sync_error("conflicts"))?;
        let items = self
            .repository
            .query_items(&ItemFilter::new())
            .await
            .map_err(storage_error)?;
        let count = items.len();
        {
            let mut live = self.live_items();
            live.clear();
            for item in &items {
                live.insert(item.path().clone(), LiveItem::from(item));
            }
        }
        self.publish_progress();
        info!(
            items = count,
            queued, cached, conflicts, "Sync state loaded"
        );
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthScheduler> {
        &self.bandwidth
    }

    pub fn selection(&self) -> &Arc<SelectiveSyncManager> {
        &self.selection
    }

    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn offline_cache(&self) -> &Arc<OfflineCache> {
        &self.cache
    }

    pub fn state(&self) -> EngineState {
        self.events.current_state()
    }

    /// Aggregate progress over the live item set
    pub fn progress(&self) -> SyncProgress {
        let live = self.live_items();
        let mut progress = SyncProgress::default();
        for item in live.values().filter(|i| !i.is_directory) {
            progress.total_items += 1;
            progress.total_bytes += item.size;
            if item.state == ItemState::Synced {
                progress.completed_items += 1;
                progress.transferred_bytes += item.size;
            }
        }
        progress
    }

    pub async fn pending_conflicts(&self) -> Vec<ConflictInfo> {
        self.resolver.pending_conflicts().await
    }

    /// In-flight transfers and the paths they move
    pub fn active_sessions(&self) -> Vec<(SessionId, SyncPath)> {
        self.sessions
            .iter()
            .map(|e| (*e.key(), e.value().0.clone()))
            .collect()
    }

    // ========================================================================
    // Engine state machine
    // ========================================================================

    fn transition(&self, target: EngineState) -> Result<(), SyncError> {
        match self.events.transition_state(target.clone()) {
            Ok(Some(previous)) => {
                info!(from = previous.name(), to = target.name(), "Engine state changed");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(current) => Err(DomainError::InvalidState {
                from: current.name().to_string(),
                to: target.name().to_string(),
            }
            .into()),
        }
    }

    fn run_token(&self) -> CancellationToken {
        self.run_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs one full cycle: offline replay, remote pull, local scan
    ///
    /// A call while another cycle is running returns an empty result.
    #[tracing::instrument(skip(self))]
    pub async fn start_sync(&self) -> Result<SyncResult, SyncError> {
        if !self.selection.has_selection().await && self.cache.cache_usage().await.item_count == 0
        {
            return Err(SyncError::InvalidConfiguration(
                "no folders selected for sync".to_string(),
            ));
        }

        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("Sync cycle already running");
            return Ok(SyncResult::default());
        };

        self.transition(EngineState::Syncing)?;
        self.auth_failed.store(false, Ordering::SeqCst);
        self.bandwidth.resume_all_transfers();
        let start = Instant::now();
        info!("Sync cycle started");

        match self.run_cycle().await {
            Ok(mut result) => {
                result.duration_ms = start.elapsed().as_millis() as u64;
                if self.state() == EngineState::Syncing {
                    self.transition(EngineState::Idle)?;
                }
                info!(
                    downloaded = result.downloaded,
                    uploaded = result.uploaded,
                    deleted = result.deleted,
                    conflicts = result.conflicts,
                    errors = result.errors.len(),
                    duration_ms = result.duration_ms,
                    "Sync cycle completed"
                );
                Ok(result)
            }
            Err(SyncError::Cancelled) => {
                info!("Sync cycle cancelled");
                Err(SyncError::Cancelled)
            }
            Err(SyncError::AuthenticationFailed(msg)) => {
                self.enter_auth_error(&msg).await;
                Err(SyncError::AuthenticationFailed(msg))
            }
            Err(err) => {
                error!(error = %err, "Sync cycle failed");
                if let Err(e) = self.transition(EngineState::Error(err.to_string())) {
                    warn!(error = %e, "Could not record engine failure");
                }
                Err(err)
            }
        }
    }

    async fn run_cycle(&self) -> Result<SyncResult, SyncError> {
        let token = self.run_token();
        let mut result = SyncResult::default();

        if self.queue.is_network_available() && self.queue.pending_count().await > 0 {
            let report = self.replay_offline_queue().await;
            if let Some(err) = report.error {
                result.errors.push(format!("offline replay: {err}"));
            }
        }

        match self.fetch_remote_changes().await {
            Ok(fetched) => result.merge(fetched),
            Err(SyncError::SyncDatabaseCorrupted(msg)) => {
                warn!(error = %msg, "State store corrupted during pull, rebuilding");
                result.merge(self.rebuild_state().await?);
            }
            Err(err) if err.category() == ErrorCategory::Network => {
                warn!(error = %err, "Change feed unreachable, continuing offline");
                self.queue.set_network_available(false).await;
                result.errors.push(format!("change feed: {err}"));
                return Ok(result);
            }
            Err(err) => return Err(err),
        }
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        if self.queue.set_network_available(true).await {
            let report = self.replay_offline_queue().await;
            if let Some(err) = report.error {
                result.errors.push(format!("offline replay: {err}"));
            }
        }
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        match self.scan_local_changes().await {
            Ok(scanned) => result.merge(scanned),
            Err(SyncError::SyncDatabaseCorrupted(msg)) => {
                warn!(error = %msg, "State store corrupted during scan, rebuilding");
                result.merge(self.rebuild_state().await?);
            }
            Err(err) => return Err(err),
        }

        Ok(result)
    }

    /// Suspends new work; in-flight transfers keep going unless
    /// `cancel_in_flight` is set, in which case they roll back
    pub fn pause_sync(&self, cancel_in_flight: bool) -> Result<(), SyncError> {
        self.transition(EngineState::Paused)?;
        self.bandwidth.pause_all_transfers();
        if cancel_in_flight {
            for session in self.sessions.iter() {
                session.value().1.cancel();
            }
        }
        Ok(())
    }

    pub fn resume_sync(&self) -> Result<(), SyncError> {
        if self.state() != EngineState::Paused {
            return Err(DomainError::InvalidState {
                from: self.state().name().to_string(),
                to: EngineState::Syncing.name().to_string(),
            }
            .into());
        }
        self.transition(EngineState::Syncing)?;
        self.bandwidth.resume_all_transfers();
        // No cycle to return to
        if self.cycle.try_lock().is_ok() {
            self.transition(EngineState::Idle)?;
        }
        Ok(())
    }

    /// Cancels everything in flight and returns to idle
    pub fn stop_sync(&self) -> Result<(), SyncError> {
        if self.state() == EngineState::Idle {
            return Ok(());
        }
        let previous = {
            let mut token = self
                .run_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        previous.cancel();
        self.bandwidth.resume_all_transfers();
        self.transition(EngineState::Idle)
    }

    /// Leaves the error state
    pub fn reset(&self) -> Result<(), SyncError> {
        if !matches!(self.state(), EngineState::Error(_)) {
            return Ok(());
        }
        self.auth_failed.store(false, Ordering::SeqCst);
        self.transition(EngineState::Idle)
    }

    /// Cancels one transfer session; its item returns to its previous state
    pub fn cancel(&self, session_id: SessionId) -> bool {
        match self.sessions.get(&session_id) {
            Some(session) => {
                info!(session = %session_id, path = %session.value().0, "Cancelling transfer");
                session.value().1.cancel();
                true
            }
            None => false,
        }
    }

    /// Waits while paused; fails once cancelled or after an auth failure
    async fn admit(&self, token: &CancellationToken) -> Result<(), SyncError> {
        let mut state = self.events.watch_state();
        loop {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if self.auth_failed.load(Ordering::SeqCst) {
                return Err(SyncError::AuthenticationFailed(
                    "re-authentication required".to_string(),
                ));
            }
            let paused = matches!(*state.borrow_and_update(), EngineState::Paused);
            if !paused {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn enter_auth_error(&self, reason: &str) {
        if self.auth_failed.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(reason, "Authentication failed, transfers suspended");
        if let Err(e) = self.transition(EngineState::Error(format!(
            "authentication failed: {reason}"
        ))) {
            warn!(error = %e, "Could not enter error state");
        }
        self.notify(Notification::reauthentication_required(reason.to_string()))
            .await;
    }

    /// Side effects of a failure that escaped the pipeline
    async fn observe_failure(&self, err: &SyncError) {
        match err {
            SyncError::AuthenticationFailed(reason) => self.enter_auth_error(reason).await,
            SyncError::NetworkUnavailable(_) => {
                self.queue.set_network_available(false).await;
            }
            _ => {}
        }
    }

    async fn notify(&self, notification: Notification) {
        match tokio::time::timeout(NOTIFY_TIMEOUT, self.notifier.notify(&notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, title = %notification.title, "Notification failed"),
            Err(_) => warn!(title = %notification.title, "Notification timed out"),
        }
    }

    // ========================================================================
    // Live item set
    // ========================================================================

    fn live_items(&self) -> MutexGuard<'_, HashMap<SyncPath, LiveItem>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, item: &SyncItem) {
        self.live_items()
            .insert(item.path().clone(), LiveItem::from(item));
        self.publish_progress();
    }

    fn untrack(&self, path: &SyncPath) {
        self.live_items().retain(|p, _| !p.is_within(path));
        self.publish_progress();
    }

    fn publish_progress(&self) {
        self.events.publish_progress(self.progress());
    }

    async fn in_scope(&self, path: &SyncPath) -> bool {
        !self.selection.is_excluded(path)
            && (self.selection.is_in_scope(path).await || self.cache.covers(path).await)
    }

    async fn load_item(&self, path: &SyncPath) -> Result<Option<SyncItem>, SyncError> {
        self.repository.get_item(path).await.map_err(storage_error)
    }

    async fn save_item(&self, item: &SyncItem) -> Result<(), SyncError> {
        self.repository
            .save_item(item)
            .await
            .map_err(storage_error)?;
        self.track(item);
        Ok(())
    }

    async fn save_and_publish(
        &self,
        item: &SyncItem,
        change_type: ChangeType,
    ) -> Result<(), SyncError> {
        self.save_item(item).await?;
        self.events.publish_item(ItemChange::new(
            item.path().clone(),
            change_type,
            item.state().clone(),
        ));
        Ok(())
    }

    /// Drops the records at and below `path`
    async fn forget_tree(&self, path: &SyncPath) -> Result<(), SyncError> {
        let items = self
            .repository
            .query_items(&ItemFilter::new().with_path_prefix(path.clone()))
            .await
            .map_err(storage_error)?;
        for item in items {
            self.repository
                .delete_item(item.path())
                .await
                .map_err(storage_error)?;
            if self.resolver.has_pending(item.path()).await {
                self.resolver
                    .forget(item.path())
                    .await
                    .map_err(|e| e.into_sync_error(item.path().as_str()))?;
            }
        }
        self.untrack(path);
        Ok(())
    }

    // ========================================================================
    // Remote changes (pull)
    // ========================================================================

    /// Consumes the change feed from the stored cursor
    ///
    /// The cursor is saved after each batch that applied without failures;
    /// a failed item leaves the cursor where it was so the batch is
    /// delivered again.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_remote_changes(&self) -> Result<SyncResult, SyncError> {
        let token = self.run_token();
        let mut result = SyncResult::default();
        let mut cursor = self
            .repository
            .get_cursor()
            .await
            .map_err(storage_error)?;
        if cursor.is_none() {
            info!("No stored cursor, enumerating the cloud from scratch");
        }

        loop {
            self.admit(&token).await?;
            let from = cursor.clone();
            let batch = self
                .retry
                .with_retry("get_changes", &token, || self.cloud.get_changes(from.as_ref()))
                .await?;
            debug!(
                changes = batch.changes.len(),
                has_more = batch.has_more,
                "Change feed batch"
            );

            let mut clean = true;
            for change in &batch.changes {
                match self.apply_remote_change(change, &token).await {
                    Ok(outcome) => result.record(&outcome),
                    Err(err) if is_fatal(&err, &token) => return Err(err),
                    Err(err) => {
                        clean = false;
                        warn!(path = %change.path(), error = %err, "Failed to apply remote change");
                        result.record_error(change.path(), &err);
                    }
                }
            }

            if !clean {
                warn!("Batch incomplete, cursor not advanced");
                break;
            }
            self.repository
                .save_cursor(batch.cursor.as_ref())
                .await
                .map_err(storage_error)?;
            cursor = batch.cursor;
            if !batch.has_more {
                break;
            }
        }

        Ok(result)
    }

    async fn apply_remote_change(
        &self,
        change: &RemoteChange,
        token: &CancellationToken,
    ) -> Result<ItemOutcome, SyncError> {
        match change {
            RemoteChange::Upserted(entry) => self.apply_remote_upsert(entry, token).await,
            RemoteChange::Deleted { path } => self.apply_remote_delete(path, token).await,
            RemoteChange::Moved { from, entry } => {
                self.apply_remote_move(from, entry, token).await
            }
        }
    }

    async fn apply_remote_upsert(
        &self,
        entry: &RemoteEntry,
        token: &CancellationToken,
    ) -> Result<ItemOutcome, SyncError> {
        self.selection
            .add_entry(&entry.path, entry.is_directory, entry.size)
            .await;
        if !self.in_scope(&entry.path).await {
            return Ok(ItemOutcome::OutOfScope);
        }

        let reconciled = {
            let _guard = self.locks.lock(&entry.path).await;
            let item = self.load_item(&entry.path).await?;

            if entry.is_directory {
                return self.ensure_local_directory(item, entry).await;
            }

            // Feed replays are idempotent
            if let Some(item) = &item {
                if item.state() == &ItemState::Synced
                    && entry.version_tag.is_some()
                    && item.remote_version_tag() == entry.version_tag.as_ref()
                {
                    return Ok(ItemOutcome::InSync);
                }
            }

            let item = item.unwrap_or_else(|| SyncItem::new_file(entry.path.clone()));
            let (_, local) = match self.observe_local(&entry.path).await {
                Ok(observed) => observed,
                Err(err) => return Err(self.fail_observation(item, err).await),
            };
            self.reconcile(
                item,
                local,
                remote_snapshot(Some(entry)),
                Some(entry.clone()),
                token,
            )
            .await?
        };
        Ok(self.finish(reconciled).await)
    }

    async fn ensure_local_directory(
        &self,
        item: Option<SyncItem>,
        entry: &RemoteEntry,
    ) -> Result<ItemOutcome, SyncError> {
        let exists = self
            .file_system
            .get_file_attributes(&entry.path)
            .await?
            .is_some();
        // Synced before and gone locally: the user deleted it, the scan pushes that
        if !exists && item.as_ref().is_some_and(|i| i.last_synced_at().is_some()) {
            return Ok(ItemOutcome::InSync);
        }
        if !exists {
            self.file_system.create_directory(&entry.path).await?;
            debug!(path = %entry.path, "Created local folder");
        }
        self.settle_directory(item, entry).await?;
        Ok(ItemOutcome::InSync)
    }

    async fn settle_directory(
        &self,
        item: Option<SyncItem>,
        entry: &RemoteEntry,
    ) -> Result<(), SyncError> {
        let mut item = item.unwrap_or_else(|| SyncItem::new_directory(entry.path.clone()));
        if item.state() == &ItemState::Synced
            && item.remote_version_tag() == entry.version_tag.as_ref()
        {
            return Ok(());
        }
        if !item.can_transition_to(&ItemState::Synced) {
            item.transition_to(ItemState::NotSynced)?;
        }
        item.set_remote_id(Some(entry.remote_id.clone()));
        item.mark_synced(None, entry.version_tag.clone(), 0, Utc::now())?;
        self.save_and_publish(&item, ChangeType::StateChanged).await
    }

    async fn apply_remote_delete(
        &self,
        path: &SyncPath,
        token: &CancellationToken,
    ) -> Result<ItemOutcome, SyncError> {
        self.selection.remove_entry(path).await;
        let items = self
            .repository
            .query_items(&ItemFilter::new().with_path_prefix(path.clone()))
            .await
            .map_err(storage_error)?;
        if items.is_empty() {
            return Ok(ItemOutcome::InSync);
        }

        let mut deleted = false;
        let mut blocked = false;
        let (folders, files): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|i| i.is_directory());

        for item in files {
            let item_path = item.path().clone();
            let reconciled = {
                let _guard = self.locks.lock(&item_path).await;
                let (_, local) = match self.observe_local(&item_path).await {
                    Ok(observed) => observed,
                    Err(err) => return Err(self.fail_observation(item, err).await),
                };
                self.reconcile(item, local, ItemSnapshot::deleted(Utc::now()), None, token)
                    .await?
            };
            match self.finish(reconciled).await {
                ItemOutcome::DeletedLocal | ItemOutcome::Forgotten => deleted = true,
                ItemOutcome::InSync | ItemOutcome::OutOfScope => {}
                _ => blocked = true,
            }
        }

        // Deepest folders first; keep any that still hold local content
        for folder in folders.iter().rev() {
            let _guard = self.locks.lock(folder.path()).await;
            let children = match self.file_system.list_directory(folder.path()).await {
                Ok(children) => children,
                Err(SyncError::FileNotFound(_)) => Vec::new(),
                Err(err) => return Err(err),
            };
            if !children.is_empty() {
                blocked = true;
                continue;
            }
            self.file_system.delete_item(folder.path()).await?;
            self.forget_tree(folder.path()).await?;
            self.events.publish_item(ItemChange::new(
                folder.path().clone(),
                ChangeType::Deleted,
                ItemState::PendingDelete,
            ));
            deleted = true;
        }

        if blocked {
            debug!(path = %path, "Remote delete left local content in place");
        }
        Ok(if deleted {
            ItemOutcome::DeletedLocal
        } else {
            ItemOutcome::InSync
        })
    }

    async fn apply_remote_move(
        &self,
        from: &SyncPath,
        entry: &RemoteEntry,
        token: &CancellationToken,
    ) -> Result<ItemOutcome, SyncError> {
        let to = &entry.path;
        self.selection.remove_entry(from).await;
        self.selection
            .add_entry(to, entry.is_directory, entry.size)
            .await;
        let to_in_scope = self.in_scope(to).await;

        let moved = {
            let _guards = self.locks.lock_pair(from, to).await;
            match self.load_item(from).await? {
                None => false,
                Some(_) if !to_in_scope => {
                    self.file_system.delete_item(from).await?;
                    self.forget_tree(from).await?;
                    self.events.publish_item(ItemChange::new(
                        from.clone(),
                        ChangeType::Deleted,
                        ItemState::NotSynced,
                    ));
                    info!(from = %from, to = %to, "Item moved out of the selection");
                    return Ok(ItemOutcome::DeletedLocal);
                }
                Some(_) => {
                    let source = self.file_system.get_file_attributes(from).await?;
                    let target = self.file_system.get_file_attributes(to).await?;
                    if source.is_some() && target.is_none() {
                        self.file_system.move_item(from, to).await?;
                        self.rename_records(from, to, Some(entry)).await?;
                        true
                    } else {
                        // Local side diverged: drop the old record and treat
                        // the target as a fresh arrival
                        self.forget_tree(from).await?;
                        false
                    }
                }
            }
        };

        if moved {
            info!(from = %from, to = %to, "Applied remote move");
            if !entry.is_directory {
                // Content edited before the move still has to come down
                let settled = self.apply_remote_upsert(entry, token).await?;
                if settled != ItemOutcome::InSync {
                    return Ok(settled);
                }
            }
            return Ok(ItemOutcome::Moved { to: to.clone() });
        }
        if entry.is_directory {
            self.sync_folder(to, true).await?;
            return Ok(ItemOutcome::InSync);
        }
        self.apply_remote_upsert(entry, token).await
    }

    /// Rewrites the records at and below `from` to live under `to`
    async fn rename_records(
        &self,
        from: &SyncPath,
        to: &SyncPath,
        entry: Option<&RemoteEntry>,
    ) -> Result<(), SyncError> {
        let items = self
            .repository
            .query_items(&ItemFilter::new().with_path_prefix(from.clone()))
            .await
            .map_err(storage_error)?;
        for mut item in items {
            let old = item.path().clone();
            let new = rebase(&old, from, to)?;
            self.repository
                .delete_item(&old)
                .await
                .map_err(storage_error)?;
            item.set_path(new.clone());
            if let Some(entry) = entry.filter(|e| e.path == new) {
                item.set_remote_id(Some(entry.remote_id.clone()));
                let same_content = match (&entry.content_hash, item.content_hash()) {
                    (Some(remote), Some(local)) => remote == local,
                    _ => true,
                };
                if item.state() == &ItemState::Synced && same_content {
                    item.mark_synced(
                        item.content_hash().cloned(),
                        entry.version_tag.clone(),
                        item.size(),
                        Utc::now(),
                    )?;
                }
            }
            self.untrack(&old);
            self.save_and_publish(&item, ChangeType::Modified).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Local changes (push)
    // ========================================================================

    /// Scans the replica and pushes what changed since the last sync
    #[tracing::instrument(skip(self))]
    pub async fn scan_local_changes(&self) -> Result<SyncResult, SyncError> {
        let token = self.run_token();
        let mut seen = HashSet::new();
        let mut new_folders = BTreeSet::new();
        let mut candidates = BTreeSet::new();
        self.walk_local(
            &SyncPath::root(),
            &mut seen,
            &mut new_folders,
            &mut candidates,
        )
        .await?;

        // Tracked files whose local copy vanished
        let items = self
            .repository
            .query_items(&ItemFilter::new())
            .await
            .map_err(storage_error)?;
        for item in items {
            if item.is_directory()
                || seen.contains(item.path())
                || item.state() == &ItemState::Conflicted
            {
                continue;
            }
            if self.in_scope(item.path()).await {
                candidates.insert(item.path().clone());
            }
        }

        info!(
            folders = new_folders.len(),
            files = candidates.len(),
            "Local changes detected"
        );

        let mut result = SyncResult::default();
        for folder in &new_folders {
            if let Err(err) = self.ensure_remote_folder(folder, &token).await {
                if is_fatal(&err, &token) {
                    return Err(err);
                }
                warn!(path = %folder, error = %err, "Failed to create remote folder");
                result.record_error(folder, &err);
            }
        }
        result.merge(self.sync_many(candidates.into_iter().collect()).await?);
        Ok(result)
    }

    fn walk_local<'a>(
        &'a self,
        dir: &'a SyncPath,
        seen: &'a mut HashSet<SyncPath>,
        new_folders: &'a mut BTreeSet<SyncPath>,
        candidates: &'a mut BTreeSet<SyncPath>,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let children = match self.file_system.list_directory(dir).await {
                Ok(children) => children,
                Err(SyncError::FileNotFound(_)) => return Ok(()),
                Err(err) => return Err(err),
            };

            for child in children {
                if self.selection.is_excluded(&child) {
                    continue;
                }
                let attrs = match self.file_system.get_file_attributes(&child).await {
                    Ok(Some(attrs)) => attrs,
                    Ok(None) => continue,
                    Err(err) => {
                        // The pipeline records the failure on the item
                        debug!(path = %child, error = %err, "Cannot stat local entry");
                        seen.insert(child.clone());
                        if self.in_scope(&child).await {
                            candidates.insert(child);
                        }
                        continue;
                    }
                };

                if attrs.is_directory {
                    let in_scope = self.in_scope(&child).await;
                    if !in_scope && !self.cache.has_entries_within(&child).await {
                        continue;
                    }
                    if in_scope && self.load_item(&child).await?.is_none() {
                        new_folders.insert(child.clone());
                    }
                    self.walk_local(&child, seen, new_folders, candidates)
                        .await?;
                    continue;
                }

                seen.insert(child.clone());
                if self.in_scope(&child).await && self.local_change_pending(&child, &attrs).await?
                {
                    candidates.insert(child);
                }
            }
            Ok(())
        })
    }

    /// True if the file differs from its last synced baseline
    async fn local_change_pending(
        &self,
        path: &SyncPath,
        attrs: &FileAttributes,
    ) -> Result<bool, SyncError> {
        let Some(item) = self.load_item(path).await? else {
            return Ok(true);
        };
        match item.state() {
            ItemState::Synced => {}
            ItemState::Conflicted => return Ok(false),
            _ => return Ok(true),
        }
        if attrs.size != item.size() {
            return Ok(true);
        }
        let Some(synced_at) = item.last_synced_at() else {
            return Ok(true);
        };
        if attrs.modified_at <= synced_at {
            return Ok(false);
        }
        match self.file_system.compute_hash(path).await {
            Ok(hash) => Ok(item.content_hash() != Some(&hash)),
            Err(_) => Ok(true),
        }
    }

    async fn ensure_remote_folder(
        &self,
        path: &SyncPath,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let _guard = self.locks.lock(path).await;
        let entry = self
            .retry
            .with_retry("create_folder", token, || self.cloud.create_folder(path))
            .await?;
        self.selection.add_entry(path, true, 0).await;
        let item = self.load_item(path).await?;
        self.settle_directory(item, &entry).await
    }

    /// Runs the file pipeline over `paths` with bounded concurrency
    async fn sync_many(&self, paths: Vec<SyncPath>) -> Result<SyncResult, SyncError> {
        let token = self.run_token();
        let outcomes: Vec<(SyncPath, Result<ItemOutcome, SyncError>)> = stream::iter(paths)
            .map(|path| async move {
                let outcome = self.sync_file(&path).await;
                (path, outcome)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut result = SyncResult::default();
        for (path, outcome) in outcomes {
            match outcome {
                Ok(outcome) => result.record(&outcome),
                Err(err) if is_fatal(&err, &token) => return Err(err),
                Err(err) => result.record_error(&path, &err),
            }
        }
        Ok(result)
    }

    // ========================================================================
    // Per-item pipeline
    // ========================================================================

    /// Reconciles one file against the cloud
    #[tracing::instrument(skip(self))]
    pub async fn sync_file(&self, path: &SyncPath) -> Result<ItemOutcome, SyncError> {
        let result = self.sync_file_inner(path).await;
        if let Err(err) = &result {
            self.observe_failure(err).await;
        }
        result
    }

    async fn sync_file_inner(&self, path: &SyncPath) -> Result<ItemOutcome, SyncError> {
        if !self.in_scope(path).await {
            debug!(path = %path, "Out of scope, skipping");
            return Ok(ItemOutcome::OutOfScope);
        }
        let token = self.run_token();
        self.admit(&token).await?;

        let reconciled = {
            let _guard = self.locks.lock(path).await;
            let item = self.load_item(path).await?;
            let remote = self
                .retry
                .with_retry("get_metadata", &token, || self.cloud.get_metadata(path))
                .await?;
            let (attrs, local) = match self.observe_local(path).await {
                Ok(observed) => observed,
                Err(err) => {
                    let item = item.unwrap_or_else(|| SyncItem::new_file(path.clone()));
                    return Err(self.fail_observation(item, err).await);
                }
            };

            let is_directory = remote.as_ref().is_some_and(|e| e.is_directory)
                || attrs.as_ref().is_some_and(|a| a.is_directory);
            if is_directory {
                None
            } else if item.is_none() && local.deleted && remote.is_none() {
                return Ok(ItemOutcome::InSync);
            } else if item.as_ref().map(|i| i.state()) == Some(&ItemState::Conflicted)
                && self.resolver.has_pending(path).await
            {
                return Ok(ItemOutcome::Conflicted);
            } else {
                let item = item.unwrap_or_else(|| SyncItem::new_file(path.clone()));
                let snapshot = remote_snapshot(remote.as_ref());
                Some(self.reconcile(item, local, snapshot, remote, &token).await?)
            }
        };

        match reconciled {
            Some(reconciled) => Ok(self.finish(reconciled).await),
            None => {
                self.sync_folder(path, true).await?;
                Ok(ItemOutcome::InSync)
            }
        }
    }

    /// Local attributes and a snapshot for conflict classification
    ///
    /// A hash that cannot be computed right now leaves the snapshot without
    /// one; classification then falls back to timestamps.
    async fn observe_local(
        &self,
        path: &SyncPath,
    ) -> Result<(Option<FileAttributes>, ItemSnapshot), SyncError> {
        let Some(attrs) = self.file_system.get_file_attributes(path).await? else {
            return Ok((None, ItemSnapshot::deleted(Utc::now())));
        };
        if attrs.is_directory {
            let snapshot = ItemSnapshot::present(None, 0, attrs.modified_at);
            return Ok((Some(attrs), snapshot));
        }
        let hash = match self.file_system.compute_hash(path).await {
            Ok(hash) => Some(hash),
            Err(SyncError::FileNotFound(_)) => {
                return Ok((None, ItemSnapshot::deleted(Utc::now())))
            }
            Err(err) if err.is_retryable() => {
                debug!(path = %path, error = %err, "Local hash unavailable");
                None
            }
            Err(err) => return Err(err),
        };
        let snapshot = ItemSnapshot::present(hash, attrs.size, attrs.modified_at);
        Ok((Some(attrs), snapshot))
    }

    /// Records a local observation failure on the item and returns the error
    async fn fail_observation(&self, item: SyncItem, err: SyncError) -> SyncError {
        if err.category() == ErrorCategory::Filesystem {
            if let Err(e) = self.record_item_error(item, &err).await {
                warn!(error = %e, "Could not record item failure");
            }
        }
        err
    }

    async fn reconcile(
        &self,
        item: SyncItem,
        local: ItemSnapshot,
        remote: ItemSnapshot,
        entry: Option<RemoteEntry>,
        token: &CancellationToken,
    ) -> Result<Reconciled, SyncError> {
        let path = item.path().clone();
        if item.state() == &ItemState::Conflicted && self.resolver.has_pending(&path).await {
            return Ok(ItemOutcome::Conflicted.into());
        }

        let detection = self
            .resolver
            .detect_conflict(&item, &local, &remote)
            .await
            .map_err(|e| e.into_sync_error(path.as_str()))?;

        match detection {
            DetectionResult::Conflicted(conflict) => self.on_conflict(item, *conflict).await,
            DetectionResult::NoConflict(direction) => {
                debug!(path = %path, ?direction, "Reconciled");
                let outcome = match direction {
                    SyncDirection::InSync => self.settle_in_sync(item, &local, entry).await?,
                    SyncDirection::Upload => self.transfer_upload(item, token).await?,
                    SyncDirection::Download => {
                        let entry = entry.ok_or_else(|| SyncError::FileNotFound(path.to_string()))?;
                        self.transfer_download(item, &entry, token).await?
                    }
                    SyncDirection::DeleteLocal => self.delete_local(item).await?,
                    SyncDirection::DeleteRemote => self.delete_remote(item, token).await?,
                    SyncDirection::Forget => {
                        self.forget_tree(&path).await?;
                        ItemOutcome::Forgotten
                    }
                };
                Ok(outcome.into())
            }
        }
    }

    /// Uploads a conflict copy left behind by a keep-both resolution
    async fn finish(&self, reconciled: Reconciled) -> ItemOutcome {
        if let Some(copy) = reconciled.conflict_copy {
            self.upload_conflict_copy(&copy).await;
        }
        reconciled.outcome
    }

    async fn upload_conflict_copy(&self, copy: &SyncPath) {
        let token = self.run_token();
        let _guard = self.locks.lock(copy).await;
        let item = match self.load_item(copy).await {
            Ok(item) => item.unwrap_or_else(|| SyncItem::new_file(copy.clone())),
            Err(err) => {
                warn!(path = %copy, error = %err, "Could not load conflict copy record");
                return;
            }
        };
        self.track(&item);
        if let Err(err) = self.transfer_upload(item, &token).await {
            warn!(path = %copy, error = %err, "Conflict copy upload failed, next scan retries");
        }
    }

    async fn settle_in_sync(
        &self,
        mut item: SyncItem,
        local: &ItemSnapshot,
        entry: Option<RemoteEntry>,
    ) -> Result<ItemOutcome, SyncError> {
        let hash = local
            .content_hash
            .clone()
            .or_else(|| item.content_hash().cloned());
        let tag = entry
            .as_ref()
            .and_then(|e| e.version_tag.clone())
            .or_else(|| item.remote_version_tag().cloned());
        if item.state() == &ItemState::Synced
            && item.content_hash() == hash.as_ref()
            && item.remote_version_tag() == tag.as_ref()
        {
            return Ok(ItemOutcome::InSync);
        }

        if !item.can_transition_to(&ItemState::Synced) {
            item.transition_to(ItemState::NotSynced)?;
        }
        if let Some(entry) = &entry {
            item.set_remote_id(Some(entry.remote_id.clone()));
        }
        item.mark_synced(hash, tag, local.size, Utc::now())?;
        self.save_and_publish(&item, ChangeType::StateChanged).await?;
        Ok(ItemOutcome::InSync)
    }

    async fn on_conflict(
        &self,
        mut item: SyncItem,
        conflict: ConflictInfo,
    ) -> Result<Reconciled, SyncError> {
        let path = item.path().clone();
        item.transition_to(ItemState::Conflicted)?;
        self.save_and_publish(&item, ChangeType::StateChanged).await?;
        self.events
            .publish_conflict(ConflictEvent::Detected(conflict.clone()));
        self.notify(Notification::conflict(
            format!("Conflict: {}", path.file_name().unwrap_or(path.as_str())),
            format!("{path} changed on both sides ({})", conflict.conflict_type()),
        ))
        .await;

        let Some(resolution) = ConflictDetector::should_auto_resolve(&self.policy, &conflict) else {
            info!(path = %path, conflict_type = %conflict.conflict_type(), "Conflict awaits resolution");
            return Ok(ItemOutcome::Conflicted.into());
        };

        info!(path = %path, resolution = %resolution, "Resolving conflict by policy");
        let outcome = self
            .resolve_locked(&path, resolution, ResolutionSource::Policy, item)
            .await?;
        Ok(Reconciled {
            outcome: if outcome.resolved {
                ItemOutcome::Resolved(resolution)
            } else {
                ItemOutcome::Conflicted
            },
            conflict_copy: outcome.conflict_copy,
        })
    }

    async fn resolve_locked(
        &self,
        path: &SyncPath,
        resolution: Resolution,
        source: ResolutionSource,
        item: SyncItem,
    ) -> Result<ResolutionOutcome, SyncError> {
        let outcome = self
            .resolver
            .resolve(path, resolution, source, item)
            .await
            .map_err(|e| e.into_sync_error(path.as_str()))?;
        if !outcome.resolved {
            return Ok(outcome);
        }

        match &outcome.item {
            Some(item) => {
                if item.path() != path {
                    self.untrack(path);
                }
                self.track(item);
                self.events.publish_item(ItemChange::new(
                    item.path().clone(),
                    ChangeType::Modified,
                    item.state().clone(),
                ));
            }
            None => {
                self.untrack(path);
                self.events.publish_item(ItemChange::new(
                    path.clone(),
                    ChangeType::Deleted,
                    ItemState::NotSynced,
                ));
            }
        }
        if let Some(copy) = &outcome.conflict_copy {
            self.track(&SyncItem::new_file(copy.clone()));
        }
        self.events.publish_conflict(ConflictEvent::Resolved {
            path: path.clone(),
            resolution,
            source,
            conflict_copy: outcome.conflict_copy.clone(),
        });
        Ok(outcome)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    fn open_session(&self, path: &SyncPath, token: &CancellationToken) -> (SessionId, CancellationToken) {
        let session = SessionId::new();
        let cancel = token.child_token();
        self.sessions.insert(session, (path.clone(), cancel.clone()));
        (session, cancel)
    }

    /// Paces `total` bytes of a transfer through the scheduler
    async fn pace(
        &self,
        transfer_id: TransferId,
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.bandwidth
            .wait_for_allocation(transfer_id, cancel)
            .await?;
        let mut remaining = total;
        while remaining > 0 {
            let chunk = remaining.min(TRANSFER_CHUNK);
            self.bandwidth.consume(transfer_id, chunk, cancel).await?;
            remaining -= chunk;
        }
        Ok(())
    }

    async fn transfer_upload(
        &self,
        mut item: SyncItem,
        token: &CancellationToken,
    ) -> Result<ItemOutcome, SyncError> {
        let path = item.path().clone();
        let previous = item.state().clone();
        let expected = item.remote_version_tag().cloned();
        let change_type = if expected.is_none() {
            ChangeType::Added
        } else {
            ChangeType::Modified
        };

        item.transition_to(ItemState::Syncing)?;
        self.save_and_publish(&item, ChangeType::StateChanged).await?;

        let (session, cancel) = self.open_session(&path, token);
        let transfer_id = TransferId::new();
        let result = self
            .upload_body(&path, expected.as_ref(), transfer_id, &cancel)
            .await;
        self.sessions.remove(&session);
        self.bandwidth
            .finish_transfer(transfer_id, terminal_status(&result));

        match result {
            Ok((entry, hash)) => {
                item.set_remote_id(Some(entry.remote_id.clone()));
                item.mark_synced(Some(hash), entry.version_tag.clone(), entry.size, Utc::now())?;
                self.save_and_publish(&item, change_type).await?;
                self.selection.add_entry(&path, false, entry.size).await;
                info!(path = %path, bytes = entry.size, "Uploaded");
                Ok(ItemOutcome::Uploaded)
            }
            Err(err) => Err(self.abort_transfer(item, previous, err).await),
        }
    }

    async fn upload_body(
        &self,
        path: &SyncPath,
        expected: Option<&VersionTag>,
        transfer_id: TransferId,
        cancel: &CancellationToken,
    ) -> Result<(RemoteEntry, ContentHash), SyncError> {
        let data = self.file_system.read_file(path).await?;
        let hash = self.file_system.compute_hash(path).await?;
        self.bandwidth.allocate_bandwidth(
            transfer_id,
            TransferType::Upload,
            TransferPriority::Normal,
        );
        self.pace(transfer_id, data.len() as u64, cancel).await?;
        let body = self.encryption.encrypt(data).await?;
        let entry = self
            .retry
            .with_retry("upload_file", cancel, || {
                self.cloud.upload_file(path, body.clone(), expected, None)
            })
            .await?;
        Ok((entry, hash))
    }

    async fn transfer_download(
        &self,
        mut item: SyncItem,
        entry: &RemoteEntry,
        token: &CancellationToken,
    ) -> Result<ItemOutcome, SyncError> {
        let path = item.path().clone();
        let available = self.file_system.get_available_space().await?;
        if available < entry.size {
            let err = SyncError::DiskSpaceInsufficient {
                needed: entry.size,
                available,
            };
            warn!(path = %path, needed = entry.size, available, "Not enough disk space");
            self.record_item_error(item, &err).await?;
            return Err(err);
        }

        let previous = item.state().clone();
        let change_type = if item.last_synced_at().is_none() {
            ChangeType::Added
        } else {
            ChangeType::Modified
        };
        item.transition_to(ItemState::Syncing)?;
        self.save_and_publish(&item, ChangeType::StateChanged).await?;

        let (session, cancel) = self.open_session(&path, token);
        let transfer_id = TransferId::new();
        let result = self
            .download_body(&path, entry.size, transfer_id, &cancel)
            .await;
        self.sessions.remove(&session);
        self.bandwidth
            .finish_transfer(transfer_id, terminal_status(&result));

        match result {
            Ok((fetched, hash)) => {
                item.set_remote_id(Some(fetched.remote_id.clone()));
                item.mark_synced(Some(hash), fetched.version_tag.clone(), fetched.size, Utc::now())?;
                self.save_and_publish(&item, change_type).await?;
                info!(path = %path, bytes = fetched.size, "Downloaded");
                Ok(ItemOutcome::Downloaded)
            }
            Err(SyncError::FileNotFound(missing)) => {
                match self.cloud.get_metadata(&path).await {
                    Ok(None) => self.drop_superseded(item, previous).await,
                    _ => {
                        let err = SyncError::FileNotFound(missing);
                        Err(self.abort_transfer(item, previous, err).await)
                    }
                }
            }
            Err(err) => Err(self.abort_transfer(item, previous, err).await),
        }
    }

    /// The feed named a remote version that has since moved or been deleted
    ///
    /// Later entries of the same feed settle the path, so the download is
    /// skipped and the record goes back to what it was.
    async fn drop_superseded(
        &self,
        mut item: SyncItem,
        previous: ItemState,
    ) -> Result<ItemOutcome, SyncError> {
        let path = item.path().clone();
        info!(path = %path, "Remote version superseded, download skipped");
        if item.last_synced_at().is_none() {
            self.forget_tree(&path).await?;
            self.selection.remove_entry(&path).await;
        } else {
            item.rollback_to(previous)?;
            self.save_and_publish(&item, ChangeType::StateChanged).await?;
        }
        Ok(ItemOutcome::InSync)
    }

    async fn download_body(
        &self,
        path: &SyncPath,
        size: u64,
        transfer_id: TransferId,
        cancel: &CancellationToken,
    ) -> Result<(RemoteEntry, ContentHash), SyncError> {
        self.bandwidth.allocate_bandwidth(
            transfer_id,
            TransferType::Download,
            TransferPriority::Normal,
        );
        self.pace(transfer_id, size, cancel).await?;
        let (entry, body) = self
            .retry
            .with_retry("download_file", cancel, || self.cloud.download_file(path, None))
            .await?;
        if body.len() as u64 != entry.size {
            return Err(SyncError::ChecksumMismatch {
                path: path.to_string(),
                expected: format!("{} bytes", entry.size),
                actual: format!("{} bytes", body.len()),
            });
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let data = self.encryption.decrypt(body).await?;
        self.file_system.write_file(path, &data).await?;
        let hash = self.file_system.compute_hash(path).await?;
        Ok((entry, hash))
    }

    /// Restores or fails the item after an unsuccessful transfer
    async fn abort_transfer(
        &self,
        mut item: SyncItem,
        previous: ItemState,
        err: SyncError,
    ) -> SyncError {
        let path = item.path().clone();
        match &err {
            SyncError::Cancelled
            | SyncError::AuthenticationFailed(_)
            | SyncError::VersionMismatch { .. } => {
                if let Err(e) = item.rollback_to(previous) {
                    warn!(path = %path, error = %e, "Rollback failed");
                    return err;
                }
                if let Err(e) = self.save_and_publish(&item, ChangeType::StateChanged).await {
                    warn!(path = %path, error = %e, "Could not persist rollback");
                }
                match &err {
                    SyncError::Cancelled => info!(path = %path, "Transfer cancelled, item restored"),
                    SyncError::VersionMismatch { .. } => {
                        info!(path = %path, "Remote changed during upload, re-detecting next pass")
                    }
                    _ => {}
                }
            }
            _ => {
                if let Err(e) = self.record_item_error(item, &err).await {
                    warn!(path = %path, error = %e, "Could not record item failure");
                }
            }
        }
        err
    }

    async fn record_item_error(&self, mut item: SyncItem, err: &SyncError) -> Result<(), SyncError> {
        let path = item.path().clone();
        let retries = if err.is_retryable() {
            self.retry.max_attempts()
        } else {
            0
        };
        item.mark_error(ErrorInfo::new(err.code(), err.to_string(), retries))?;
        self.save_and_publish(&item, ChangeType::StateChanged).await?;
        error!(path = %path, code = err.code(), error = %err, "Sync failed for item");

        match err {
            SyncError::PermissionDenied(_) => {
                self.notify(Notification::access_required(&path)).await;
            }
            SyncError::DiskSpaceInsufficient { .. } => {
                self.notify(Notification::error("Not enough disk space", err.to_string()))
                    .await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn delete_local(&self, mut item: SyncItem) -> Result<ItemOutcome, SyncError> {
        let path = item.path().clone();
        item.transition_to(ItemState::PendingDelete)?;
        self.save_item(&item).await?;
        self.file_system.delete_item(&path).await?;
        self.forget_tree(&path).await?;
        self.events.publish_item(ItemChange::new(
            path.clone(),
            ChangeType::Deleted,
            ItemState::PendingDelete,
        ));
        info!(path = %path, "Deleted locally");
        Ok(ItemOutcome::DeletedLocal)
    }

    async fn delete_remote(
        &self,
        mut item: SyncItem,
        token: &CancellationToken,
    ) -> Result<ItemOutcome, SyncError> {
        let path = item.path().clone();
        item.transition_to(ItemState::PendingDelete)?;
        self.save_and_publish(&item, ChangeType::StateChanged).await?;

        let result = if item.is_directory() {
            self.retry
                .with_retry("delete_folder", token, || self.cloud.delete_folder(&path))
                .await
        } else {
            self.retry
                .with_retry("delete_file", token, || self.cloud.delete_file(&path))
                .await
        };
        if let Err(err) = result {
            if let Err(e) = self.record_item_error(item, &err).await {
                warn!(path = %path, error = %e, "Could not record item failure");
            }
            return Err(err);
        }

        self.forget_tree(&path).await?;
        self.selection.remove_entry(&path).await;
        self.events.publish_item(ItemChange::new(
            path.clone(),
            ChangeType::Deleted,
            ItemState::PendingDelete,
        ));
        info!(path = %path, "Deleted remotely");
        Ok(ItemOutcome::DeletedRemote)
    }

    // ========================================================================
    // Folder operations
    // ========================================================================

    /// Syncs a folder's direct children, and its subfolders when `recursive`
    pub fn sync_folder<'a>(
        &'a self,
        path: &'a SyncPath,
        recursive: bool,
    ) -> BoxFuture<'a, Result<SyncResult, SyncError>> {
        Box::pin(async move {
            let mut result = SyncResult::default();
            if !self.in_scope(path).await && !self.cache.has_entries_within(path).await {
                return Ok(result);
            }
            let token = self.run_token();
            self.admit(&token).await?;

            let plan = if path.is_root() {
                FolderPlan::Present
            } else {
                self.reconcile_folder(path, &token).await?
            };
            if plan == FolderPlan::Gone {
                return Ok(result);
            }

            let mut folders = BTreeSet::new();
            let mut files = BTreeSet::new();

            let remote_children = match self
                .retry
                .with_retry("list_folder", &token, || self.cloud.list_folder(path))
                .await
            {
                Ok(children) => children,
                Err(SyncError::FileNotFound(_)) => Vec::new(),
                Err(err) => return Err(err),
            };
            for entry in remote_children {
                self.selection
                    .add_entry(&entry.path, entry.is_directory, entry.size)
                    .await;
                if entry.is_directory {
                    folders.insert(entry.path);
                } else {
                    files.insert(entry.path);
                }
            }

            let local_children = match self.file_system.list_directory(path).await {
                Ok(children) => children,
                Err(SyncError::FileNotFound(_)) => Vec::new(),
                Err(err) => return Err(err),
            };
            for child in local_children {
                match self.file_system.get_file_attributes(&child).await? {
                    Some(attrs) if attrs.is_directory => {
                        folders.insert(child);
                    }
                    Some(_) => {
                        files.insert(child);
                    }
                    None => {}
                }
            }

            // Records gone from both listings still need their deletion settled
            let tracked = self
                .repository
                .query_items(&ItemFilter::new().with_path_prefix(path.clone()))
                .await
                .map_err(storage_error)?;
            for item in tracked
                .into_iter()
                .filter(|i| i.path().parent().as_ref() == Some(path))
            {
                if item.is_directory() {
                    folders.insert(item.path().clone());
                } else {
                    files.insert(item.path().clone());
                }
            }

            result.merge(self.sync_many(files.into_iter().collect()).await?);

            if recursive {
                for folder in &folders {
                    match self.sync_folder(folder, true).await {
                        Ok(sub) => result.merge(sub),
                        Err(err) if is_fatal(&err, &token) => return Err(err),
                        Err(err) => result.record_error(folder, &err),
                    }
                }
            }

            match plan {
                FolderPlan::RemoteGone => {
                    if self.prune_local_folder(path).await? {
                        result.deleted += 1;
                    }
                }
                FolderPlan::LocalGone => {
                    if self.prune_remote_folder(path, &token).await? {
                        result.deleted += 1;
                    }
                }
                FolderPlan::Present | FolderPlan::Gone => {}
            }
            Ok(result)
        })
    }

    async fn reconcile_folder(
        &self,
        path: &SyncPath,
        token: &CancellationToken,
    ) -> Result<FolderPlan, SyncError> {
        let _guard = self.locks.lock(path).await;
        let local = self.file_system.get_file_attributes(path).await?;
        let remote = self
            .retry
            .with_retry("get_metadata", token, || self.cloud.get_metadata(path))
            .await?;
        let item = self.load_item(path).await?;
        let had_baseline = item.as_ref().is_some_and(|i| i.last_synced_at().is_some());

        match (local.is_some(), remote) {
            (true, Some(entry)) => {
                self.settle_directory(item, &entry).await?;
                Ok(FolderPlan::Present)
            }
            (true, None) if had_baseline => Ok(FolderPlan::RemoteGone),
            (true, None) => {
                let entry = self
                    .retry
                    .with_retry("create_folder", token, || self.cloud.create_folder(path))
                    .await?;
                self.selection.add_entry(path, true, 0).await;
                self.settle_directory(item, &entry).await?;
                Ok(FolderPlan::Present)
            }
            (false, Some(_)) if had_baseline => Ok(FolderPlan::LocalGone),
            (false, Some(entry)) => {
                self.file_system.create_directory(path).await?;
                self.settle_directory(item, &entry).await?;
                Ok(FolderPlan::Present)
            }
            (false, None) => {
                if item.is_some() {
                    self.forget_tree(path).await?;
                }
                Ok(FolderPlan::Gone)
            }
        }
    }

    async fn prune_local_folder(&self, path: &SyncPath) -> Result<bool, SyncError> {
        let _guard = self.locks.lock(path).await;
        if !self.file_system.list_directory(path).await?.is_empty() {
            return Ok(false);
        }
        self.file_system.delete_item(path).await?;
        self.forget_tree(path).await?;
        self.events.publish_item(ItemChange::new(
            path.clone(),
            ChangeType::Deleted,
            ItemState::PendingDelete,
        ));
        Ok(true)
    }

    async fn prune_remote_folder(
        &self,
        path: &SyncPath,
        token: &CancellationToken,
    ) -> Result<bool, SyncError> {
        let _guard = self.locks.lock(path).await;
        let children = self
            .retry
            .with_retry("list_folder", token, || self.cloud.list_folder(path))
            .await?;
        if !children.is_empty() {
            return Ok(false);
        }
        self.retry
            .with_retry("delete_folder", token, || self.cloud.delete_folder(path))
            .await?;
        self.forget_tree(path).await?;
        self.selection.remove_entry(path).await;
        self.events.publish_item(ItemChange::new(
            path.clone(),
            ChangeType::Deleted,
            ItemState::PendingDelete,
        ));
        Ok(true)
    }

    /// Syncs `path` as a folder or a file, whichever it is
    async fn sync_path(&self, path: &SyncPath) -> Result<SyncResult, SyncError> {
        let token = self.run_token();
        let remote = self
            .retry
            .with_retry("get_metadata", &token, || self.cloud.get_metadata(path))
            .await?;
        let local = self.file_system.get_file_attributes(path).await?;
        let is_directory = path.is_root()
            || remote.as_ref().is_some_and(|e| e.is_directory)
            || local.as_ref().is_some_and(|a| a.is_directory);
        if is_directory {
            return self.sync_folder(path, true).await;
        }
        let mut result = SyncResult::default();
        result.record(&self.sync_file(path).await?);
        Ok(result)
    }

    // ========================================================================
    // User operations
    // ========================================================================

    /// Deletes an item on both sides
    #[tracing::instrument(skip(self))]
    pub async fn delete_item(&self, path: &SyncPath) -> Result<ItemOutcome, SyncError> {
        if !self.in_scope(path).await {
            return Ok(ItemOutcome::OutOfScope);
        }
        if !self.queue.is_network_available() {
            self.file_system.delete_item(path).await?;
            return self
                .queue_offline(OfflineModification::new(path.clone(), OfflineOperation::Delete))
                .await;
        }

        let token = self.run_token();
        self.admit(&token).await?;
        let result = self.delete_locked(path, &token).await;
        if let Err(err) = &result {
            self.observe_failure(err).await;
        }
        result
    }

    async fn delete_locked(
        &self,
        path: &SyncPath,
        token: &CancellationToken,
    ) -> Result<ItemOutcome, SyncError> {
        let _guard = self.locks.lock(path).await;
        if let Some(mut item) = self.load_item(path).await? {
            if item.can_transition_to(&ItemState::PendingDelete) {
                item.transition_to(ItemState::PendingDelete)?;
                self.save_and_publish(&item, ChangeType::StateChanged).await?;
            }
        }

        self.file_system.delete_item(path).await?;
        let remote = self
            .retry
            .with_retry("get_metadata", token, || self.cloud.get_metadata(path))
            .await?;
        match remote {
            Some(entry) if entry.is_directory => {
                self.retry
                    .with_retry("delete_folder", token, || self.cloud.delete_folder(path))
                    .await?
            }
            Some(_) => {
                self.retry
                    .with_retry("delete_file", token, || self.cloud.delete_file(path))
                    .await?
            }
            None => {}
        }

        self.forget_tree(path).await?;
        self.selection.remove_entry(path).await;
        self.events.publish_item(ItemChange::new(
            path.clone(),
            ChangeType::Deleted,
            ItemState::PendingDelete,
        ));
        info!(path = %path, "Deleted on both sides");
        Ok(ItemOutcome::DeletedRemote)
    }

    /// Moves an item on both sides
    ///
    /// Moving out of the selection removes the local copy; moving into it
    /// downloads the item.
    #[tracing::instrument(skip(self))]
    pub async fn move_item(&self, from: &SyncPath, to: &SyncPath) -> Result<ItemOutcome, SyncError> {
        if from == to {
            return Ok(ItemOutcome::InSync);
        }
        let from_in_scope = self.in_scope(from).await;
        let to_in_scope = self.in_scope(to).await;
        if !from_in_scope && !to_in_scope {
            return Ok(ItemOutcome::OutOfScope);
        }

        if !self.queue.is_network_available() {
            if self.file_system.get_file_attributes(from).await?.is_some() {
                self.file_system.move_item(from, to).await?;
            }
            return self.queue_offline(move_modification(from, to)).await;
        }

        let token = self.run_token();
        self.admit(&token).await?;
        let result = async {
            {
                let _guards = self.locks.lock_pair(from, to).await;
                if self.file_system.get_file_attributes(from).await?.is_some() {
                    if self.file_system.get_file_attributes(to).await?.is_some() {
                        return Err(SyncError::Io(format!("{to} already exists")));
                    }
                    self.file_system.move_item(from, to).await?;
                }
                self.move_remote_locked(from, to, to_in_scope, &token)
                    .await?;
            }
            if !from_in_scope && to_in_scope {
                self.sync_path(to).await?;
            }
            Ok(ItemOutcome::Moved { to: to.clone() })
        }
        .await;

        if let Err(err) = &result {
            self.observe_failure(err).await;
        }
        result
    }

    /// Renames an item within its folder
    pub async fn rename_item(
        &self,
        path: &SyncPath,
        new_name: &str,
    ) -> Result<ItemOutcome, SyncError> {
        let to = path.with_file_name(new_name)?;
        self.move_item(path, &to).await
    }

    /// Applies an already performed local move to the cloud and the records
    async fn move_remote_locked(
        &self,
        from: &SyncPath,
        to: &SyncPath,
        to_in_scope: bool,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let remote = self
            .retry
            .with_retry("get_metadata", token, || self.cloud.get_metadata(from))
            .await?;
        let entry = match remote {
            Some(_) => Some(
                self.retry
                    .with_retry("move_item", token, || self.cloud.move_item(from, to))
                    .await?,
            ),
            None => None,
        };

        self.selection.remove_entry(from).await;
        if let Some(entry) = &entry {
            self.selection
                .add_entry(to, entry.is_directory, entry.size)
                .await;
        }

        if to_in_scope {
            self.rename_records(from, to, entry.as_ref()).await?;
        } else {
            self.file_system.delete_item(to).await?;
            self.forget_tree(from).await?;
            info!(from = %from, to = %to, "Moved out of the selection, local copy removed");
        }
        info!(from = %from, to = %to, "Moved");
        Ok(())
    }

    // ========================================================================
    // Local events and the offline queue
    // ========================================================================

    /// Routes a change observed in the replica
    ///
    /// While offline the change is recorded in the offline queue instead.
    #[tracing::instrument(skip(self))]
    pub async fn handle_local_event(&self, event: LocalEvent) -> Result<ItemOutcome, SyncError> {
        if !self.in_scope(event.path()).await {
            return Ok(ItemOutcome::OutOfScope);
        }
        if !self.queue.is_network_available() {
            let modification = self.modification_for(&event).await;
            return self.queue_offline(modification).await;
        }

        let result = match &event {
            LocalEvent::Created(path) | LocalEvent::Modified(path) | LocalEvent::Deleted(path) => {
                self.sync_file(path).await
            }
            LocalEvent::Moved { from, to } => self.apply_local_move(from, to).await,
        };

        match result {
            Err(SyncError::NetworkUnavailable(_) | SyncError::ConnectionTimeout(_)) => {
                let modification = self.modification_for(&event).await;
                self.queue_offline(modification).await
            }
            other => other,
        }
    }

    async fn apply_local_move(
        &self,
        from: &SyncPath,
        to: &SyncPath,
    ) -> Result<ItemOutcome, SyncError> {
        let token = self.run_token();
        self.admit(&token).await?;
        let to_in_scope = self.in_scope(to).await;
        let result = async {
            let _guards = self.locks.lock_pair(from, to).await;
            self.move_remote_locked(from, to, to_in_scope, &token)
                .await
        }
        .await;
        match result {
            Ok(()) => {
                // Content may have changed along with the move
                self.sync_path(to).await?;
                Ok(ItemOutcome::Moved { to: to.clone() })
            }
            Err(err) => {
                self.observe_failure(&err).await;
                Err(err)
            }
        }
    }

    async fn modification_for(&self, event: &LocalEvent) -> OfflineModification {
        match event {
            LocalEvent::Created(path) | LocalEvent::Modified(path) => {
                let operation = match event {
                    LocalEvent::Created(_) => OfflineOperation::Create,
                    _ => OfflineOperation::Update,
                };
                let modification = OfflineModification::new(path.clone(), operation);
                match self.file_system.compute_hash(path).await {
                    Ok(hash) => modification.with_payload_ref(hash.to_string()),
                    Err(_) => modification,
                }
            }
            LocalEvent::Deleted(path) => {
                OfflineModification::new(path.clone(), OfflineOperation::Delete)
            }
            LocalEvent::Moved { from, to } => move_modification(from, to),
        }
    }

    async fn queue_offline(
        &self,
        modification: OfflineModification,
    ) -> Result<ItemOutcome, SyncError> {
        let recorded = self
            .queue
            .record_offline_modification(modification)
            .await?;
        debug!(
            path = %recorded.path(),
            operation = %recorded.operation(),
            "Queued offline"
        );
        Ok(ItemOutcome::Queued)
    }

    /// Replays the offline queue in order
    pub async fn replay_offline_queue(&self) -> ReplayReport {
        self.queue.replay(self).await
    }

    /// Records connectivity and replays the queue when it comes back
    pub async fn set_network_available(&self, available: bool) -> Option<ReplayReport> {
        if self.queue.set_network_available(available).await {
            info!("Network restored, replaying offline queue");
            return Some(self.replay_offline_queue().await);
        }
        None
    }

    /// Feeds network conditions to the bandwidth scheduler and the queue
    pub async fn update_network(
        &self,
        available: bool,
        network_type: NetworkType,
        quality: NetworkQuality,
    ) -> Option<ReplayReport> {
        self.bandwidth
            .set_network_conditions(available, network_type, quality);
        self.set_network_available(available).await
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Applies a user's resolution to a pending conflict
    #[tracing::instrument(skip(self))]
    pub async fn resolve_conflict(
        &self,
        path: &SyncPath,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome, SyncError> {
        let outcome = {
            let _guard = self.locks.lock(path).await;
            let item = self
                .load_item(path)
                .await?
                .ok_or_else(|| SyncError::FileNotFound(path.to_string()))?;
            self.resolve_locked(path, resolution, ResolutionSource::User, item)
                .await?
        };
        if let Some(copy) = &outcome.conflict_copy {
            self.upload_conflict_copy(copy).await;
        }
        Ok(outcome)
    }

    /// Applies one resolution to every pending conflict
    pub async fn resolve_all_conflicts(&self, resolution: Resolution) -> SyncResult {
        let mut result = SyncResult::default();
        for conflict in self.pending_conflicts().await {
            match self.resolve_conflict(conflict.path(), resolution).await {
                Ok(outcome) if outcome.resolved => {
                    result.record(&ItemOutcome::Resolved(resolution))
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %conflict.path(), error = %err, "Resolution failed");
                    result.record_error(conflict.path(), &err);
                }
            }
        }
        result
    }

    // ========================================================================
    // Selection and the offline cache
    // ========================================================================

    /// Refreshes the folder tree from the cloud
    pub async fn load_folder_tree(&self) -> Result<usize, SyncError> {
        self.selection.load_folder_tree(self.cloud.as_ref()).await
    }

    /// Persists the selection and brings the replica in line with it
    ///
    /// Newly selected folders are downloaded; newly deselected ones are
    /// removed locally, never remotely. Pinned offline entries survive.
    #[tracing::instrument(skip(self))]
    pub async fn apply_selection_changes(&self) -> Result<SyncResult, SyncError> {
        let token = self.run_token();
        let diff = self.selection.apply_selection_changes().await?;
        let mut result = SyncResult::default();

        for path in &diff.to_remove_locally {
            match self.remove_local_copy(path).await {
                Ok(removed) => result.deleted += removed,
                Err(err) => result.record_error(path, &err),
            }
        }
        for path in &diff.to_download {
            match self.sync_path(path).await {
                Ok(sub) => result.merge(sub),
                Err(err) if is_fatal(&err, &token) => return Err(err),
                Err(err) => result.record_error(path, &err),
            }
        }
        Ok(result)
    }

    /// Deletes local copies at and below `path` that nothing keeps in scope
    ///
    /// Returns the number of files removed.
    async fn remove_local_copy(&self, path: &SyncPath) -> Result<u32, SyncError> {
        let items = self
            .repository
            .query_items(&ItemFilter::new().with_path_prefix(path.clone()))
            .await
            .map_err(storage_error)?;
        let mut removed = 0;

        if !self.cache.has_entries_within(path).await {
            let _guard = self.locks.lock(path).await;
            self.file_system.delete_item(path).await?;
            self.forget_tree(path).await?;
            removed = items.iter().filter(|i| !i.is_directory()).count() as u32;
        } else {
            for item in items.iter().filter(|i| !i.is_directory()) {
                if self.in_scope(item.path()).await {
                    continue;
                }
                let _guard = self.locks.lock(item.path()).await;
                self.file_system.delete_item(item.path()).await?;
                self.forget_tree(item.path()).await?;
                removed += 1;
            }
        }

        self.events.publish_item(ItemChange::new(
            path.clone(),
            ChangeType::Deleted,
            ItemState::NotSynced,
        ));
        info!(path = %path, files = removed, "Removed local copy outside the selection");
        Ok(removed)
    }

    /// Pins `path` for offline use and makes sure it is downloaded
    #[tracing::instrument(skip(self))]
    pub async fn make_available_offline(&self, path: &SyncPath) -> Result<SyncResult, SyncError> {
        let token = self.run_token();
        let entry = self
            .retry
            .with_retry("get_metadata", &token, || self.cloud.get_metadata(path))
            .await?
            .ok_or_else(|| SyncError::FileNotFound(path.to_string()))?;
        let size = if entry.is_directory {
            self.selection
                .estimate_download_size(std::slice::from_ref(path))
                .await
        } else {
            entry.size
        };
        self.cache.make_available_offline(path, size).await?;
        self.sync_path(path).await
    }

    /// Unpins `path`; the local copy goes if the selection does not cover it
    pub async fn remove_from_offline(&self, path: &SyncPath) -> Result<bool, SyncError> {
        if !self.cache.remove_from_offline(path).await? {
            return Ok(false);
        }
        if !self.in_scope(path).await {
            self.remove_local_copy(path).await?;
        }
        Ok(true)
    }

    /// Evicts stale cache entries and drops their local copies
    pub async fn cleanup_offline_cache(&self) -> Result<Vec<SyncPath>, SyncError> {
        let evicted = self
            .cache
            .cleanup_cache(self.config.offline.cleanup_threshold)
            .await?;
        let mut paths = Vec::with_capacity(evicted.len());
        for entry in evicted {
            if !self.in_scope(&entry.path).await {
                self.remove_local_copy(&entry.path).await?;
            }
            paths.push(entry.path);
        }
        Ok(paths)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Discards the sync state and rebuilds it from a full enumeration
    ///
    /// Local files are kept; enumeration reconciles them against the cloud.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_state(&self) -> Result<SyncResult, SyncError> {
        warn!("Rebuilding sync state from the cloud");
        self.repository
            .clear_sync_state()
            .await
            .map_err(storage_error)?;
        self.resolver.clear().await;
        self.live_items().clear();
        self.publish_progress();
        self.fetch_remote_changes().await
    }
}

#[async_trait::async_trait]
impl ModificationReplayer for SyncEngine {
    async fn replay(&self, modification: &OfflineModification) -> Result<(), SyncError> {
        let outcome = match modification.operation() {
            OfflineOperation::Create | OfflineOperation::Update | OfflineOperation::Delete => {
                self.sync_file(modification.path()).await?
            }
            OfflineOperation::Move { from, to } | OfflineOperation::Rename { from, to } => {
                self.apply_local_move(from, to).await?
            }
        };
        debug!(
            path = %modification.path(),
            operation = %modification.operation(),
            ?outcome,
            "Replayed offline modification"
        );
        Ok(())
    }
}

impl From<&SyncItem> for LiveItem {
    fn from(item: &SyncItem) -> Self {
        Self {
            state: item.state().clone(),
            size: item.size(),
            is_directory: item.is_directory(),
        }
    }
}

fn terminal_status<T>(result: &Result<T, SyncError>) -> TransferStatus {
    match result {
        Ok(_) => TransferStatus::Completed,
        Err(SyncError::Cancelled) => TransferStatus::Cancelled,
        Err(_) => TransferStatus::Failed,
    }
}

fn move_modification(from: &SyncPath, to: &SyncPath) -> OfflineModification {
    let operation = if from.parent() == to.parent() {
        OfflineOperation::Rename {
            from: from.clone(),
            to: to.clone(),
        }
    } else {
        OfflineOperation::Move {
            from: from.clone(),
            to: to.clone(),
        }
    };
    OfflineModification::new(to.clone(), operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> SyncPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_rebase_moves_descendants() {
        let moved = rebase(&path("/a/b/c.txt"), &path("/a"), &path("/x/y")).unwrap();
        assert_eq!(moved, path("/x/y/b/c.txt"));
        assert_eq!(rebase(&path("/a"), &path("/a"), &path("/z")).unwrap(), path("/z"));
    }

    #[test]
    fn test_move_within_folder_is_rename() {
        let m = move_modification(&path("/d/a.txt"), &path("/d/b.txt"));
        assert!(matches!(m.operation(), OfflineOperation::Rename { .. }));
        let m = move_modification(&path("/d/a.txt"), &path("/e/a.txt"));
        assert!(matches!(m.operation(), OfflineOperation::Move { .. }));
        assert_eq!(m.path(), &path("/e/a.txt"));
    }

    #[test]
    fn test_result_counts_outcomes() {
        let mut result = SyncResult::default();
        result.record(&ItemOutcome::Uploaded);
        result.record(&ItemOutcome::Downloaded);
        result.record(&ItemOutcome::DeletedRemote);
        result.record(&ItemOutcome::Resolved(Resolution::KeepBoth));
        result.record(&ItemOutcome::InSync);
        assert_eq!(
            (result.uploaded, result.downloaded, result.deleted, result.conflicts),
            (1, 1, 1, 1)
        );
        assert!(!result.is_empty());
        assert!(SyncResult::default().is_empty());
    }

    #[test]
    fn test_terminal_status() {
        assert_eq!(terminal_status::<()>(&Ok(())), TransferStatus::Completed);
        assert_eq!(
            terminal_status::<()>(&Err(SyncError::Cancelled)),
            TransferStatus::Cancelled
        );
        assert_eq!(
            terminal_status::<()>(&Err(SyncError::Io("x".into()))),
            TransferStatus::Failed
        );
    }
}
