//! Offline modification queue
//!
//! A durable, id-ordered log of mutations recorded while the cloud is
//! unreachable. Same-path entries are coalesced on insert:
//!
//! - an `update` after a queued `create`/`update` of the same path (with no
//!   later delete or move touching it) replaces that entry's payload in
//!   place, keeping its id and therefore its position in the queue
//! - a `delete` drops the path's earlier `create`/`update`/`delete`
//!   entries and appends a single `delete`
//!
//! Replay walks the queue strictly in id order and stops at the first
//! failure; everything not yet applied stays queued for the next reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cloudsync_core::domain::{OfflineModification, OfflineOperation, SyncError, SyncPath};
use cloudsync_core::ports::IStateRepository;

use crate::storage_error;

/// Applies one queued modification against the cloud
#[async_trait::async_trait]
pub trait ModificationReplayer: Send + Sync {
    async fn replay(&self, modification: &OfflineModification) -> Result<(), SyncError>;
}

/// Outcome of a replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub applied: usize,
    pub remaining: usize,
    /// Error that stopped the pass, if any
    pub error: Option<String>,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

pub struct OfflineQueue {
    repository: Arc<dyn IStateRepository>,
    /// In-memory mirror of the persisted queue, in id order
    entries: Mutex<Vec<OfflineModification>>,
    /// Held for the whole of a replay pass
    replaying: Mutex<()>,
    network_available: AtomicBool,
}

impl OfflineQueue {
    pub fn new(repository: Arc<dyn IStateRepository>) -> Self {
        Self {
            repository,
            entries: Mutex::new(Vec::new()),
            replaying: Mutex::new(()),
            network_available: AtomicBool::new(true),
        }
    }

    /// Reloads the persisted queue, e.g. after a restart
    pub async fn load(&self) -> Result<usize, SyncError> {
        let persisted = self
            .repository
            .list_modifications()
            .await
            .map_err(storage_error)?;
        let count = persisted.len();
        *self.entries.lock().await = persisted;
        if count > 0 {
            info!(count, "Restored offline queue");
        }
        Ok(count)
    }

    /// Records a modification, coalescing with earlier same-path entries
    ///
    /// Returns the queued entry, which for a coalesced update is the earlier
    /// entry carrying the new payload.
    pub async fn record_offline_modification(
        &self,
        modification: OfflineModification,
    ) -> Result<OfflineModification, SyncError> {
        let mut entries = self.entries.lock().await;
        let path = modification.path().clone();

        match modification.operation() {
            OfflineOperation::Update => {
                let target = latest_touching(&entries, &path).filter(|i| {
                    let e = &entries[*i];
                    e.path() == &path && e.operation().carries_content()
                });
                if let Some(i) = target {
                    if let Some(id) = entries[i].id() {
                        self.repository
                            .update_modification_payload(id, modification.payload_ref())
                            .await
                            .map_err(storage_error)?;
                        entries[i].set_payload_ref(modification.payload_ref().map(str::to_owned));
                        debug!(path = %path, id = %id, "Coalesced offline update");
                        return Ok(entries[i].clone());
                    }
                }
            }
            OfflineOperation::Delete => {
                let collapsed = collapsible_before_delete(&entries, &path);
                if !collapsed.is_empty() {
                    let ids: Vec<_> = collapsed.iter().filter_map(|i| entries[*i].id()).collect();
                    self.repository
                        .remove_modifications(&ids)
                        .await
                        .map_err(storage_error)?;
                    let mut index = 0;
                    entries.retain(|_| {
                        let keep = !collapsed.contains(&index);
                        index += 1;
                        keep
                    });
                    debug!(path = %path, collapsed = ids.len(), "Collapsed offline entries into delete");
                }
            }
            _ => {}
        }

        let id = self
            .repository
            .append_modification(&modification)
            .await
            .map_err(storage_error)?;
        let queued = modification.with_id(id);
        debug!(path = %path, id = %id, operation = %queued.operation(), "Queued offline modification");
        entries.push(queued.clone());
        Ok(queued)
    }

    /// Snapshot of the queue in replay order
    pub async fn pending_modifications(&self) -> Vec<OfflineModification> {
        self.entries.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub fn is_network_available(&self) -> bool {
        self.network_available.load(Ordering::SeqCst)
    }

    /// Updates connectivity; returns true when the network just came back
    /// and the queue has entries to replay
    pub async fn set_network_available(&self, available: bool) -> bool {
        let was = self.network_available.swap(available, Ordering::SeqCst);
        if was != available {
            info!(available, "Network availability changed");
        }
        available && !was && self.pending_count().await > 0
    }

    /// Replays the queue in id order through `replayer`
    ///
    /// Applied entries are removed one by one. The pass stops at the first
    /// failure and leaves that entry and everything after it queued.
    pub async fn replay(&self, replayer: &dyn ModificationReplayer) -> ReplayReport {
        let _pass = self.replaying.lock().await;
        let snapshot = self.pending_modifications().await;
        let mut report = ReplayReport::default();

        for modification in &snapshot {
            if let Err(err) = replayer.replay(modification).await {
                warn!(
                    path = %modification.path(),
                    operation = %modification.operation(),
                    error = %err,
                    "Offline replay stopped"
                );
                report.error = Some(err.to_string());
                break;
            }

            if let Some(id) = modification.id() {
                if let Err(err) = self.repository.remove_modifications(&[id]).await {
                    warn!(id = %id, error = %err, "Failed to dequeue replayed modification");
                    report.error = Some(err.to_string());
                    report.applied += 1;
                    break;
                }
                self.entries.lock().await.retain(|e| e.id() != Some(id));
            }
            report.applied += 1;
        }

        report.remaining = self.pending_count().await;
        info!(
            applied = report.applied,
            remaining = report.remaining,
            "Offline replay finished"
        );
        report
    }
}

/// Index of the newest entry touching `path`
fn latest_touching(entries: &[OfflineModification], path: &SyncPath) -> Option<usize> {
    entries.iter().rposition(|e| e.touches(path))
}

/// Indices of same-path create/update/delete entries after the last move
/// or rename touching `path`
fn collapsible_before_delete(entries: &[OfflineModification], path: &SyncPath) -> Vec<usize> {
    let mut out = Vec::new();
    for (i, e) in entries.iter().enumerate().rev() {
        if !e.touches(path) {
            continue;
        }
        match e.operation() {
            OfflineOperation::Move { .. } | OfflineOperation::Rename { .. } => break,
            _ => out.push(i),
        }
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use cloudsync_cache::{DatabasePool, SqliteStateRepository};

    use super::*;

    fn path(s: &str) -> SyncPath {
        s.parse().unwrap()
    }

    fn update(p: &str, payload: &str) -> OfflineModification {
        OfflineModification::new(path(p), OfflineOperation::Update).with_payload_ref(payload)
    }

    async fn repo() -> Arc<dyn IStateRepository> {
        let pool = DatabasePool::in_memory().await.unwrap();
        Arc::new(SqliteStateRepository::new(pool.pool().clone()))
    }

    /// Records replayed entries; fails on a chosen path
    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<(String, Option<String>)>>,
        fail_on: Option<String>,
    }

    #[async_trait::async_trait]
    impl ModificationReplayer for Recorder {
        async fn replay(&self, m: &OfflineModification) -> Result<(), SyncError> {
            if self.fail_on.as_deref() == Some(m.path().as_str()) {
                return Err(SyncError::NetworkUnavailable("still offline".into()));
            }
            self.seen.lock().unwrap().push((
                format!("{} {}", m.operation(), m.path()),
                m.payload_ref().map(str::to_owned),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_update_coalesces_in_place() {
        let queue = OfflineQueue::new(repo().await);
        let first = queue.record_offline_modification(update("/a", "h1")).await.unwrap();
        queue.record_offline_modification(update("/b", "h2")).await.unwrap();
        let merged = queue.record_offline_modification(update("/a", "h3")).await.unwrap();

        assert_eq!(merged.id(), first.id());
        let pending = queue.pending_modifications().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].path(), &path("/a"));
        assert_eq!(pending[0].payload_ref(), Some("h3"));
    }

    #[tokio::test]
    async fn test_replay_order_after_coalescing() {
        let queue = OfflineQueue::new(repo().await);
        queue.record_offline_modification(update("/A", "t1")).await.unwrap();
        queue.record_offline_modification(update("/B", "t2")).await.unwrap();
        queue.record_offline_modification(update("/A", "t3")).await.unwrap();

        let recorder = Recorder::default();
        let report = queue.replay(&recorder).await;

        assert_eq!(report.applied, 2);
        assert!(report.is_complete());
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("update /A".to_string(), Some("t3".to_string())),
                ("update /B".to_string(), Some("t2".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_collapses_prior_entries() {
        let queue = OfflineQueue::new(repo().await);
        queue
            .record_offline_modification(
                OfflineModification::new(path("/a"), OfflineOperation::Create).with_payload_ref("h1"),
            )
            .await
            .unwrap();
        queue.record_offline_modification(update("/b", "h2")).await.unwrap();
        queue.record_offline_modification(update("/a", "h3")).await.unwrap();
        queue
            .record_offline_modification(OfflineModification::new(path("/a"), OfflineOperation::Delete))
            .await
            .unwrap();

        let pending = queue.pending_modifications().await;
        let ops: Vec<_> = pending
            .iter()
            .map(|m| format!("{} {}", m.operation(), m.path()))
            .collect();
        assert_eq!(ops, vec!["update /b", "delete /a"]);
    }

    #[tokio::test]
    async fn test_update_after_delete_is_appended() {
        let queue = OfflineQueue::new(repo().await);
        queue.record_offline_modification(update("/a", "h1")).await.unwrap();
        queue
            .record_offline_modification(OfflineModification::new(path("/a"), OfflineOperation::Delete))
            .await
            .unwrap();
        queue.record_offline_modification(update("/a", "h2")).await.unwrap();

        let pending = queue.pending_modifications().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(*pending[0].operation(), OfflineOperation::Delete);
        assert_eq!(pending[1].payload_ref(), Some("h2"));
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_remaining_entries() {
        let repository = repo().await;
        let queue = OfflineQueue::new(repository.clone());
        for p in ["/1", "/2", "/3"] {
            queue.record_offline_modification(update(p, "h")).await.unwrap();
        }

        let recorder = Recorder {
            fail_on: Some("/2".into()),
            ..Default::default()
        };
        let report = queue.replay(&recorder).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.remaining, 2);
        assert!(report.error.is_some());

        // Survives a restart
        let reloaded = OfflineQueue::new(repository);
        assert_eq!(reloaded.load().await.unwrap(), 2);
        let report = reloaded.replay(&Recorder::default()).await;
        assert_eq!(report.applied, 2);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_network_transition_reports_replay_needed() {
        let queue = OfflineQueue::new(repo().await);
        assert!(queue.is_network_available());
        assert!(!queue.set_network_available(false).await);
        queue.record_offline_modification(update("/a", "h")).await.unwrap();
        assert!(queue.set_network_available(true).await);
        // Already online: nothing new to trigger
        assert!(!queue.set_network_available(true).await);
    }
}
