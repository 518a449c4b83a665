//! "Available offline" registry
//!
//! Tracks files kept local regardless of folder selection. Entries persist
//! through the state repository; cleanup evicts stale, non-pinned entries
//! least recently used first until usage drops to the requested threshold.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use cloudsync_core::config::OfflineConfig;
use cloudsync_core::domain::{
    CachePriority, CacheUpdate, CacheUpdateKind, CacheUsage, OfflineCacheEntry, SyncError,
    SyncPath,
};
use cloudsync_core::ports::IStateRepository;

use crate::events::EventHub;
use crate::storage_error;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<SyncPath, OfflineCacheEntry>,
    last_cleanup: Option<DateTime<Utc>>,
}

impl CacheState {
    fn used_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

pub struct OfflineCache {
    repository: Arc<dyn IStateRepository>,
    events: Arc<EventHub>,
    max_bytes: u64,
    auto_cleanup: bool,
    cleanup_threshold: f64,
    max_age: Duration,
    state: Mutex<CacheState>,
    clock: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl fmt::Debug for OfflineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineCache")
            .field("max_bytes", &self.max_bytes)
            .field("auto_cleanup", &self.auto_cleanup)
            .field("cleanup_threshold", &self.cleanup_threshold)
            .finish_non_exhaustive()
    }
}

impl OfflineCache {
    pub fn new(
        config: &OfflineConfig,
        repository: Arc<dyn IStateRepository>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            repository,
            events,
            max_bytes: config.max_cache_size_mb.saturating_mul(BYTES_PER_MB),
            auto_cleanup: config.auto_cleanup,
            cleanup_threshold: config.cleanup_threshold,
            max_age: Duration::days(i64::from(config.eviction_age_days)),
            state: Mutex::new(CacheState::default()),
            clock: Box::new(Utc::now),
        }
    }

    /// Replaces the wall clock used for access times and eviction age
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Loads persisted entries
    pub async fn load(&self) -> Result<usize, SyncError> {
        let entries = self
            .repository
            .list_cache_entries()
            .await
            .map_err(storage_error)?;
        let mut state = self.state.lock().await;
        state.entries = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        Ok(state.entries.len())
    }

    /// Marks a file as available offline with normal priority
    pub async fn make_available_offline(&self, path: &SyncPath, size: u64) -> Result<(), SyncError> {
        self.make_available_offline_with_priority(path, size, CachePriority::Normal)
            .await
    }

    /// Marks a file as available offline
    ///
    /// Re-registering an existing path updates its size and priority and
    /// counts as an access. With auto cleanup enabled, crossing the cleanup
    /// threshold triggers a cleanup pass.
    ///
    /// # Errors
    /// Returns `QuotaExceeded` if the file cannot fit even after cleanup.
    pub async fn make_available_offline_with_priority(
        &self,
        path: &SyncPath,
        size: u64,
        priority: CachePriority,
    ) -> Result<(), SyncError> {
        let now = (self.clock)();
        let mut state = self.state.lock().await;

        let existing = state.entries.get(path).map(|e| e.size).unwrap_or(0);
        let projected = state.used_bytes() - existing + size;
        if projected > self.max_bytes {
            let target = self.max_bytes.saturating_sub(size - existing.min(size));
            self.evict_until(&mut state, target, now).await?;
            let projected = state.used_bytes() - state.entries.get(path).map_or(0, |e| e.size) + size;
            if projected > self.max_bytes {
                return Err(SyncError::QuotaExceeded(format!(
                    "offline cache full: {path} needs {size} bytes, limit {}",
                    self.max_bytes
                )));
            }
        }

        let (entry, kind) = match state.entries.get(path) {
            Some(current) => {
                let mut entry = current.clone();
                entry.size = size;
                entry.priority = priority;
                entry.touch(now);
                (entry, CacheUpdateKind::Updated)
            }
            None => {
                let mut entry = OfflineCacheEntry::new(path.clone(), size, priority);
                entry.cached_at = now;
                entry.last_accessed_at = now;
                (entry, CacheUpdateKind::Cached)
            }
        };

        self.repository
            .save_cache_entry(&entry)
            .await
            .map_err(storage_error)?;
        state.entries.insert(path.clone(), entry);
        debug!(path = %path, size, priority = %priority, "Available offline");
        self.events.publish_cache(CacheUpdate {
            path: path.clone(),
            kind,
            size,
        });

        if self.auto_cleanup && self.ratio(&state) > self.cleanup_threshold {
            let target = self.threshold_bytes(self.cleanup_threshold);
            self.evict_until(&mut state, target, now).await?;
        }
        Ok(())
    }

    /// Unregisters a file; returns false if it was not registered
    pub async fn remove_from_offline(&self, path: &SyncPath) -> Result<bool, SyncError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.remove(path) else {
            return Ok(false);
        };
        self.repository
            .remove_cache_entry(path)
            .await
            .map_err(storage_error)?;
        self.events.publish_cache(CacheUpdate {
            path: path.clone(),
            kind: CacheUpdateKind::Removed,
            size: entry.size,
        });
        Ok(true)
    }

    pub async fn is_available_offline(&self, path: &SyncPath) -> bool {
        self.state.lock().await.entries.contains_key(path)
    }

    /// True if `path` is registered itself or lies inside a registered folder
    pub async fn covers(&self, path: &SyncPath) -> bool {
        self.state
            .lock()
            .await
            .entries
            .keys()
            .any(|p| path.is_within(p))
    }

    /// True if some registered entry lies at or below `dir`
    pub async fn has_entries_within(&self, dir: &SyncPath) -> bool {
        self.state
            .lock()
            .await
            .entries
            .keys()
            .any(|p| p.is_within(dir))
    }

    /// Records an access, pushing the entry back in the eviction order
    pub async fn touch(&self, path: &SyncPath) -> Result<(), SyncError> {
        let now = (self.clock)();
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(path) else {
            return Ok(());
        };
        entry.touch(now);
        let entry = entry.clone();
        self.repository
            .save_cache_entry(&entry)
            .await
            .map_err(storage_error)
    }

    pub async fn entry(&self, path: &SyncPath) -> Option<OfflineCacheEntry> {
        self.state.lock().await.entries.get(path).cloned()
    }

    pub async fn entries(&self) -> Vec<OfflineCacheEntry> {
        let mut entries: Vec<_> = self.state.lock().await.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    pub async fn pinned_paths(&self) -> Vec<SyncPath> {
        let mut paths: Vec<_> = self
            .state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.priority == CachePriority::Pinned)
            .map(|e| e.path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub async fn cache_usage(&self) -> CacheUsage {
        let state = self.state.lock().await;
        CacheUsage {
            used_bytes: state.used_bytes(),
            max_bytes: self.max_bytes,
            item_count: state.entries.len(),
            last_cleanup: state.last_cleanup,
        }
    }

    /// Evicts stale entries until usage is at or below `threshold` (0.0-1.0)
    ///
    /// Returns the evicted entries; the caller decides what happens to their
    /// local copies.
    pub async fn cleanup_cache(&self, threshold: f64) -> Result<Vec<OfflineCacheEntry>, SyncError> {
        let now = (self.clock)();
        let mut state = self.state.lock().await;
        let target = self.threshold_bytes(threshold);
        self.evict_until(&mut state, target, now).await
    }

    fn ratio(&self, state: &CacheState) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        state.used_bytes() as f64 / self.max_bytes as f64
    }

    fn threshold_bytes(&self, threshold: f64) -> u64 {
        (self.max_bytes as f64 * threshold.clamp(0.0, 1.0)) as u64
    }

    async fn evict_until(
        &self,
        state: &mut CacheState,
        target_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfflineCacheEntry>, SyncError> {
        let mut candidates: Vec<OfflineCacheEntry> = state
            .entries
            .values()
            .filter(|e| e.can_be_evicted(now, self.max_age))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| b.priority.cmp(&a.priority))
        });

        let mut used = state.used_bytes();
        let mut evicted = Vec::new();
        for candidate in candidates {
            if used <= target_bytes {
                break;
            }
            self.repository
                .remove_cache_entry(&candidate.path)
                .await
                .map_err(storage_error)?;
            state.entries.remove(&candidate.path);
            used = used.saturating_sub(candidate.size);
            self.events.publish_cache(CacheUpdate {
                path: candidate.path.clone(),
                kind: CacheUpdateKind::Removed,
                size: candidate.size,
            });
            evicted.push(candidate);
        }

        state.last_cleanup = Some(now);
        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                used_bytes = used,
                target_bytes,
                "Offline cache cleanup"
            );
        }
        Ok(evicted)
    }
}
