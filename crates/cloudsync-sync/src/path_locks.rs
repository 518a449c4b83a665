//! Per-path serialization
//!
//! Local and remote intents for the same path must never run concurrently.
//! Each path gets its own async mutex; distinct paths do not contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use cloudsync_core::domain::SyncPath;

/// Guard held while an intent for a path is processed
pub type PathGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<SyncPath, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other intent holds `path`
    pub async fn lock(&self, path: &SyncPath) -> PathGuard {
        let mutex = self
            .locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Locks both ends of a move, in path order so two moves never deadlock
    pub async fn lock_pair(&self, a: &SyncPath, b: &SyncPath) -> (PathGuard, Option<PathGuard>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        (first, Some(second))
    }

    /// Returns true if an intent currently holds `path`
    pub fn is_locked(&self, path: &SyncPath) -> bool {
        self.locks
            .get(path)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drops entries nobody is holding or waiting on
    pub fn prune(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn path(s: &str) -> SyncPath {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_same_path_is_serialized() {
        let locks = Arc::new(PathLocks::new());
        let guard = locks.lock(&path("/a")).await;
        assert!(locks.is_locked(&path("/a")));

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&path("/a")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_distinct_paths_do_not_contend() {
        let locks = PathLocks::new();
        let _a = locks.lock(&path("/a")).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&path("/b")))
            .await
            .expect("distinct path should lock immediately");
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = PathLocks::new();
        let held = locks.lock(&path("/held")).await;
        drop(locks.lock(&path("/released")).await);
        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_pair_locks_both_ends() {
        let locks = PathLocks::new();
        let (_first, second) = locks.lock_pair(&path("/b"), &path("/a")).await;
        assert!(second.is_some());
        assert!(locks.is_locked(&path("/a")));
        assert!(locks.is_locked(&path("/b")));

        let (_only, none) = locks.lock_pair(&path("/c"), &path("/c")).await;
        assert!(none.is_none());
    }
}
