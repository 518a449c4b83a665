//! Offline cache registry entries
//!
//! Tracks files the user asked to keep available offline, with the access
//! information the cleanup pass uses to pick eviction candidates.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::SyncPath;

/// Retention priority of a cached file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    /// Never evicted
    Pinned,
    High,
    #[default]
    Normal,
    Low,
}

impl CachePriority {
    pub fn name(&self) -> &'static str {
        match self {
            CachePriority::Pinned => "pinned",
            CachePriority::High => "high",
            CachePriority::Normal => "normal",
            CachePriority::Low => "low",
        }
    }
}

impl fmt::Display for CachePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for CachePriority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pinned" => Ok(CachePriority::Pinned),
            "high" => Ok(CachePriority::High),
            "normal" => Ok(CachePriority::Normal),
            "low" => Ok(CachePriority::Low),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown cache priority: {other}"
            ))),
        }
    }
}

/// A file kept available offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineCacheEntry {
    pub path: SyncPath,
    pub size: u64,
    pub priority: CachePriority,
    pub cached_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl OfflineCacheEntry {
    pub fn new(path: SyncPath, size: u64, priority: CachePriority) -> Self {
        let now = Utc::now();
        Self {
            path,
            size,
            priority,
            cached_at: now,
            last_accessed_at: now,
        }
    }

    /// Not pinned and untouched for longer than `max_age`
    pub fn can_be_evicted(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.priority != CachePriority::Pinned && now - self.last_accessed_at > max_age
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
    }
}

/// Current cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub item_count: usize,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl CacheUsage {
    pub fn usage_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.max_bytes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_never_evicted() {
        let mut entry = OfflineCacheEntry::new("/a".parse().unwrap(), 10, CachePriority::Pinned);
        let old = Utc::now() - Duration::days(30);
        entry.touch(old);
        assert!(!entry.can_be_evicted(Utc::now(), Duration::days(7)));
    }

    #[test]
    fn test_stale_entry_evictable() {
        let mut entry = OfflineCacheEntry::new("/a".parse().unwrap(), 10, CachePriority::Normal);
        assert!(!entry.can_be_evicted(Utc::now(), Duration::days(7)));
        entry.touch(Utc::now() - Duration::days(8));
        assert!(entry.can_be_evicted(Utc::now(), Duration::days(7)));
    }

    #[test]
    fn test_usage_ratio() {
        let usage = CacheUsage {
            used_bytes: 80,
            max_bytes: 100,
            item_count: 2,
            last_cleanup: None,
        };
        assert_eq!(usage.usage_ratio(), 0.8);
        assert_eq!(CacheUsage::default().usage_ratio(), 0.0);
    }
}
