//! Aggregate sync progress
//!
//! Derived from the live SyncItem set on every transition, never persisted.

use serde::{Deserialize, Serialize};

/// Aggregate counters for the current sync cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub total_items: u64,
    pub completed_items: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
}

impl SyncProgress {
    pub fn new(total_items: u64, total_bytes: u64) -> Self {
        Self {
            total_items,
            total_bytes,
            ..Default::default()
        }
    }

    /// True once every item and byte has been accounted for
    pub fn is_completed(&self) -> bool {
        self.completed_items >= self.total_items && self.transferred_bytes >= self.total_bytes
    }

    /// Completion ratio in `[0.0, 1.0]`, by bytes when known, else by items
    pub fn fraction(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.transferred_bytes as f64 / self.total_bytes as f64).min(1.0)
        } else if self.total_items > 0 {
            (self.completed_items as f64 / self.total_items as f64).min(1.0)
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_progress_is_completed() {
        let p = SyncProgress::default();
        assert!(p.is_completed());
        assert_eq!(p.fraction(), 1.0);
    }

    #[test]
    fn test_partial_progress() {
        let mut p = SyncProgress::new(4, 100);
        p.completed_items = 2;
        p.transferred_bytes = 25;
        assert!(!p.is_completed());
        assert_eq!(p.fraction(), 0.25);
        p.completed_items = 4;
        p.transferred_bytes = 100;
        assert!(p.is_completed());
    }
}
