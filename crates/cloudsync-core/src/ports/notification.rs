//! Notification service port (driven/secondary port)
//!
//! This module defines the interface for surfacing sync events to the user.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because notification delivery is adapter-specific.
//! - Notifications are fire-and-forget; the engine never waits on delivery
//!   inside the sync pipeline.

use serde::{Deserialize, Serialize};

// ============================================================================
// Notification struct and NotificationPriority enum
// ============================================================================

/// Priority level for a notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    /// Persists until acknowledged
    Critical,
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Normal => "normal",
            NotificationPriority::High => "high",
            NotificationPriority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A notification to display to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    /// Category for grouping/filtering (e.g., "sync", "conflict", "auth")
    pub category: String,
}

impl Notification {
    /// Creates a new notification with `Normal` priority and no category
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority: NotificationPriority::Normal,
            category: String::new(),
        }
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Creates an error notification with High priority
    pub fn error(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(title, body)
            .with_priority(NotificationPriority::High)
            .with_category("error")
    }

    /// Creates a conflict notification with High priority
    pub fn conflict(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(title, body)
            .with_priority(NotificationPriority::High)
            .with_category("conflict")
    }

    /// Asks the user to sign in again
    pub fn reauthentication_required(reason: impl Into<String>) -> Self {
        Self::new("Sign-in required", reason)
            .with_priority(NotificationPriority::Critical)
            .with_category("auth")
    }

    /// Asks the user to grant access to a path
    pub fn access_required(path: impl std::fmt::Display) -> Self {
        Self::new("Access required", format!("Cannot access {path}"))
            .with_priority(NotificationPriority::High)
            .with_category("permission")
    }
}

// ============================================================================
// INotificationService trait
// ============================================================================

/// Port trait for user notifications
///
/// Implementations should swallow delivery problems (e.g. no notification
/// daemon) and report them through the returned error only.
#[async_trait::async_trait]
pub trait INotificationService: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reauth_is_critical() {
        let n = Notification::reauthentication_required("token expired");
        assert_eq!(n.priority, NotificationPriority::Critical);
        assert_eq!(n.category, "auth");
    }

    #[test]
    fn test_access_required_mentions_path() {
        let n = Notification::access_required("/secret");
        assert!(n.body.contains("/secret"));
        assert_eq!(n.priority.to_string(), "high");
    }
}
