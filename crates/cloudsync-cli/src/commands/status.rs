//! Status command - Display synchronization status
//!
//! Provides the `cloudsync status` CLI command which:
//! 1. Shows item counts by state, the change-feed cursor, the offline queue
//!    length and the number of pending conflicts
//! 2. Lists items in the error state with their last failure
//! 3. Shows a single item's record when a path is given

use std::collections::HashMap;

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use cloudsync_core::domain::{ItemState, SyncItem, SyncPath};
use cloudsync_core::ports::{IStateRepository, ItemFilter};

use super::{Context, NO_DATABASE};
use crate::output::{get_formatter, plural, OutputFormatter};

/// Item states in display order
const STATE_ORDER: [&str; 6] = [
    "synced",
    "not_synced",
    "syncing",
    "pending_delete",
    "conflicted",
    "error",
];

#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Show the record for one path (e.g. /Documents/report.docx)
    pub path: Option<String>,
}

/// Snapshot of the persisted sync state
#[derive(Debug)]
pub(crate) struct StatusSummary {
    pub counts: HashMap<String, u64>,
    pub cursor: Option<String>,
    pub queued: usize,
    pub conflicts: usize,
    pub errors: Vec<SyncItem>,
}

impl StatusSummary {
    pub async fn gather(repo: &dyn IStateRepository) -> Result<Self> {
        let counts = repo
            .count_items_by_state()
            .await
            .context("Failed to count items by state")?;
        let cursor = repo
            .get_cursor()
            .await
            .context("Failed to read cursor")?
            .map(|c| c.to_string());
        let queued = repo
            .list_modifications()
            .await
            .context("Failed to read offline queue")?
            .len();
        let conflicts = repo
            .list_conflicts()
            .await
            .context("Failed to read conflicts")?
            .len();
        let errors = repo
            .query_items(&ItemFilter::new().with_state(ItemState::Error(String::new())))
            .await
            .context("Failed to query failed items")?;
        Ok(Self {
            counts,
            cursor,
            queued,
            conflicts,
            errors,
        })
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    fn to_json(&self) -> serde_json::Value {
        let errors: Vec<_> = self
            .errors
            .iter()
            .map(|item| {
                serde_json::json!({
                    "path": item.path().to_string(),
                    "code": item.error_info().map(|e| e.code.clone()),
                    "message": item.error_info().map(|e| e.message.clone()),
                })
            })
            .collect();
        serde_json::json!({
            "total_items": self.total(),
            "items_by_state": self.counts,
            "cursor": self.cursor,
            "offline_queue": self.queued,
            "pending_conflicts": self.conflicts,
            "errors": errors,
        })
    }
}

impl StatusCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        let formatter = get_formatter(ctx.format);
        let Some(repo) = ctx.open_repository().await? else {
            formatter.error(NO_DATABASE);
            return Ok(());
        };

        match &self.path {
            Some(raw) => {
                let path: SyncPath = raw
                    .parse()
                    .with_context(|| format!("Invalid path '{raw}'"))?;
                show_item(repo.as_ref(), &path, ctx.format.is_json(), formatter.as_ref()).await
            }
            None => {
                let summary = StatusSummary::gather(repo.as_ref()).await?;
                info!(items = summary.total(), "Showing status");
                if ctx.format.is_json() {
                    formatter.print_json(&summary.to_json());
                } else {
                    print_summary(&summary, formatter.as_ref());
                }
                Ok(())
            }
        }
    }
}

fn print_summary(summary: &StatusSummary, formatter: &dyn OutputFormatter) {
    if summary.errors.is_empty() && summary.conflicts == 0 {
        formatter.success("Sync state is healthy");
    } else {
        formatter.warn("Some items need attention");
    }
    formatter.info("");
    formatter.field("Items", &summary.total().to_string());
    for state in STATE_ORDER {
        let count = summary.counts.get(state).copied().unwrap_or(0);
        if count > 0 {
            formatter.field(&format!("  {state}"), &count.to_string());
        }
    }
    formatter.field(
        "Change cursor",
        summary.cursor.as_deref().unwrap_or("none (full enumeration next)"),
    );
    formatter.field("Offline queue", &plural(summary.queued, "change"));
    formatter.field("Conflicts", &plural(summary.conflicts, "conflict"));

    if !summary.errors.is_empty() {
        formatter.info("");
        formatter.error(&format!("{} failed:", plural(summary.errors.len(), "item")));
        for item in &summary.errors {
            let reason = item
                .error_info()
                .map(|e| format!("{} ({})", e.message, e.code))
                .unwrap_or_default();
            formatter.info(&format!("  {}  {}", item.path(), reason));
        }
    }
}

async fn show_item(
    repo: &dyn IStateRepository,
    path: &SyncPath,
    json: bool,
    formatter: &dyn OutputFormatter,
) -> Result<()> {
    let Some(item) = repo.get_item(path).await.context("Failed to query item")? else {
        formatter.error(&format!("{path} is not tracked"));
        return Ok(());
    };

    if json {
        formatter.print_json(&serde_json::to_value(&item).context("Failed to serialize item")?);
        return Ok(());
    }

    formatter.success(&path.to_string());
    formatter.field("State", &item.state().to_string());
    formatter.field(
        "Kind",
        if item.is_directory() { "folder" } else { "file" },
    );
    formatter.field("Size", &format!("{} bytes", item.size()));
    formatter.field("Modified", &item.modified_at().to_rfc3339());
    if let Some(at) = item.last_synced_at() {
        formatter.field("Last synced", &at.to_rfc3339());
    }
    if let Some(hash) = item.content_hash() {
        formatter.field("Content hash", &hash.to_string());
    }
    if let Some(tag) = item.remote_version_tag() {
        formatter.field("Remote version", &tag.to_string());
    }
    if let Some(err) = item.error_info() {
        formatter.field("Last error", &format!("{} ({})", err.message, err.code));
        formatter.field("Attempts", &err.retry_count.to_string());
    }
    Ok(())
}
