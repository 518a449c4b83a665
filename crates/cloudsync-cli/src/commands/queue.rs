//! Queue command - List changes recorded while offline
//!
//! Entries are shown in replay order.

use anyhow::{Context as _, Result};
use clap::Args;

use cloudsync_core::domain::{OfflineModification, OfflineOperation};
use cloudsync_core::ports::IStateRepository;

use super::{Context, NO_DATABASE};
use crate::output::{get_formatter, plural};

#[derive(Debug, Args)]
pub struct QueueCommand {
    /// Show at most this many entries
    #[arg(long)]
    pub limit: Option<usize>,
}

impl QueueCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        let formatter = get_formatter(ctx.format);
        let Some(repo) = ctx.open_repository().await? else {
            formatter.error(NO_DATABASE);
            return Ok(());
        };

        let pending = repo
            .list_modifications()
            .await
            .context("Failed to read offline queue")?;
        let shown = &pending[..self.limit.unwrap_or(pending.len()).min(pending.len())];

        if ctx.format.is_json() {
            let entries: Vec<_> = shown.iter().map(entry_json).collect();
            formatter.print_json(&serde_json::json!({
                "total": pending.len(),
                "entries": entries,
            }));
            return Ok(());
        }

        if pending.is_empty() {
            formatter.success("Offline queue is empty");
            return Ok(());
        }
        formatter.success(&format!(
            "{} waiting for replay",
            plural(pending.len(), "change")
        ));
        for modification in shown {
            formatter.info(&describe(modification));
        }
        if shown.len() < pending.len() {
            formatter.info(&format!("... and {} more", pending.len() - shown.len()));
        }
        Ok(())
    }
}

fn describe(modification: &OfflineModification) -> String {
    let queued = modification.queued_at().format("%Y-%m-%d %H:%M:%S");
    let operation = modification.operation();
    if operation.carries_content() || matches!(operation, OfflineOperation::Delete) {
        format!("{queued}  {:<7} {}", operation.name(), modification.path())
    } else {
        // Moves and renames name both ends
        format!("{queued}  {operation}")
    }
}

fn entry_json(modification: &OfflineModification) -> serde_json::Value {
    serde_json::json!({
        "id": modification.id().map(|id| id.to_string()),
        "path": modification.path().to_string(),
        "operation": modification.operation().name(),
        "payload_ref": modification.payload_ref(),
        "queued_at": modification.queued_at().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_shows_both_ends_of_a_move() {
        let from = "/a.txt".parse().unwrap();
        let to = "/b.txt".parse().unwrap();
        let modification = OfflineModification::new(
            "/b.txt".parse().unwrap(),
            OfflineOperation::Move { from, to },
        );
        let line = describe(&modification);
        assert!(line.contains("/a.txt -> /b.txt"), "{line}");
    }

    #[test]
    fn test_entry_json_carries_the_path() {
        let modification =
            OfflineModification::new("/c.txt".parse().unwrap(), OfflineOperation::Update);
        let json = entry_json(&modification);
        assert_eq!(json["path"], "/c.txt");
        assert!(json["id"].is_null());
    }
}
