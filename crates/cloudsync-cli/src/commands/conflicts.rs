//! Conflicts command - List conflicts waiting for a resolution
//!
//! Conflicts are resolved by the running sync service; this command only
//! reads what the service persisted.

use anyhow::{Context as _, Result};
use clap::Subcommand;

use cloudsync_core::domain::{ConflictInfo, ItemSnapshot, SyncPath};
use cloudsync_core::ports::IStateRepository;

use super::{Context, NO_DATABASE};
use crate::output::{get_formatter, plural, OutputFormatter};

#[derive(Debug, Subcommand)]
pub enum ConflictsCommand {
    /// List pending conflicts
    List,
    /// Show both sides of one conflict
    Show {
        /// Path of the conflicted item
        path: String,
    },
}

impl ConflictsCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        let formatter = get_formatter(ctx.format);
        let Some(repo) = ctx.open_repository().await? else {
            formatter.error(NO_DATABASE);
            return Ok(());
        };
        let conflicts = repo
            .list_conflicts()
            .await
            .context("Failed to read conflicts")?;

        match self {
            ConflictsCommand::List => {
                if ctx.format.is_json() {
                    let json = serde_json::to_value(&conflicts)
                        .context("Failed to serialize conflicts")?;
                    formatter.print_json(&json);
                } else if conflicts.is_empty() {
                    formatter.success("No pending conflicts");
                } else {
                    formatter.warn(&format!("{} pending", plural(conflicts.len(), "conflict")));
                    for conflict in &conflicts {
                        formatter.info(&format!(
                            "{}  {}  (detected {})",
                            conflict.path(),
                            conflict.conflict_type(),
                            conflict.detected_at().format("%Y-%m-%d %H:%M")
                        ));
                    }
                }
            }
            ConflictsCommand::Show { path } => {
                let path: SyncPath = path
                    .parse()
                    .with_context(|| format!("Invalid path '{path}'"))?;
                let Some(conflict) = conflicts.iter().find(|c| c.path() == &path) else {
                    formatter.error(&format!("No pending conflict for {path}"));
                    return Ok(());
                };
                if ctx.format.is_json() {
                    let json = serde_json::to_value(conflict)
                        .context("Failed to serialize conflict")?;
                    formatter.print_json(&json);
                } else {
                    show_conflict(conflict, formatter.as_ref());
                }
            }
        }
        Ok(())
    }
}

fn show_conflict(conflict: &ConflictInfo, formatter: &dyn OutputFormatter) {
    formatter.warn(&format!("{} ({})", conflict.path(), conflict.conflict_type()));
    formatter.field("Detected", &conflict.detected_at().to_rfc3339());
    formatter.info("");
    formatter.info("Local:");
    formatter.info(&format!("  {}", describe_side(conflict.local_snapshot())));
    formatter.info("Remote:");
    formatter.info(&format!("  {}", describe_side(conflict.remote_snapshot())));
    formatter.info("");
    let options: Vec<String> = conflict
        .resolution_options()
        .iter()
        .map(|r| r.to_string())
        .collect();
    formatter.field("Options", &options.join(", "));
}

fn describe_side(snapshot: &ItemSnapshot) -> String {
    if snapshot.deleted {
        return format!("deleted (as of {})", snapshot.modified_at.format("%Y-%m-%d %H:%M"));
    }
    let mut line = format!(
        "{} bytes, modified {}",
        snapshot.size,
        snapshot.modified_at.format("%Y-%m-%d %H:%M")
    );
    if let Some(to) = &snapshot.renamed_to {
        line.push_str(&format!(", renamed to {to}"));
    }
    line
}
