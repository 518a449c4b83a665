//! Selection command - Show the selective-sync scope
//!
//! Lists the persisted selected folders, the exclude patterns from the
//! configuration and the files pinned for offline use.

use anyhow::{Context as _, Result};
use clap::Args;

use cloudsync_core::domain::{OfflineCacheEntry, SyncPath};
use cloudsync_core::ports::IStateRepository;

use super::{Context, NO_DATABASE};
use crate::output::{get_formatter, plural};

#[derive(Debug, Args)]
pub struct SelectionCommand {
    /// Also list offline cache entries
    #[arg(long)]
    pub offline: bool,
}

impl SelectionCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        let formatter = get_formatter(ctx.format);
        let Some(repo) = ctx.open_repository().await? else {
            formatter.error(NO_DATABASE);
            return Ok(());
        };

        let selected = effective_selection(
            repo.load_selection()
                .await
                .context("Failed to read selection")?,
            &ctx.config.sync.selected_folders,
        );
        let entries = if self.offline {
            repo.list_cache_entries()
                .await
                .context("Failed to read offline cache")?
        } else {
            Vec::new()
        };
        let exclude = &ctx.config.sync.exclude_patterns;

        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "selected": selected.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                "exclude_patterns": exclude,
                "offline": serde_json::to_value(&entries)
                    .context("Failed to serialize offline cache")?,
            }));
            return Ok(());
        }

        if selected.is_empty() {
            formatter.warn("Nothing is selected for sync");
        } else {
            formatter.success(&format!("{} selected", plural(selected.len(), "folder")));
            for path in &selected {
                formatter.info(&path.to_string());
            }
        }
        if !exclude.is_empty() {
            formatter.info("");
            formatter.field("Excluded", &exclude.join(", "));
        }
        if self.offline {
            formatter.info("");
            print_offline(&entries, formatter.as_ref());
        }
        Ok(())
    }
}

/// Persisted selection, else the configured folders, else the whole drive
fn effective_selection(persisted: Option<Vec<SyncPath>>, configured: &[String]) -> Vec<SyncPath> {
    if let Some(paths) = persisted {
        return paths;
    }
    let from_config: Vec<SyncPath> = configured
        .iter()
        .filter_map(|f| {
            let normalized = if f.starts_with('/') {
                f.clone()
            } else {
                format!("/{f}")
            };
            normalized.parse().ok()
        })
        .collect();
    if from_config.is_empty() {
        vec![SyncPath::root()]
    } else {
        from_config
    }
}

fn print_offline(entries: &[OfflineCacheEntry], formatter: &dyn crate::output::OutputFormatter) {
    if entries.is_empty() {
        formatter.info("No files kept offline");
        return;
    }
    let total: u64 = entries.iter().map(|e| e.size).sum();
    formatter.success(&format!(
        "{} kept offline ({} bytes)",
        plural(entries.len(), "item"),
        total
    ));
    for entry in entries {
        formatter.info(&format!(
            "{:<7} {}  (last used {})",
            entry.priority.name(),
            entry.path,
            entry.last_accessed_at.format("%Y-%m-%d")
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> SyncPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_persisted_selection_wins() {
        let selected = effective_selection(Some(vec![path("/Photos")]), &["Docs".to_string()]);
        assert_eq!(selected, vec![path("/Photos")]);
    }

    #[test]
    fn test_configured_folders_are_normalized() {
        let selected = effective_selection(None, &["Docs".to_string(), "/Music".to_string()]);
        assert_eq!(selected, vec![path("/Docs"), path("/Music")]);
    }

    #[test]
    fn test_nothing_configured_means_everything() {
        assert_eq!(effective_selection(None, &[]), vec![SyncPath::root()]);
    }
}
