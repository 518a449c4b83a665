//! CLI subcommands

pub mod config;
pub mod conflicts;
pub mod queue;
pub mod selection;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::debug;

use cloudsync_cache::{DatabasePool, SqliteStateRepository};
use cloudsync_core::config::Config;

use crate::output::OutputFormat;

/// Everything a command needs from the global flags
#[derive(Debug)]
pub struct Context {
    pub config_path: PathBuf,
    pub config: Config,
    pub format: OutputFormat,
}

impl Context {
    /// Opens the state database named by the configuration
    ///
    /// Returns `None` if no database exists yet; inspection never creates one.
    pub async fn open_repository(&self) -> Result<Option<Arc<SqliteStateRepository>>> {
        let db_path = &self.config.sync.database_path;
        if !db_path.exists() {
            debug!(path = %db_path.display(), "No state database");
            return Ok(None);
        }
        let pool = DatabasePool::new(db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        Ok(Some(Arc::new(SqliteStateRepository::new(pool.pool().clone()))))
    }
}

pub(crate) const NO_DATABASE: &str = "No sync state found. Start the sync service first.";
