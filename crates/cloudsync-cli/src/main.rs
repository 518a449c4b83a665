//! cloudsync CLI - Inspect and validate local sync state
//!
//! Provides commands for:
//! - Viewing and validating configuration
//! - Viewing sync status
//! - Listing the offline queue
//! - Listing pending conflicts
//! - Showing the selective-sync scope and offline pins

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use cloudsync_core::config::Config;
use commands::{
    config::ConfigCommand, conflicts::ConflictsCommand, queue::QueueCommand,
    selection::SelectionCommand, status::StatusCommand, Context,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "cloudsync", version, about = "Cloud drive sync core")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// View, validate and create configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Show synchronization status
    Status(StatusCommand),
    /// List changes waiting in the offline queue
    Queue(QueueCommand),
    /// List conflicts waiting for a resolution
    #[command(subcommand)]
    Conflicts(ConflictsCommand),
    /// Show selected folders and offline pins
    Selection(SelectionCommand),
}

fn init_tracing(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path);
    init_tracing(&config, cli.verbose);

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let ctx = Context {
        config_path,
        config,
        format,
    };

    match cli.command {
        Commands::Config(cmd) => cmd.execute(&ctx).await,
        Commands::Status(cmd) => cmd.execute(&ctx).await,
        Commands::Queue(cmd) => cmd.execute(&ctx).await,
        Commands::Conflicts(cmd) => cmd.execute(&ctx).await,
        Commands::Selection(cmd) => cmd.execute(&ctx).await,
    }
}
