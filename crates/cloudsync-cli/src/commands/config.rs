//! Config command - View, validate and create the configuration file
//!
//! `cloudsync config show` prints the effective configuration (the file, or
//! defaults when there is none), `validate` loads the file strictly and
//! reports every problem, and `init` writes a default file.

use anyhow::{Context as _, Result};
use clap::Subcommand;
use tracing::info;

use cloudsync_core::config::Config;

use super::Context;
use crate::output::{get_formatter, plural};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl ConfigCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(ctx),
            ConfigCommand::Validate => execute_validate(ctx),
            ConfigCommand::Init { force } => execute_init(ctx, *force),
        }
    }
}

fn execute_show(ctx: &Context) -> Result<()> {
    let formatter = get_formatter(ctx.format);
    info!(config_path = %ctx.config_path.display(), "Showing configuration");

    if ctx.format.is_json() {
        let json = serde_json::to_value(&ctx.config)
            .context("Failed to serialize configuration to JSON")?;
        formatter.print_json(&json);
        return Ok(());
    }

    if ctx.config_path.exists() {
        formatter.success(&format!("Configuration ({})", ctx.config_path.display()));
    } else {
        formatter.success("Configuration (defaults, no file found)");
    }
    formatter.info("");
    let yaml =
        serde_yaml::to_string(&ctx.config).context("Failed to serialize configuration to YAML")?;
    for line in yaml.lines() {
        formatter.info(line);
    }
    Ok(())
}

fn execute_validate(ctx: &Context) -> Result<()> {
    let formatter = get_formatter(ctx.format);
    let path = &ctx.config_path;

    let config = match Config::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            let message = if path.exists() {
                format!("Failed to parse configuration: {e:#}")
            } else {
                "Configuration file not found".to_string()
            };
            if ctx.format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "valid": false,
                    "config_path": path.display().to_string(),
                    "errors": [message],
                }));
            } else {
                formatter.error(&message);
                formatter.info(&format!("File: {}", path.display()));
                if !path.exists() {
                    formatter.info("Run 'cloudsync config init' to create one.");
                }
            }
            return Ok(());
        }
    };

    info!(config_path = %path.display(), "Validating configuration");
    let errors = config.validate();

    if ctx.format.is_json() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        formatter.print_json(&serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": path.display().to_string(),
            "errors": messages,
        }));
    } else if errors.is_empty() {
        formatter.success("Configuration is valid");
        formatter.info(&format!("File: {}", path.display()));
    } else {
        formatter.error(&format!("Configuration has {}:", plural(errors.len(), "error")));
        formatter.info(&format!("File: {}", path.display()));
        formatter.info("");
        for error in &errors {
            formatter.info(&format!("  {} - {}", error.field, error.message));
        }
    }
    Ok(())
}

fn execute_init(ctx: &Context, force: bool) -> Result<()> {
    let formatter = get_formatter(ctx.format);
    let path = &ctx.config_path;

    if path.exists() && !force {
        formatter.error(&format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
        return Ok(());
    }

    Config::default().save(path)?;
    info!(config_path = %path.display(), "Wrote default configuration");

    if ctx.format.is_json() {
        formatter.print_json(&serde_json::json!({
            "success": true,
            "config_path": path.display().to_string(),
        }));
    } else {
        formatter.success(&format!("Wrote {}", path.display()));
    }
    Ok(())
}
