//! Policy engine for automatic conflict resolution
//!
//! Evaluates conflict rules from configuration to determine automatic resolution
//! strategies. Rules are matched using glob patterns in first-match-wins order.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use cloudsync_core::{config::ConflictsConfig, domain::Resolution};

use crate::error::ConflictError;

/// A single conflict resolution rule from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRule {
    /// Glob pattern matched against the scope path without its leading slash
    /// (e.g., "**/*.docx", "Documents/**")
    pub pattern: String,
    /// Strategy to apply when the pattern matches
    pub strategy: String,
}

impl ConflictRule {
    /// Validates the rule's glob pattern and strategy
    pub fn validate(&self) -> Result<(), ConflictError> {
        Pattern::new(&self.pattern).map_err(|e| ConflictError::InvalidPattern {
            pattern: self.pattern.clone(),
            reason: e.to_string(),
        })?;

        parse_strategy(&self.strategy).ok_or_else(|| ConflictError::InvalidPattern {
            pattern: self.pattern.clone(),
            reason: format!(
                "invalid strategy '{}'; valid: ask_user, keep_local, keep_remote, keep_both",
                self.strategy
            ),
        })?;

        Ok(())
    }
}

/// Engine that evaluates conflict resolution rules
///
/// `None` as an outcome means "ask the user".
pub struct PolicyEngine {
    rules: Vec<(Pattern, Option<Resolution>)>,
    default_strategy: Option<Resolution>,
}

impl PolicyEngine {
    /// Creates a PolicyEngine from the default strategy string and a list of rules
    ///
    /// Invalid rules are logged and skipped.
    pub fn new(default_strategy: &str, rules: &[ConflictRule]) -> Self {
        let default = parse_strategy(default_strategy).unwrap_or(None);

        let compiled_rules: Vec<(Pattern, Option<Resolution>)> = rules
            .iter()
            .filter_map(|rule| {
                let pattern = match Pattern::new(&rule.pattern) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(
                            pattern = %rule.pattern,
                            error = %e,
                            "Skipping invalid conflict rule pattern"
                        );
                        return None;
                    }
                };
                let Some(resolution) = parse_strategy(&rule.strategy) else {
                    tracing::warn!(
                        strategy = %rule.strategy,
                        "Skipping invalid conflict rule strategy"
                    );
                    return None;
                };
                Some((pattern, resolution))
            })
            .collect();

        debug!(
            rules_count = compiled_rules.len(),
            default = ?default,
            "PolicyEngine initialized"
        );

        Self {
            rules: compiled_rules,
            default_strategy: default,
        }
    }

    /// Builds the engine from the `conflicts` configuration section
    pub fn from_config(config: &ConflictsConfig) -> Self {
        let rules: Vec<ConflictRule> = config
            .rules
            .iter()
            .map(|r| ConflictRule {
                pattern: r.pattern.clone(),
                strategy: r.strategy.clone(),
            })
            .collect();
        Self::new(&config.default_strategy, &rules)
    }

    /// Evaluates the policy for a scope path such as "/Documents/a.docx"
    ///
    /// Uses first-match-wins: the first rule whose glob matches the path
    /// determines the resolution. If no rule matches, returns the default.
    pub fn evaluate(&self, path: &str) -> Option<Resolution> {
        let relative = path.trim_start_matches('/');
        for (pattern, resolution) in &self.rules {
            if pattern.matches(relative) {
                trace!(
                    path = %relative,
                    pattern = %pattern,
                    resolution = ?resolution,
                    "Conflict rule matched"
                );
                return *resolution;
            }
        }

        trace!(
            path = %relative,
            default = ?self.default_strategy,
            "No conflict rule matched, using default"
        );
        self.default_strategy
    }

    /// Returns the default resolution strategy (`None` = ask the user)
    pub fn default_strategy(&self) -> Option<Resolution> {
        self.default_strategy
    }

    /// Returns the number of compiled rules
    pub fn rules_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new("ask_user", &[])
    }
}

/// Parses a strategy string: `Some(None)` is "ask_user", `None` is invalid
fn parse_strategy(s: &str) -> Option<Option<Resolution>> {
    match s {
        "ask_user" => Some(None),
        "keep_local" => Some(Some(Resolution::KeepLocal)),
        "keep_remote" => Some(Some(Resolution::KeepRemote)),
        "keep_both" => Some(Some(Resolution::KeepBoth)),
        _ => None,
    }
}
