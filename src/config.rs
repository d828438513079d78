use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::forwarder::dispatch::RetryPolicy;
use crate::forwarder::rules::{ForwardRule, RuleSet};
use crate::forwarder::ForwarderSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    /// Ordered forwarding rules; first match wins
    #[serde(default)]
    pub rules: Vec<ForwardRule>,
    /// Legacy single-rule `[forward]` table, folded into `rules` on load
    #[serde(default)]
    pub forward: Option<LegacyForwardConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Users allowed to run /rules and /reload in a private chat
    #[serde(default)]
    pub admin_user_ids: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwarderConfig {
    #[serde(default = "default_true")]
    pub show_sender_info: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_payloads")]
    pub max_payloads: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            show_sender_info: default_true(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            dedup_window_secs: default_dedup_window_secs(),
            retention_secs: default_retention_secs(),
            workers: default_workers(),
            max_payloads: default_max_payloads(),
        }
    }
}

/// The flat single-rule layout:
///
/// ```toml
/// [forward]
/// source_group = "-100123"
/// target_group = "-100456"
/// monitor_users = []
/// show_sender_info = true
/// max_retries = 3
/// retry_delay = 1
/// ```
#[derive(Debug, Deserialize, Clone)]
pub struct LegacyForwardConfig {
    #[serde(default)]
    pub source_group: String,
    #[serde(default)]
    pub target_group: String,
    #[serde(default)]
    pub monitor_users: Vec<String>,
    pub show_sender_info: Option<bool>,
    pub max_retries: Option<u32>,
    /// Seconds
    pub retry_delay: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> f64 {
    1.0
}

fn default_dedup_window_secs() -> u64 {
    60
}

fn default_retention_secs() -> u64 {
    600
}

fn default_workers() -> usize {
    4
}

fn default_max_payloads() -> usize {
    1024
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.migrate_legacy();
        config.validate()?;
        Ok(config)
    }

    /// Fold a `[forward]` table into one rule plus global settings.
    /// Ignored when `[[rules]]` are present.
    fn migrate_legacy(&mut self) {
        let Some(legacy) = self.forward.take() else {
            return;
        };
        if !self.rules.is_empty() {
            warn!("Both [[rules]] and [forward] are set; ignoring [forward]");
            return;
        }

        info!("Migrating legacy [forward] config to a single rule");
        if legacy.source_group.is_empty() || legacy.target_group.is_empty() {
            warn!("[forward] has no source_group or target_group; nothing will be forwarded");
        }

        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        self.rules.push(ForwardRule {
            name: "forward".to_string(),
            source_groups: non_empty(legacy.source_group).into_iter().collect(),
            target_groups: non_empty(legacy.target_group).into_iter().collect(),
            keywords: Vec::new(),
            exclude_users: Default::default(),
            monitor_users: legacy.monitor_users.into_iter().collect(),
            forward_original: true,
            add_prefix: String::new(),
            show_sender: None,
        });

        if let Some(show) = legacy.show_sender_info {
            self.forwarder.show_sender_info = show;
        }
        if let Some(retries) = legacy.max_retries {
            self.forwarder.max_retries = retries;
        }
        if let Some(delay) = legacy.retry_delay {
            self.forwarder.retry_delay_secs = delay;
        }
    }

    fn validate(&self) -> Result<()> {
        let f = &self.forwarder;
        if !f.retry_delay_secs.is_finite() || f.retry_delay_secs < 0.0 {
            anyhow::bail!(
                "forwarder.retry_delay_secs must be a non-negative number, got {}",
                f.retry_delay_secs
            );
        }
        if f.workers == 0 {
            anyhow::bail!("forwarder.workers must be at least 1");
        }
        if f.retention_secs < f.dedup_window_secs {
            anyhow::bail!(
                "forwarder.retention_secs ({}) must not be shorter than dedup_window_secs ({})",
                f.retention_secs,
                f.dedup_window_secs
            );
        }
        for rule in &self.rules {
            if rule.source_groups.is_empty() {
                warn!("Rule '{}' has no source groups and will never match", rule.name);
            }
            if rule.prefix_ignored() {
                warn!(
                    "Rule '{}' sets add_prefix but forward_original = true; the prefix is not applied",
                    rule.name
                );
            }
        }
        Ok(())
    }

    pub fn rule_set(&self) -> RuleSet {
        RuleSet::new(self.rules.clone())
    }

    pub fn settings(&self) -> ForwarderSettings {
        let f = &self.forwarder;
        ForwarderSettings {
            show_sender: f.show_sender_info,
            retry: RetryPolicy {
                max_retries: f.max_retries,
                retry_delay: Duration::from_secs_f64(f.retry_delay_secs),
            },
            dedup_window: Duration::from_secs(f.dedup_window_secs),
            retention: Duration::from_secs(f.retention_secs),
            workers: f.workers,
            max_payloads: f.max_payloads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TELEGRAM: &str = "[telegram]\nbot_token = \"t\"\n";

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str(TELEGRAM).unwrap();
        let settings = config.settings();
        assert!(settings.show_sender);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.retry_delay, Duration::from_secs(1));
        assert_eq!(settings.dedup_window, Duration::from_secs(60));
        assert_eq!(settings.retention, Duration::from_secs(600));
        assert!(config.rules.is_empty());
        assert!(config.telegram.admin_user_ids.is_empty());
    }

    #[test]
    fn test_rules_keep_declared_order() {
        let toml = format!(
            r#"{TELEGRAM}
[[rules]]
name = "news"
source_groups = ["-1001"]
target_groups = ["-1002", "-1003"]
keywords = ["breaking"]
exclude_users = ["42"]
forward_original = false
add_prefix = "[news] "

[[rules]]
name = "all"
source_groups = ["-1001"]
target_groups = ["-1004"]
"#
        );
        let config = Config::from_toml_str(&toml).unwrap();
        let rules = config.rule_set();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.rules()[0].name, "news");
        assert!(!rules.rules()[0].forward_original);
        assert!(rules.rules()[1].forward_original);
        assert!(rules.rules()[1].keywords.is_empty());
        assert_eq!(
            rules.match_rule("-1001", "42", "breaking news").unwrap().name,
            "all"
        );
    }

    #[test]
    fn test_legacy_forward_table_is_migrated() {
        let toml = format!(
            r#"{TELEGRAM}
[forward]
source_group = "-1001"
target_group = "-1002"
monitor_users = ["7"]
show_sender_info = false
max_retries = 5
retry_delay = 0.5
"#
        );
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(config.forward.is_none());
        assert_eq!(config.rules.len(), 1);

        let rule = &config.rules[0];
        assert!(rule.source_groups.contains("-1001"));
        assert_eq!(rule.target_groups, vec!["-1002"]);
        assert!(rule.monitor_users.contains("7"));

        let settings = config.settings();
        assert!(!settings.show_sender);
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_legacy_without_groups_never_matches() {
        let toml = format!("{TELEGRAM}\n[forward]\n");
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(config.rule_set().match_rule("-1", "u", "x").is_none());
    }

    #[test]
    fn test_rules_win_over_legacy() {
        let toml = format!(
            r#"{TELEGRAM}
[forward]
source_group = "-9"
target_group = "-8"

[[rules]]
name = "r"
source_groups = ["-1"]
target_groups = ["-2"]
"#
        );
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].name, "r");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let bad_delay = format!("{TELEGRAM}\n[forwarder]\nretry_delay_secs = -1.0\n");
        assert!(Config::from_toml_str(&bad_delay).is_err());

        let no_workers = format!("{TELEGRAM}\n[forwarder]\nworkers = 0\n");
        assert!(Config::from_toml_str(&no_workers).is_err());

        let windows = format!(
            "{TELEGRAM}\n[forwarder]\ndedup_window_secs = 120\nretention_secs = 60\n"
        );
        assert!(Config::from_toml_str(&windows).is_err());
    }

    #[test]
    fn test_prefix_without_forward_original_false_still_loads() {
        let toml = format!(
            r#"{TELEGRAM}
[[rules]]
name = "tagged"
source_groups = ["-1"]
target_groups = ["-2"]
add_prefix = "[tag] "
"#
        );
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(config.rules[0].forward_original);
        assert!(config.rules[0].prefix_ignored());
    }

    #[test]
    fn test_missing_telegram_section_fails() {
        assert!(Config::from_toml_str("[forwarder]\nworkers = 2\n").is_err());
    }
}
