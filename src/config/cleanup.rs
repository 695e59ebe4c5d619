//! Expiry policy and sweep configuration.
//!
//! Key names also accept the PascalCase spellings of the Azure Functions
//! app settings (`IsEnabled`, `CleanupEnabled`, `Exceptions`,
//! `Subscriptions`, `DefaultExpiry`, `DefaultExtension`, `UsageLookback`),
//! so an existing settings export can be pasted into the `[cleanup]` table.
//!
//! # Example
//!
//! ```toml
//! [cleanup]
//! is_enabled = true
//! cleanup_enabled = false
//! exceptions = "^(prod|shared)-"
//! subscriptions = "00000000-0000-0000-0000-000000000001,00000000-0000-0000-0000-000000000002"
//! default_expiry_days = 2
//! default_extension_days = 4
//! usage_lookback_days = 1
//! max_concurrency = 8
//! group_timeout_secs = 120
//! interval_secs = 3600
//! ```

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Upper bound for every day-count setting. Expiries computed from larger
/// values would leave the four-digit years `ExpiresBy` can hold.
pub const MAX_DAYS: u32 = 36_500;

/// Cleanup configuration.
///
/// `is_enabled` is the global kill switch for the whole run; `cleanup_enabled`
/// only gates the final deletion, so with it off the janitor still stamps and
/// extends `ExpiresBy` tags but never deletes anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupConfig {
    /// Whether the janitor runs at all.
    /// Default: true (must be explicitly disabled)
    #[serde(default = "default_true", alias = "IsEnabled")]
    pub is_enabled: bool,

    /// Whether expired resource groups are actually deleted.
    /// Default: false
    #[serde(default, alias = "CleanupEnabled")]
    pub cleanup_enabled: bool,

    /// Regular expression over resource group names. Matching groups are
    /// skipped entirely. The match is unanchored; use `^...$` for whole names.
    /// The pattern is used exactly as written, so an empty string matches (and
    /// exempts) every group. Leave the key out to exempt nothing by name.
    #[serde(default, alias = "Exceptions")]
    pub exceptions: Option<String>,

    /// Subscription IDs to sweep. Accepts a comma-separated string or an array.
    #[serde(
        default,
        alias = "Subscriptions",
        deserialize_with = "deserialize_subscriptions"
    )]
    pub subscriptions: Vec<String>,

    /// Days until a newly seen resource group expires.
    /// Default: 2, at most [`MAX_DAYS`]
    #[serde(default = "default_expiry_days", alias = "DefaultExpiry")]
    pub default_expiry_days: u32,

    /// Days past the latest administrative activity a group is kept alive.
    /// Default: 4, at most [`MAX_DAYS`]
    #[serde(default = "default_extension_days", alias = "DefaultExtension")]
    pub default_extension_days: u32,

    /// How far back the activity log is searched, in days.
    /// Default: 1, at most [`MAX_DAYS`]
    #[serde(default = "default_usage_lookback_days", alias = "UsageLookback")]
    pub usage_lookback_days: u32,

    /// Maximum resource groups evaluated concurrently within one subscription.
    /// Keep this well under the ARM per-principal request limits.
    /// Default: 8
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum subscriptions swept concurrently.
    /// Default: 4
    #[serde(default = "default_max_concurrent_subscriptions")]
    pub max_concurrent_subscriptions: usize,

    /// Deadline for evaluating and mutating a single resource group.
    /// Default: 120
    #[serde(default = "default_group_timeout_secs")]
    pub group_timeout_secs: u64,

    /// How often the worker runs a sweep (worker mode only).
    /// Default: 3600 (hourly)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            cleanup_enabled: false,
            exceptions: None,
            subscriptions: Vec::new(),
            default_expiry_days: default_expiry_days(),
            default_extension_days: default_extension_days(),
            usage_lookback_days: default_usage_lookback_days(),
            max_concurrency: default_max_concurrency(),
            max_concurrent_subscriptions: default_max_concurrent_subscriptions(),
            group_timeout_secs: default_group_timeout_secs(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_expiry_days() -> u32 {
    2
}

fn default_extension_days() -> u32 {
    4
}

fn default_usage_lookback_days() -> u32 {
    1
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_concurrent_subscriptions() -> usize {
    4
}

fn default_group_timeout_secs() -> u64 {
    120
}

fn default_interval_secs() -> u64 {
    3600
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SubscriptionList {
    Csv(String),
    List(Vec<String>),
}

fn deserialize_subscriptions<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = match SubscriptionList::deserialize(deserializer)? {
        SubscriptionList::Csv(csv) => csv.split(',').map(str::to_string).collect(),
        SubscriptionList::List(list) => list,
    };

    Ok(entries
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

impl CleanupConfig {
    /// Compile the name-exemption pattern, if one is configured.
    pub fn exemption_pattern(&self) -> Result<Option<Regex>, regex::Error> {
        self.exceptions.as_deref().map(Regex::new).transpose()
    }

    /// Get the per-group deadline as a Duration.
    pub fn group_timeout(&self) -> Duration {
        Duration::from_secs(self.group_timeout_secs)
    }

    /// Get the worker interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if let Err(e) = self.exemption_pattern() {
            return Err(format!("cleanup.exceptions is not a valid regex: {e}"));
        }
        if self.is_enabled && self.subscriptions.is_empty() {
            return Err(
                "cleanup.subscriptions must list at least one subscription when the janitor is enabled"
                    .into(),
            );
        }
        if self.default_expiry_days == 0 {
            return Err("cleanup.default_expiry_days must be at least 1".into());
        }
        if self.default_extension_days == 0 {
            return Err("cleanup.default_extension_days must be at least 1".into());
        }
        for (key, days) in [
            ("default_expiry_days", self.default_expiry_days),
            ("default_extension_days", self.default_extension_days),
            ("usage_lookback_days", self.usage_lookback_days),
        ] {
            if days > MAX_DAYS {
                return Err(format!("cleanup.{key} must be at most {MAX_DAYS}"));
            }
        }
        if self.max_concurrency == 0 {
            return Err("cleanup.max_concurrency must be greater than 0".into());
        }
        if self.max_concurrent_subscriptions == 0 {
            return Err("cleanup.max_concurrent_subscriptions must be greater than 0".into());
        }
        if self.group_timeout_secs == 0 {
            return Err("cleanup.group_timeout_secs must be greater than 0".into());
        }
        if self.interval_secs == 0 {
            return Err("cleanup.interval_secs must be greater than 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CleanupConfig::default();
        assert!(config.is_enabled);
        assert!(!config.cleanup_enabled);
        assert!(config.exceptions.is_none());
        assert!(config.subscriptions.is_empty());
        assert_eq!(config.default_expiry_days, 2);
        assert_eq!(config.default_extension_days, 4);
        assert_eq!(config.usage_lookback_days, 1);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.max_concurrent_subscriptions, 4);
        assert_eq!(config.group_timeout(), Duration::from_secs(120));
        assert_eq!(config.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: CleanupConfig = toml::from_str(r#"subscriptions = "sub-a""#).unwrap();
        assert!(config.is_enabled);
        assert_eq!(config.subscriptions, vec!["sub-a".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_pascal_case_aliases() {
        let toml = r#"
            IsEnabled = true
            CleanupEnabled = true
            Exceptions = "^keep-"
            Subscriptions = "sub-a,sub-b"
            DefaultExpiry = 5
            DefaultExtension = 9
            UsageLookback = 3
        "#;
        let config: CleanupConfig = toml::from_str(toml).unwrap();
        assert!(config.is_enabled);
        assert!(config.cleanup_enabled);
        assert_eq!(config.exceptions.as_deref(), Some("^keep-"));
        assert_eq!(config.subscriptions.len(), 2);
        assert_eq!(config.default_expiry_days, 5);
        assert_eq!(config.default_extension_days, 9);
        assert_eq!(config.usage_lookback_days, 3);
    }

    #[test]
    fn test_subscriptions_csv_trims_and_drops_empty_entries() {
        let config: CleanupConfig =
            toml::from_str(r#"subscriptions = " sub-a,,sub-b , ""#).unwrap();
        assert_eq!(
            config.subscriptions,
            vec!["sub-a".to_string(), "sub-b".to_string()]
        );
    }

    #[test]
    fn test_subscriptions_array() {
        let config: CleanupConfig =
            toml::from_str(r#"subscriptions = ["sub-a", " ", "sub-b"]"#).unwrap();
        assert_eq!(
            config.subscriptions,
            vec!["sub-a".to_string(), "sub-b".to_string()]
        );
    }

    #[test]
    fn test_exemption_pattern() {
        let mut config = CleanupConfig::default();
        assert!(config.exemption_pattern().unwrap().is_none());

        config.exceptions = Some("^keep-".into());
        let pattern = config.exemption_pattern().unwrap().unwrap();
        assert!(pattern.is_match("keep-me"));
        assert!(!pattern.is_match("delete-me"));
    }

    #[test]
    fn test_empty_exemption_pattern_matches_every_name() {
        let config = CleanupConfig {
            exceptions: Some(String::new()),
            ..Default::default()
        };
        let pattern = config.exemption_pattern().unwrap().unwrap();
        assert!(pattern.is_match("rg-anything"));
    }

    #[test]
    fn test_exemption_pattern_is_not_trimmed() {
        let config = CleanupConfig {
            exceptions: Some(" rg".into()),
            ..Default::default()
        };
        let pattern = config.exemption_pattern().unwrap().unwrap();
        assert_eq!(pattern.as_str(), " rg");
        assert!(!pattern.is_match("rg-dev"));
        assert!(pattern.is_match("team rg"));
    }

    #[test]
    fn test_invalid_exemption_pattern_rejected() {
        let config = CleanupConfig {
            exceptions: Some("(unclosed".into()),
            subscriptions: vec!["sub-a".into()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("cleanup.exceptions"), "{err}");
    }

    #[test]
    fn test_zero_values_rejected() {
        let base = CleanupConfig {
            subscriptions: vec!["sub-a".into()],
            ..Default::default()
        };

        let config = CleanupConfig {
            max_concurrency: 0,
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = CleanupConfig {
            default_expiry_days: 0,
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = CleanupConfig {
            group_timeout_secs: 0,
            ..base.clone()
        };
        assert!(config.validate().is_err());

        assert!(base.validate().is_ok());
    }

    #[test]
    fn test_day_values_are_bounded() {
        let base = CleanupConfig {
            subscriptions: vec!["sub-a".into()],
            ..Default::default()
        };

        let config = CleanupConfig {
            default_extension_days: MAX_DAYS,
            default_expiry_days: MAX_DAYS,
            usage_lookback_days: MAX_DAYS,
            ..base.clone()
        };
        assert!(config.validate().is_ok());

        let config = CleanupConfig {
            default_extension_days: MAX_DAYS + 1,
            ..base.clone()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("default_extension_days"), "{err}");

        let config = CleanupConfig {
            default_expiry_days: 3_000_000,
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = CleanupConfig {
            usage_lookback_days: MAX_DAYS + 1,
            ..base
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_config_needs_no_subscriptions() {
        let config = CleanupConfig {
            is_enabled: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
