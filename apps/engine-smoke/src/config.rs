//! Environment-backed configuration for `engine-smoke`.

use std::{env, error::Error, fmt, path::PathBuf};

use engine_core::{EngineTuning, VisibilityConfig};

const DEFAULT_USER_ID: &str = "@smoke:example.org";

/// Runtime configuration of the smoke session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Local user the scripted session runs as.
    pub user_id: String,
    pub tuning: EngineTuning,
    /// Initial visibility toggles.
    pub visibility: VisibilityConfig,
    /// Breadcrumb JSON file; in-memory breadcrumbs when unset.
    pub breadcrumbs_path: Option<PathBuf>,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user_id = optional_trimmed_env("CHAT_ENGINE_USER", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());
        if !user_id.starts_with('@') || !user_id.contains(':') {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_ENGINE_USER",
                value: user_id,
                reason: "expected a user id like @name:server".to_owned(),
            });
        }

        let defaults = EngineTuning::default();
        let tuning = EngineTuning {
            receipt_debounce_ms: parse_optional_u64("CHAT_ENGINE_RECEIPT_DEBOUNCE_MS", &mut lookup)?
                .unwrap_or(defaults.receipt_debounce_ms),
            recompute_debounce_ms: parse_optional_u64(
                "CHAT_ENGINE_RECOMPUTE_DEBOUNCE_MS",
                &mut lookup,
            )?
            .unwrap_or(defaults.recompute_debounce_ms),
            paginate_limit: parse_optional_u16("CHAT_ENGINE_PAGINATE_LIMIT", &mut lookup)?
                .unwrap_or(defaults.paginate_limit),
        };
        if tuning.paginate_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_ENGINE_PAGINATE_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let shown = VisibilityConfig::default();
        let visibility = VisibilityConfig {
            show_join_events: parse_optional_bool("CHAT_ENGINE_SHOW_JOIN_EVENTS", &mut lookup)?
                .unwrap_or(shown.show_join_events),
            show_leave_events: parse_optional_bool("CHAT_ENGINE_SHOW_LEAVE_EVENTS", &mut lookup)?
                .unwrap_or(shown.show_leave_events),
            show_room_edits: parse_optional_bool("CHAT_ENGINE_SHOW_ROOM_EDITS", &mut lookup)?
                .unwrap_or(shown.show_room_edits),
            show_redacted_events: parse_optional_bool(
                "CHAT_ENGINE_SHOW_REDACTED_EVENTS",
                &mut lookup,
            )?
            .unwrap_or(shown.show_redacted_events),
        };

        let breadcrumbs_path =
            optional_trimmed_env("CHAT_ENGINE_BREADCRUMBS_PATH", &mut lookup).map(PathBuf::from);

        Ok(Self {
            user_id,
            tuning,
            visibility,
            breadcrumbs_path,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u16>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true/false".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg.user_id, DEFAULT_USER_ID);
        assert_eq!(cfg.tuning, EngineTuning::default());
        assert_eq!(cfg.visibility, VisibilityConfig::default());
        assert_eq!(cfg.breadcrumbs_path, None);
    }

    #[test]
    fn parses_tuning_visibility_and_paths() {
        let cfg = config_from_pairs(&[
            ("CHAT_ENGINE_USER", " @alice:example.org "),
            ("CHAT_ENGINE_RECEIPT_DEBOUNCE_MS", "500"),
            ("CHAT_ENGINE_RECOMPUTE_DEBOUNCE_MS", "100"),
            ("CHAT_ENGINE_PAGINATE_LIMIT", "50"),
            ("CHAT_ENGINE_SHOW_JOIN_EVENTS", "off"),
            ("CHAT_ENGINE_SHOW_REDACTED_EVENTS", "FALSE"),
            ("CHAT_ENGINE_BREADCRUMBS_PATH", "/tmp/engine/breadcrumbs.json"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.user_id, "@alice:example.org");
        assert_eq!(
            cfg.tuning,
            EngineTuning {
                receipt_debounce_ms: 500,
                recompute_debounce_ms: 100,
                paginate_limit: 50,
            }
        );
        assert!(!cfg.visibility.show_join_events);
        assert!(cfg.visibility.show_leave_events);
        assert!(!cfg.visibility.show_redacted_events);
        assert_eq!(
            cfg.breadcrumbs_path,
            Some(PathBuf::from("/tmp/engine/breadcrumbs.json"))
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config_from_pairs(&[("CHAT_ENGINE_PAGINATE_LIMIT", "0")])
            .expect_err("zero page size");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_ENGINE_PAGINATE_LIMIT",
                ..
            }
        ));

        let err = config_from_pairs(&[("CHAT_ENGINE_SHOW_ROOM_EDITS", "maybe")])
            .expect_err("not a bool");
        assert_eq!(
            err.to_string(),
            "invalid CHAT_ENGINE_SHOW_ROOM_EDITS='maybe': expected true/false"
        );

        assert!(config_from_pairs(&[("CHAT_ENGINE_RECEIPT_DEBOUNCE_MS", "-1")]).is_err());
        assert!(config_from_pairs(&[("CHAT_ENGINE_USER", "smoke")]).is_err());
    }
}
