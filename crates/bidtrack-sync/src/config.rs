//! Settings resolution: built-in defaults, then an optional YAML file merged
//! key by key, then command-line overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bidtrack_adapters::{SourceKind, SourceSettings};
use bidtrack_storage::PgStoreSettings;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::scheduler::CycleSettings;

pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid setting `{field}`: {reason}")]
pub struct SettingsError {
    pub field: &'static str,
    pub reason: String,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "ebay_tracker".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_connections: 1,
            acquire_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub pattern: String,
    pub auction_period_hours: u32,
    pub completed_period_hours: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            pattern: "rtx 3090".to_string(),
            auction_period_hours: 24,
            completed_period_hours: 48,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub polling_interval_minutes: u64,
    pub retry_delay_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            polling_interval_minutes: 30,
            retry_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub source: SourceSettings,
    pub search: SearchSettings,
    pub daemon: DaemonSettings,
    pub logging: LoggingSettings,
}

/// Values given on the command line. `None` leaves the resolved value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub search_pattern: Option<String>,
    pub auction_period_hours: Option<u32>,
    pub completed_period_hours: Option<u32>,
    pub polling_interval_minutes: Option<u64>,
    pub log_level: Option<String>,
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub fixture_dir: Option<PathBuf>,
    pub feed_url: Option<String>,
}

impl SettingsOverrides {
    pub fn apply(&self, settings: &mut Settings) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }

        set(&mut settings.search.pattern, &self.search_pattern);
        set(&mut settings.search.auction_period_hours, &self.auction_period_hours);
        set(&mut settings.search.completed_period_hours, &self.completed_period_hours);
        set(&mut settings.daemon.polling_interval_minutes, &self.polling_interval_minutes);
        set(&mut settings.logging.level, &self.log_level);
        set(&mut settings.database.host, &self.db_host);
        set(&mut settings.database.port, &self.db_port);
        set(&mut settings.database.name, &self.db_name);
        set(&mut settings.database.user, &self.db_user);
        set(&mut settings.database.password, &self.db_password);

        if let Some(dir) = &self.fixture_dir {
            settings.source.kind = SourceKind::Fixture;
            settings.source.fixture_dir = Some(dir.clone());
        }
        if let Some(url) = &self.feed_url {
            settings.source.kind = SourceKind::Http;
            settings.source.base_url = Some(url.clone());
        }
    }
}

/// Overlay `overlay` onto `base`: mappings merge key by key, anything else
/// replaces.
fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

impl Settings {
    /// Resolve defaults < `config_path` < `overrides`, then validate. A
    /// config path that cannot be read is an error.
    pub fn load(config_path: Option<&Path>, overrides: &SettingsOverrides) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                Self::from_yaml_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        overrides.apply(&mut settings);
        settings.validate().context("resolving settings")?;
        Ok(settings)
    }

    /// Defaults with a YAML document merged on top. An empty document yields
    /// the defaults.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let overlay: Value = serde_yaml::from_str(raw).context("parsing yaml")?;
        let mut merged = serde_yaml::to_value(Self::default()).context("encoding default settings")?;
        if !overlay.is_null() {
            merge_yaml(&mut merged, overlay);
        }
        serde_yaml::from_value(merged).context("decoding merged settings")
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.search.pattern.trim().is_empty() {
            return Err(invalid("search.pattern", "must not be empty"));
        }
        if self.search.auction_period_hours == 0 {
            return Err(invalid("search.auction_period_hours", "must be positive"));
        }
        if self.search.completed_period_hours == 0 {
            return Err(invalid("search.completed_period_hours", "must be positive"));
        }
        if self.daemon.polling_interval_minutes == 0 {
            return Err(invalid("daemon.polling_interval_minutes", "must be positive"));
        }
        if self.daemon.retry_delay_secs == 0 {
            return Err(invalid("daemon.retry_delay_secs", "must be positive"));
        }
        match self.source.kind {
            SourceKind::Http if self.source.base_url.as_deref().map_or(true, |u| u.trim().is_empty()) => {
                return Err(invalid("source.base_url", "required when source.kind is http"));
            }
            SourceKind::Fixture if self.source.fixture_dir.is_none() => {
                return Err(invalid("source.fixture_dir", "required when source.kind is fixture"));
            }
            _ => {}
        }
        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(
                "logging.level",
                format!("`{}` is not one of {}", self.logging.level, LOG_LEVELS.join("|")),
            ));
        }
        Ok(())
    }

    /// The fully concrete values one scheduler instance runs with.
    pub fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            pattern: self.search.pattern.clone(),
            lookahead_hours: self.search.auction_period_hours,
            lookback_hours: self.search.completed_period_hours,
            interval: Duration::from_secs(self.daemon.polling_interval_minutes.saturating_mul(60)),
            retry_delay: Duration::from_secs(self.daemon.retry_delay_secs),
        }
    }

    pub fn store_settings(&self) -> PgStoreSettings {
        PgStoreSettings {
            host: self.database.host.clone(),
            port: self.database.port,
            database: self.database.name.clone(),
            user: self.database.user.clone(),
            password: self.database.password.clone(),
            max_connections: self.database.max_connections,
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_secs),
        }
    }

    /// Lower-cased `logging.level`, usable as a tracing filter directive.
    pub fn log_filter(&self) -> String {
        self.logging.level.to_ascii_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        assert_eq!(settings.validate(), Ok(()));
        assert_eq!(settings.search.pattern, "rtx 3090");
        assert_eq!(settings.database.name, "ebay_tracker");
        assert_eq!(settings.cycle_settings().interval, Duration::from_secs(30 * 60));
        assert_eq!(settings.cycle_settings().retry_delay, Duration::from_secs(60));
    }

    #[test]
    fn yaml_merges_nested_keys_onto_defaults() {
        let settings = Settings::from_yaml_str(
            r#"
database:
  host: db.internal
search:
  pattern: "rtx 4090"
source:
  excluded_terms: [cracked]
"#,
        )
        .expect("settings");
        assert_eq!(settings.database.host, "db.internal");
        assert_eq!(settings.database.port, 5432);
        assert_eq!(settings.search.pattern, "rtx 4090");
        assert_eq!(settings.search.auction_period_hours, 24);
        assert_eq!(settings.source.excluded_terms, vec!["cracked".to_string()]);
        assert_eq!(settings.source.user_agent, "bidtrack/0.1");
    }

    #[test]
    fn empty_yaml_is_defaults() {
        assert_eq!(Settings::from_yaml_str("").expect("settings"), Settings::default());
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "search:\n  pattern: from-file\n  completed_period_hours: 12\n").expect("write");

        let overrides = SettingsOverrides {
            search_pattern: Some("from-cli".into()),
            polling_interval_minutes: Some(5),
            feed_url: Some("http://feed.test".into()),
            ..Default::default()
        };
        let settings = Settings::load(Some(&path), &overrides).expect("settings");
        assert_eq!(settings.search.pattern, "from-cli");
        assert_eq!(settings.search.completed_period_hours, 12);
        assert_eq!(settings.daemon.polling_interval_minutes, 5);
        assert_eq!(settings.source.kind, SourceKind::Http);
        assert_eq!(settings.source.base_url.as_deref(), Some("http://feed.test"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let err = Settings::load(Some(&dir.path().join("absent.yaml")), &SettingsOverrides::default())
            .unwrap_err();
        assert!(format!("{err:#}").contains("absent.yaml"));
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let mut settings = Settings::default();
        settings.search.auction_period_hours = 0;
        assert_eq!(settings.validate().unwrap_err().field, "search.auction_period_hours");

        let mut settings = Settings::default();
        settings.source.kind = SourceKind::Http;
        assert_eq!(settings.validate().unwrap_err().field, "source.base_url");

        let mut settings = Settings::default();
        settings.logging.level = "LOUD".into();
        assert_eq!(settings.validate().unwrap_err().field, "logging.level");

        let mut settings = Settings::default();
        settings.logging.level = "DEBUG".into();
        assert_eq!(settings.validate(), Ok(()));
        assert_eq!(settings.log_filter(), "debug");
    }
}
