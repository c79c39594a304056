//! TOML configuration: loading, validation, and the starter template.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::normalize::normalize_provider_name;
use crate::ratelimit::RateLimitConfig;
use crate::resolver::Action;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },

    #[error("Config file already exists: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("Failed to write config file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Sonarr connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SonarrConfig {
    pub url: Url,
    pub api_key: String,
}

/// One subscribed (service, country) pair. Order in the config file is the
/// order they are tried per series.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Target {
    pub name: String,
    pub country: String,
}

/// Sync run behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSettings {
    pub action: Action,
    pub dry_run: bool,
    /// Series added within this many days are never acted on.
    pub exclude_recent_days: u32,
    /// Maximum series processed in parallel.
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            action: Action::Unmonitor,
            dry_run: true,
            exclude_recent_days: 7,
            concurrency: 4,
        }
    }
}

/// Settings shared by every availability data source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub api_key: String,
    /// Successful answers stay cached this long.
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
    /// Sliding-window size in seconds.
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    /// Maximum requests per sliding window.
    #[serde(default = "default_rate_max_requests")]
    pub rate_max_requests: u32,
    /// Hard calendar-day ceiling, if the plan has one.
    #[serde(default)]
    pub daily_quota: Option<u32>,
    /// Hard calendar-month ceiling, if the plan has one.
    #[serde(default)]
    pub monthly_quota: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_hours() -> u64 {
    24
}

fn default_rate_window_secs() -> u64 {
    10
}

fn default_rate_max_requests() -> u32 {
    40
}

impl SourceSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(self.rate_window_secs),
            max_requests: self.rate_max_requests,
            daily_quota: self.daily_quota,
            monthly_quota: self.monthly_quota,
        }
    }
}

/// Availability data sources, in fixed fallback priority: TMDB first, then
/// Streaming Availability, then Utelly.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub tmdb: Option<SourceSettings>,
    pub streaming_availability: Option<SourceSettings>,
    pub utelly: Option<SourceSettings>,
}

impl SourcesConfig {
    fn enabled_count(&self) -> usize {
        [&self.tmdb, &self.streaming_availability, &self.utelly]
            .into_iter()
            .flatten()
            .filter(|source| source.enabled)
            .count()
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub sonarr: SonarrConfig,
    /// Subscribed services, in match-priority order.
    #[serde(default)]
    pub streaming_providers: Vec<Target>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub sources: SourcesConfig,
    /// Overrides the platform cache/state directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field rules the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sonarr.api_key.trim().is_empty() {
            return Err(invalid("sonarr.api_key must not be empty"));
        }
        if self.streaming_providers.is_empty() {
            return Err(invalid("at least one streaming provider target is required"));
        }

        let mut seen = HashSet::new();
        for target in &self.streaming_providers {
            if target.country.len() != 2 || !target.country.chars().all(|c| c.is_ascii_alphabetic())
            {
                return Err(invalid(&format!(
                    "'{}' is not a two-letter country code",
                    target.country
                )));
            }
            let key = (normalize_provider_name(&target.name), target.country.to_uppercase());
            if key.0.is_empty() {
                return Err(invalid("streaming provider name must not be empty"));
            }
            if !seen.insert(key) {
                return Err(invalid(&format!(
                    "duplicate streaming provider target: {} ({})",
                    target.name, target.country
                )));
            }
        }

        if self.sources.enabled_count() == 0 {
            return Err(invalid(
                "at least one availability source (tmdb, streaming_availability, utelly) \
                 must be configured and enabled",
            ));
        }
        for (name, source) in [
            ("tmdb", &self.sources.tmdb),
            ("streaming_availability", &self.sources.streaming_availability),
            ("utelly", &self.sources.utelly),
        ] {
            if let Some(source) = source {
                if source.enabled && source.api_key.trim().is_empty() {
                    return Err(invalid(&format!("sources.{name}.api_key must not be empty")));
                }
                if source.rate_max_requests == 0 {
                    return Err(invalid(&format!(
                        "sources.{name}.rate_max_requests must be at least 1"
                    )));
                }
            }
        }

        if self.sync.concurrency == 0 {
            return Err(invalid("sync.concurrency must be at least 1"));
        }
        Ok(())
    }

    /// Targets with names normalized and countries uppercased.
    pub fn normalized_targets(&self) -> Vec<Target> {
        self.streaming_providers
            .iter()
            .map(|target| Target {
                name: normalize_provider_name(&target.name),
                country: target.country.to_uppercase(),
            })
            .collect()
    }

    /// Writes the starter template to `path`, refusing to overwrite.
    pub fn write_template(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Err(ConfigError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, TEMPLATE).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default config file location for this platform.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "cullarr", "cullarr")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.to_string(),
    }
}

const TEMPLATE: &str = r#"# cullarr configuration

[sonarr]
url = "http://localhost:8989"
api_key = "your-sonarr-api-key"

# Services you subscribe to, in the order they should be matched.
[[streaming_providers]]
name = "netflix"
country = "US"

[[streaming_providers]]
name = "amazon-prime"
country = "US"

[sync]
# "unmonitor" or "delete"
action = "unmonitor"
dry_run = true
exclude_recent_days = 7
concurrency = 4

# Availability data sources, tried in this order.
[sources.tmdb]
api_key = "your-tmdb-api-key"
cache_ttl_hours = 24
rate_window_secs = 10
rate_max_requests = 40

# Optional season-granular fallback (RapidAPI, metered per day).
# [sources.streaming_availability]
# api_key = "your-rapidapi-key"
# cache_ttl_hours = 24
# daily_quota = 100

# Optional last-resort fallback (RapidAPI, metered per month).
# [sources.utelly]
# api_key = "your-rapidapi-key"
# cache_ttl_hours = 168
# monthly_quota = 1000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
[sonarr]
url = "http://localhost:8989"
api_key = "abc123"

[[streaming_providers]]
name = "Netflix"
country = "us"

[sources.tmdb]
api_key = "tmdb-key"
"#
        .to_string()
    }

    fn load_str(raw: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(raw).expect("toml should parse");
        config.validate().map(|()| config)
    }

    #[test]
    fn test_minimal_config_validates_with_defaults() {
        let config = load_str(&minimal_toml()).unwrap();
        assert_eq!(config.sync.action, Action::Unmonitor);
        assert!(config.sync.dry_run);
        assert_eq!(config.sync.exclude_recent_days, 7);

        let tmdb = config.sources.tmdb.unwrap();
        assert!(tmdb.enabled);
        assert_eq!(tmdb.rate_limit().max_requests, 40);
        assert_eq!(tmdb.cache_ttl(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_targets_are_normalized() {
        let config = load_str(&minimal_toml()).unwrap();
        let targets = config.normalized_targets();
        assert_eq!(targets[0].name, "netflix");
        assert_eq!(targets[0].country, "US");
    }

    #[test]
    fn test_rejects_empty_target_list() {
        let raw = r#"
[sonarr]
url = "http://localhost:8989"
api_key = "abc123"

[sources.tmdb]
api_key = "tmdb-key"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_targets() {
        let raw = minimal_toml()
            + r#"
[[streaming_providers]]
name = "netflix"
country = "US"
"#;
        assert!(load_str(&raw).is_err());
    }

    #[test]
    fn test_rejects_bad_country_code() {
        let raw = minimal_toml().replace("country = \"us\"", "country = \"usa\"");
        assert!(load_str(&raw).is_err());
    }

    #[test]
    fn test_requires_an_enabled_source() {
        let raw = minimal_toml().replace(
            "[sources.tmdb]\napi_key = \"tmdb-key\"",
            "[sources.tmdb]\napi_key = \"tmdb-key\"\nenabled = false",
        );
        assert!(load_str(&raw).is_err());
    }

    #[test]
    fn test_quota_fields_parse() {
        let raw = minimal_toml()
            + r#"
[sources.streaming_availability]
api_key = "rapid"
daily_quota = 100

[sources.utelly]
api_key = "rapid"
monthly_quota = 1000
"#;
        let config = load_str(&raw).unwrap();
        let sa = config.sources.streaming_availability.unwrap();
        assert_eq!(sa.rate_limit().daily_quota, Some(100));
        assert_eq!(
            config.sources.utelly.unwrap().rate_limit().monthly_quota,
            Some(1000)
        );
    }

    #[test]
    fn test_template_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::write_template(&path).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.streaming_providers.len(), 2);
        assert!(config.sync.dry_run);

        assert!(matches!(
            Config::write_template(&path),
            Err(ConfigError::AlreadyExists { .. })
        ));
    }
}
