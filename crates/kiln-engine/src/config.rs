//! Configuration loading for the Kiln worker binary.
//!
//! The configuration lives in `kiln-config.yaml` (or the path in
//! `KILN_CONFIG`). Every section and field has a default, so an empty or
//! missing file is valid. Library crates own their config structs; the
//! sections here embed them and add the worker schedule.
//!
//! Environment variables override secrets and the store URL:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `KILN_STORE_URL` | `store.url` |
//! | `METRICS_BEARER_TOKEN` | `sync.api.bearer_token` |
//! | `CLASSIFIER_API_KEY` | `analytics.classifier.api_key` |
//! | `MAIL_API_USER` | `notifications.mail.api_user` |
//! | `MAIL_API_KEY` | `notifications.mail.api_key` |

use std::path::Path;

use serde::Deserialize;

use kiln_analytics::{AggregatorConfig, ClassifierConfig};
use kiln_index::{CollectionSpec, ReconcileConfig};
use kiln_notify::{MailerConfig, RetryQueueConfig};
use kiln_sync::SyncConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KilnConfig {
    /// Store connection.
    #[serde(default)]
    pub store: StoreConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Event analytics.
    #[serde(default)]
    pub analytics: AnalyticsSection,
    /// Metrics sync.
    #[serde(default)]
    pub sync: SyncSection,
    /// Notification delivery.
    #[serde(default)]
    pub notifications: NotificationsSection,
    /// Index reconciliation.
    #[serde(default)]
    pub reconcile: ReconcileSection,
}

/// Which store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Networked `Dragonfly`/Redis.
    #[default]
    Dragonfly,
    /// In-process; state is lost on exit.
    Memory,
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Backend.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Connection URL for the networked backend.
    #[serde(default = "default_store_url")]
    pub url: String,
}

fn default_store_url() -> String {
    "redis://localhost:6379".to_owned()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter (`trace`, `debug`, `info`, `warn`, `error`, or a
    /// full directive). `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Analytics settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnalyticsSection {
    /// Aggregation tuning and reporting zone.
    #[serde(flatten)]
    pub aggregator: AggregatorConfig,
    /// Sentiment classifier endpoint.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Events older than this many days are purged. `0` keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Seconds between retention sweeps.
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
}

const fn default_retention_days() -> u32 {
    90
}

const fn default_retention_interval_secs() -> u64 {
    86_400
}

impl Default for AnalyticsSection {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            classifier: ClassifierConfig::default(),
            retention_days: default_retention_days(),
            retention_interval_secs: default_retention_interval_secs(),
        }
    }
}

/// Sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncSection {
    /// Engine tuning, quota and API endpoint.
    #[serde(flatten)]
    pub engine: SyncConfig,
    /// Seconds between deferred-set sweeps.
    #[serde(default = "default_deferred_interval_secs")]
    pub deferred_interval_secs: u64,
    /// Subjects retried per sweep.
    #[serde(default = "default_deferred_batch")]
    pub deferred_batch: usize,
}

const fn default_deferred_interval_secs() -> u64 {
    60
}

const fn default_deferred_batch() -> usize {
    10
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            engine: SyncConfig::default(),
            deferred_interval_secs: default_deferred_interval_secs(),
            deferred_batch: default_deferred_batch(),
        }
    }
}

/// Notification settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotificationsSection {
    /// Retry ceiling, batch size, history cap and retention.
    #[serde(flatten)]
    pub queue: RetryQueueConfig,
    /// Mail API.
    #[serde(default)]
    pub mail: MailerConfig,
    /// Seconds between queue sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Seconds between history cleanups.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

const fn default_sweep_interval_secs() -> u64 {
    30
}

const fn default_cleanup_interval_secs() -> u64 {
    86_400
}

impl Default for NotificationsSection {
    fn default() -> Self {
        Self {
            queue: RetryQueueConfig::default(),
            mail: MailerConfig::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReconcileSection {
    /// Sweep tuning.
    #[serde(flatten)]
    pub sweep: ReconcileConfig,
    /// Seconds between sweeps.
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Indexed collections.
    #[serde(default = "default_collections")]
    pub collections: Vec<CollectionSpec>,
}

const fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_collections() -> Vec<CollectionSpec> {
    vec![CollectionSpec::projects()]
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            sweep: ReconcileConfig::default(),
            interval_secs: default_reconcile_interval_secs(),
            collections: default_collections(),
        }
    }
}

impl KilnConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, and
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, and
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(url) = set("KILN_STORE_URL") {
            self.store.url = url;
        }
        if let Some(token) = set("METRICS_BEARER_TOKEN") {
            self.sync.engine.api.bearer_token = Some(token);
        }
        if let Some(key) = set("CLASSIFIER_API_KEY") {
            self.analytics.classifier.api_key = Some(key);
        }
        if let Some(user) = set("MAIL_API_USER") {
            self.notifications.mail.api_user = Some(user);
        }
        if let Some(key) = set("MAIL_API_KEY") {
            self.notifications.mail.api_key = Some(key);
        }
    }

    /// Reject values no worker can run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("analytics.retention_interval_secs", self.analytics.retention_interval_secs),
            ("sync.deferred_interval_secs", self.sync.deferred_interval_secs),
            ("notifications.sweep_interval_secs", self.notifications.sweep_interval_secs),
            ("notifications.cleanup_interval_secs", self.notifications.cleanup_interval_secs),
            ("reconcile.interval_secs", self.reconcile.interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.sync.engine.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "sync.batch_size must be greater than zero".to_owned(),
            ));
        }
        if self.notifications.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "notifications.max_attempts must be greater than zero".to_owned(),
            ));
        }
        let offset = self.analytics.aggregator.utc_offset_hours;
        if !(-12..=14).contains(&offset) {
            return Err(ConfigError::Invalid(format!(
                "analytics.utc_offset_hours {offset} is outside -12..=14"
            )));
        }
        for collection in &self.reconcile.collections {
            collection
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse_without_env(yaml: &str) -> KilnConfig {
        let mut config: KilnConfig = serde_yml::from_str(yaml).unwrap();
        config.apply_overrides(|_| None);
        config
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = KilnConfig::parse("").unwrap();
        assert_eq!(config.sync.engine.batch_size, 100);
        assert_eq!(config.notifications.queue.max_attempts, 3);
        assert_eq!(config.analytics.aggregator.utc_offset_hours, -4);
        assert_eq!(config.reconcile.collections, vec![CollectionSpec::projects()]);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn sections_flatten_library_configs() {
        let config = parse_without_env(
            r"
store:
  backend: memory
analytics:
  utc_offset_hours: 0
  cache_ttl_secs: 0
  classifier:
    model: gemini-2.0-flash
sync:
  batch_size: 50
  class: x-api
  rate_limit:
    limit: 900
  deferred_batch: 3
notifications:
  max_attempts: 5
  mail:
    from_name: Campaigns
reconcile:
  chunk_size: 25
  collections:
    - namespace: kol
      facets:
        - name: tier
          normalize: lowercase
",
        );
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.analytics.aggregator.utc_offset_hours, 0);
        assert_eq!(config.analytics.aggregator.cache_ttl_secs, 0);
        assert_eq!(config.analytics.classifier.model, "gemini-2.0-flash");
        assert_eq!(config.sync.engine.batch_size, 50);
        assert_eq!(config.sync.engine.class, "x-api");
        assert_eq!(config.sync.engine.rate_limit.limit, 900);
        assert_eq!(config.sync.engine.rate_limit.window_secs, 900);
        assert_eq!(config.sync.deferred_batch, 3);
        assert_eq!(config.notifications.queue.max_attempts, 5);
        assert_eq!(config.notifications.mail.from_name, "Campaigns");
        assert_eq!(config.reconcile.sweep.chunk_size, 25);
        assert_eq!(config.reconcile.collections.len(), 1);
        assert!(config.reconcile.collections[0].is_declared("tier"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped = parse_without_env(include_str!("../../../kiln-config.yaml"));
        let defaults = parse_without_env("{}");
        assert_eq!(shipped, defaults);
    }

    #[test]
    fn env_overrides_secrets() {
        let mut config = KilnConfig::default();
        config.apply_overrides(|name| match name {
            "KILN_STORE_URL" => Some("redis://dragonfly:6379".to_owned()),
            "METRICS_BEARER_TOKEN" => Some("token".to_owned()),
            "MAIL_API_USER" => Some("user".to_owned()),
            "MAIL_API_KEY" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.store.url, "redis://dragonfly:6379");
        assert_eq!(config.sync.engine.api.bearer_token.as_deref(), Some("token"));
        assert_eq!(config.notifications.mail.api_user.as_deref(), Some("user"));
        assert_eq!(config.notifications.mail.api_key, None);
        assert_eq!(config.analytics.classifier.api_key, None);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = KilnConfig::default();
        config.reconcile.interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = KilnConfig::default();
        config.analytics.aggregator.utc_offset_hours = 20;
        assert!(config.validate().is_err());

        let mut config = KilnConfig::default();
        config.reconcile.collections = vec![CollectionSpec::new("a:b")];
        assert!(config.validate().is_err());

        let yaml = "reconcile:\n  collections:\n    - namespace: \"user:profile\"\n";
        assert!(matches!(KilnConfig::parse(yaml), Err(ConfigError::Yaml { .. })));
    }
}
