//! Configuration loading for a Tandem node.
//!
//! The canonical configuration lives in `tandem-config.yaml`. Every field
//! has a default, so an empty file (or no file at all) yields a working
//! networked node. A few infrastructure settings can be overridden from the
//! environment: `NATS_URL`, `TANDEM_NODE_ID`, and `TANDEM_LOCAL`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tandem_broker::DEFAULT_LOCAL_CAPACITY;
use tandem_core::ControllerSettings;

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

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Backoff between broker retries in normal operation.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Backoff between broker retries when `under_test` is set.
const TEST_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound on the snapshot discovery wait when `under_test` is set.
const TEST_SNAPSHOT_WAIT: Duration = Duration::from_millis(200);

/// Upper bound on the snapshot capture wait when `under_test` is set.
const TEST_SNAPSHOT_CAPTURE: Duration = Duration::from_millis(200);

/// Node configuration.
///
/// Mirrors the structure of `tandem-config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Use the in-process broker instead of NATS.
    #[serde(default)]
    pub local: bool,

    /// Shorten backoffs and waits for test runs.
    #[serde(default)]
    pub under_test: bool,

    /// Input events topic.
    #[serde(default = "default_events_topic")]
    pub events_topic: String,

    /// Control log topic.
    #[serde(default = "default_control_topic")]
    pub control_topic: String,

    /// Snapshot pointer topic.
    #[serde(default = "default_snapshot_topic")]
    pub snapshot_topic: String,

    /// How long each poll waits for records, in milliseconds.
    #[serde(default = "default_poll_timeout_millis")]
    pub poll_timeout_millis: u64,

    /// This node's identity, compared against leadership announcements.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// NATS server URL (networked mode).
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Topic receiving one result message per leader evaluation.
    #[serde(default)]
    pub results_topic: Option<String>,

    /// Take a snapshot every N applied events (0 disables).
    #[serde(default = "default_snapshot_every_events")]
    pub snapshot_every_events: u64,

    /// Directory for file snapshots. In-memory store when unset.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,

    /// Number of snapshots to keep (0 keeps all).
    #[serde(default = "default_snapshot_retain")]
    pub snapshot_retain: usize,

    /// Bound on the startup lookup of the latest snapshot, in milliseconds.
    #[serde(default = "default_snapshot_wait_millis")]
    pub snapshot_wait_millis: u64,

    /// Bound on waiting for the session lock when taking a snapshot, in
    /// milliseconds.
    #[serde(default = "default_snapshot_capture_millis")]
    pub snapshot_capture_millis: u64,

    /// Per-topic record limit of the in-process broker.
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,

    /// NATS subject announcing the current leader's node id.
    #[serde(default)]
    pub leader_signal_subject: Option<String>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local: false,
            under_test: false,
            events_topic: default_events_topic(),
            control_topic: default_control_topic(),
            snapshot_topic: default_snapshot_topic(),
            poll_timeout_millis: default_poll_timeout_millis(),
            node_id: default_node_id(),
            nats_url: default_nats_url(),
            results_topic: None,
            snapshot_every_events: default_snapshot_every_events(),
            snapshot_dir: None,
            snapshot_retain: default_snapshot_retain(),
            snapshot_wait_millis: default_snapshot_wait_millis(),
            snapshot_capture_millis: default_snapshot_capture_millis(),
            local_capacity: default_local_capacity(),
            leader_signal_subject: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, or
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override infrastructure settings from environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Override infrastructure settings from `lookup` (an environment view).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("NATS_URL") {
            self.nats_url = val;
        }
        if let Some(val) = lookup("TANDEM_NODE_ID") {
            self.node_id = val;
        }
        if let Some(val) = lookup("TANDEM_LOCAL") {
            self.local = matches!(val.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for empty or duplicate topic names,
    /// a zero poll timeout, or an empty node id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for topic in self.topics() {
            if topic.trim().is_empty() {
                return Err(ConfigError::Invalid(String::from("topic names must not be empty")));
            }
            if !seen.insert(topic) {
                return Err(ConfigError::Invalid(format!("topic {topic} is configured twice")));
            }
        }
        if self.poll_timeout_millis == 0 {
            return Err(ConfigError::Invalid(String::from("poll_timeout_millis must be positive")));
        }
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid(String::from("node_id must not be empty")));
        }
        Ok(())
    }

    /// Every topic this node reads or writes.
    pub fn topics(&self) -> Vec<&str> {
        let mut topics = vec![
            self.events_topic.as_str(),
            self.control_topic.as_str(),
            self.snapshot_topic.as_str(),
        ];
        if let Some(results) = &self.results_topic {
            topics.push(results.as_str());
        }
        topics
    }

    /// Poll timeout as a [`Duration`].
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_millis)
    }

    /// Bounded wait for snapshot discovery at startup.
    pub fn snapshot_wait(&self) -> Duration {
        let wait = Duration::from_millis(self.snapshot_wait_millis);
        if self.under_test {
            wait.min(TEST_SNAPSHOT_WAIT)
        } else {
            wait
        }
    }

    /// Bounded wait for the session lock when taking a snapshot.
    pub fn snapshot_capture_timeout(&self) -> Duration {
        let wait = Duration::from_millis(self.snapshot_capture_millis);
        if self.under_test {
            wait.min(TEST_SNAPSHOT_CAPTURE)
        } else {
            wait
        }
    }

    /// Pause between broker retries.
    pub const fn retry_backoff(&self) -> Duration {
        if self.under_test {
            TEST_RETRY_BACKOFF
        } else {
            RETRY_BACKOFF
        }
    }

    /// Controller settings derived from this configuration.
    pub fn controller_settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::new(&self.events_topic, &self.control_topic);
        settings.results_topic.clone_from(&self.results_topic);
        settings.poll_timeout = self.poll_timeout();
        settings.retry_backoff = self.retry_backoff();
        settings.snapshot_every_events = self.snapshot_every_events;
        settings
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_events_topic() -> String {
    "tandem.events".to_owned()
}

fn default_control_topic() -> String {
    "tandem.control".to_owned()
}

fn default_snapshot_topic() -> String {
    "tandem.snapshots".to_owned()
}

const fn default_poll_timeout_millis() -> u64 {
    500
}

fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::now_v7())
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_owned()
}

const fn default_snapshot_every_events() -> u64 {
    1000
}

const fn default_snapshot_retain() -> usize {
    3
}

const fn default_snapshot_wait_millis() -> u64 {
    2000
}

const fn default_snapshot_capture_millis() -> u64 {
    5000
}

const fn default_local_capacity() -> usize {
    DEFAULT_LOCAL_CAPACITY
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let config: EngineConfig = serde_yml::from_str("{}").unwrap();
        assert!(!config.local);
        assert_eq!(config.events_topic, "tandem.events");
        assert_eq!(config.control_topic, "tandem.control");
        assert_eq!(config.snapshot_topic, "tandem.snapshots");
        assert_eq!(config.poll_timeout(), Duration::from_millis(500));
        assert!(config.node_id.starts_with("node-"));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.snapshot_capture_timeout(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
local: true
under_test: true
events_topic: "orders"
control_topic: "orders.control"
snapshot_topic: "orders.snapshots"
poll_timeout_millis: 50
node_id: "node-a"
results_topic: "orders.results"
snapshot_every_events: 10
snapshot_dir: "/var/lib/tandem"
snapshot_retain: 5
snapshot_wait_millis: 5000
snapshot_capture_millis: 1000
local_capacity: 128
leader_signal_subject: "tandem.leader"
logging:
  level: "debug"
  json: true
"#;
        let config: EngineConfig = serde_yml::from_str(yaml).unwrap();
        assert!(config.local);
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.topics().len(), 4);
        assert_eq!(config.snapshot_dir, Some(PathBuf::from("/var/lib/tandem")));
        assert_eq!(config.snapshot_wait(), TEST_SNAPSHOT_WAIT);
        assert_eq!(config.snapshot_capture_timeout(), TEST_SNAPSHOT_CAPTURE);
        assert_eq!(config.retry_backoff(), TEST_RETRY_BACKOFF);
        assert!(config.logging.json);

        let settings = config.controller_settings();
        assert_eq!(settings.events_topic, "orders");
        assert_eq!(settings.results_topic.as_deref(), Some("orders.results"));
        assert_eq!(settings.snapshot_every_events, 10);
        assert_eq!(settings.poll_timeout, Duration::from_millis(50));
    }

    #[test]
    fn overrides_replace_infrastructure_settings() {
        let mut config = EngineConfig::default();
        config.apply_overrides(|name| match name {
            "NATS_URL" => Some(String::from("nats://nats:4222")),
            "TANDEM_NODE_ID" => Some(String::from("node-7")),
            "TANDEM_LOCAL" => Some(String::from("TRUE")),
            _ => None,
        });
        assert_eq!(config.nats_url, "nats://nats:4222");
        assert_eq!(config.node_id, "node-7");
        assert!(config.local);
    }

    #[test]
    fn duplicate_topics_are_rejected() {
        let config = EngineConfig {
            control_topic: String::from("tandem.events"),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_topic_and_zero_timeout_are_rejected() {
        let empty = EngineConfig {
            snapshot_topic: String::new(),
            ..EngineConfig::default()
        };
        assert!(empty.validate().is_err());

        let zero = EngineConfig {
            poll_timeout_millis: 0,
            ..EngineConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn invalid_yaml_is_reported() {
        assert!(matches!(
            EngineConfig::parse("local: [unterminated"),
            Err(ConfigError::Yaml { .. })
        ));
    }
}
