//! Adapter configuration.
//!
//! [`AdapterConfig`] can be built in code with the builder methods or
//! loaded from a TOML file. Durations are written in milliseconds:
//!
//! ```toml
//! client = true
//! server = false
//! transports = ["gatt"]
//! mtu = 20
//! discovery_wait_ms = 2000
//! discovery_retries = 5
//! operation_timeout_ms = 30000   # 0 disables the watchdog
//! multicast_fanout = 1
//!
//! [retry]
//! max_retries = 0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use btlink_types::TransportKind;
use btlink_types::fragment::{MAX_DATAGRAM_LEN, MIN_MTU};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryConfig;

/// Default time to wait for a discovery result per retry.
pub const DEFAULT_DISCOVERY_WAIT: Duration = Duration::from_secs(2);

/// Default number of discovery waits before giving up.
pub const DEFAULT_DISCOVERY_RETRIES: u32 = 5;

/// Default time a session may go without progress.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default granularity of blocking waits.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Default number of worker threads in the task pool.
pub const DEFAULT_TASK_POOL_SIZE: usize = 4;

/// Transport adapter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Run the initiating role (scan, connect, write).
    pub client: bool,
    /// Run the accepting role (advertise, notify).
    pub server: bool,
    /// Transports the adapter uses.
    pub transports: Vec<TransportKind>,
    /// Largest fragment written to the link, header included.
    pub mtu: usize,
    /// Time to wait for a discovery result per retry.
    #[serde(with = "millis", rename = "discovery_wait_ms")]
    pub discovery_wait: Duration,
    /// Number of waits before a peer is reported as not found.
    pub discovery_retries: u32,
    /// Time a session may go without progress before it is expired.
    #[serde(with = "opt_millis", rename = "operation_timeout_ms")]
    pub operation_timeout: Option<Duration>,
    /// Granularity of blocking waits (cancellation and watchdog checks).
    #[serde(with = "millis", rename = "wait_slice_ms")]
    pub wait_slice: Duration,
    /// Number of peers a multicast works on at once.
    pub multicast_fanout: usize,
    /// Ask the platform to reconnect automatically.
    pub auto_connect: bool,
    /// Worker threads for callback dispatch.
    pub task_pool_size: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Retry policy for unicast sends.
    pub retry: RetryConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            client: true,
            server: false,
            transports: vec![TransportKind::Gatt],
            mtu: btlink_types::fragment::DEFAULT_MTU,
            discovery_wait: DEFAULT_DISCOVERY_WAIT,
            discovery_retries: DEFAULT_DISCOVERY_RETRIES,
            operation_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            wait_slice: DEFAULT_WAIT_SLICE,
            multicast_fanout: 1,
            auto_connect: false,
            task_pool_size: DEFAULT_TASK_POOL_SIZE,
            event_capacity: 100,
            retry: RetryConfig::none(),
        }
    }
}

impl AdapterConfig {
    /// Short waits for responsive environments.
    pub fn fast() -> Self {
        Self {
            discovery_wait: Duration::from_millis(500),
            discovery_retries: 4,
            operation_timeout: Some(Duration::from_secs(10)),
            wait_slice: Duration::from_millis(20),
            ..Default::default()
        }
    }

    /// Very short waits for tests against a scripted platform.
    pub fn for_tests() -> Self {
        Self {
            discovery_wait: Duration::from_millis(40),
            discovery_retries: 5,
            operation_timeout: Some(Duration::from_secs(5)),
            wait_slice: Duration::from_millis(5),
            task_pool_size: 2,
            ..Default::default()
        }
    }

    /// Enable or disable the initiating role.
    #[must_use]
    pub fn client(mut self, enabled: bool) -> Self {
        self.client = enabled;
        self
    }

    /// Enable or disable the accepting role.
    #[must_use]
    pub fn server(mut self, enabled: bool) -> Self {
        self.server = enabled;
        self
    }

    /// Set the transports.
    #[must_use]
    pub fn transports(mut self, transports: impl Into<Vec<TransportKind>>) -> Self {
        self.transports = transports.into();
        self
    }

    /// Set the link MTU.
    #[must_use]
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the discovery wait per retry.
    #[must_use]
    pub fn discovery_wait(mut self, wait: Duration) -> Self {
        self.discovery_wait = wait;
        self
    }

    /// Set the number of discovery waits.
    #[must_use]
    pub fn discovery_retries(mut self, retries: u32) -> Self {
        self.discovery_retries = retries;
        self
    }

    /// Set the session watchdog timeout, `None` to disable it.
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the wait granularity.
    #[must_use]
    pub fn wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice = slice;
        self
    }

    /// Set the multicast fan-out width.
    #[must_use]
    pub fn multicast_fanout(mut self, fanout: usize) -> Self {
        self.multicast_fanout = fanout;
        self
    }

    /// Enable or disable platform auto-connect.
    #[must_use]
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Set the task pool size.
    #[must_use]
    pub fn task_pool_size(mut self, size: usize) -> Self {
        self.task_pool_size = size;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the unicast retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Total time a send waits for discovery before failing.
    #[must_use]
    pub fn discovery_budget(&self) -> Duration {
        self.discovery_wait.saturating_mul(self.discovery_retries)
    }

    /// Largest payload a single send accepts.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        MAX_DATAGRAM_LEN
    }

    /// Whether a transport is enabled.
    #[must_use]
    pub fn uses(&self, transport: TransportKind) -> bool {
        self.transports.contains(&transport)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: None,
            source: e,
        })
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: Some(path.as_ref().to_path_buf()),
            source: e,
        })
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use btlink_core::AdapterConfig;
    ///
    /// AdapterConfig::default().validate().expect("default config is valid");
    /// assert!(AdapterConfig::default().mtu(2).validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.to_string(),
                message,
            })
        };

        if !self.client && !self.server {
            push(
                "client",
                "at least one of client or server must be enabled".to_string(),
            );
        }
        if self.transports.is_empty() {
            push("transports", "at least one transport is required".to_string());
        }
        for (i, t) in self.transports.iter().enumerate() {
            if self.transports[..i].contains(t) {
                push("transports", format!("duplicate transport '{}'", t));
            }
        }
        if self.mtu < MIN_MTU {
            push(
                "mtu",
                format!("mtu {} is below the minimum of {}", self.mtu, MIN_MTU),
            );
        }
        if self.mtu > MAX_DATAGRAM_LEN {
            push(
                "mtu",
                format!("mtu {} exceeds {}", self.mtu, MAX_DATAGRAM_LEN),
            );
        }
        if self.discovery_wait.is_zero() {
            push("discovery_wait_ms", "must be greater than zero".to_string());
        }
        if self.discovery_retries == 0 {
            push("discovery_retries", "must be at least 1".to_string());
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            push(
                "operation_timeout_ms",
                "use 0 in files or None in code to disable".to_string(),
            );
        }
        if self.wait_slice.is_zero() {
            push("wait_slice_ms", "must be greater than zero".to_string());
        }
        if self.multicast_fanout == 0 {
            push("multicast_fanout", "must be at least 1".to_string());
        }
        if self.task_pool_size == 0 {
            push("task_pool_size", "must be at least 1".to_string());
        }
        if self.event_capacity == 0 {
            push("event_capacity", "must be at least 1".to_string());
        }
        if let Err(e) = self.retry.validate() {
            push("retry", e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config{}: {source}", format_path(.path))]
    Parse {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field name as written in the config file.
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" file {}", p.display()),
        None => String::new(),
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds, 0 meaning `None`.
pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        let ms = d.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        s.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = AdapterConfig::default();
        assert!(config.client);
        assert!(!config.server);
        assert_eq!(config.mtu, 20);
        assert_eq!(config.discovery_wait, Duration::from_secs(2));
        assert_eq!(config.discovery_retries, 5);
        assert_eq!(config.discovery_budget(), Duration::from_secs(10));
        assert_eq!(config.multicast_fanout, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(AdapterConfig::fast().validate().is_ok());
        assert!(AdapterConfig::for_tests().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_error() {
        let config = AdapterConfig::default()
            .client(false)
            .mtu(1)
            .multicast_fanout(0)
            .task_pool_size(0);
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"client"));
        assert!(fields.contains(&"mtu"));
        assert!(fields.contains(&"multicast_fanout"));
        assert!(fields.contains(&"task_pool_size"));
    }

    #[test]
    fn test_validate_rejects_duplicate_transport() {
        let config =
            AdapterConfig::default().transports(vec![TransportKind::Gatt, TransportKind::Gatt]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate transport"));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            server = true
            transports = ["gatt", "rfcomm"]
            mtu = 185
            discovery_wait_ms = 1500
            operation_timeout_ms = 0

            [retry]
            max_retries = 2
            initial_delay_ms = 100
        "#;
        let config = AdapterConfig::from_toml_str(toml).unwrap();
        assert!(config.client);
        assert!(config.server);
        assert_eq!(config.transports, vec![TransportKind::Gatt, TransportKind::Rfcomm]);
        assert_eq!(config.mtu, 185);
        assert_eq!(config.discovery_wait, Duration::from_millis(1500));
        assert_eq!(config.discovery_retries, 5);
        assert_eq!(config.operation_timeout, None);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = AdapterConfig::from_toml_str("mtu = \"big\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { path: None, .. }));
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let dir = std::env::temp_dir().join(format!("btlink-config-{}", std::process::id()));
        let path = dir.join("adapter.toml");
        let config = AdapterConfig::fast().server(true).mtu(64);

        config.save(&path).unwrap();
        let loaded = AdapterConfig::load_validated(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_file() {
        let err = AdapterConfig::load("/nonexistent/btlink.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
