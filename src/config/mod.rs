//! Application configuration.
//!
//! Aggregates configuration for all components into a single Config struct
//! loaded from an optional YAML file plus environment variables with the
//! `SMSGW` prefix (`__` separator), e.g. `SMSGW__STORAGE__URL`.

use std::time::Duration;

use serde::Deserialize;

use crate::model::SmsType;

/// Environment variable controlling the tracing filter.
pub const LOG_ENV_VAR: &str = "SMSGW_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("missing required configuration value: {0}")]
    Missing(&'static str),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Database configuration.
    pub storage: StorageConfig,
    /// Message bus configuration.
    pub messaging: MessagingConfig,
    /// Outbox publisher pool configuration.
    pub publisher: PublisherConfig,
    /// Operator dispatch and circuit breaker configuration.
    pub dispatcher: DispatcherConfig,
    /// Queue consumer configuration.
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. Environment variables with `SMSGW` prefix
    ///
    /// Missing required values (database URL, bus URI) are a startup-time
    /// fatal: this returns an error and the binary exits.
    pub fn load() -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let config = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new("config.yaml", FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix("SMSGW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all required values are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.url.is_empty() {
            return Err(ConfigError::Missing("storage.url (SMSGW__STORAGE__URL)"));
        }
        if self.messaging.uri.is_empty() {
            return Err(ConfigError::Missing("messaging.uri (SMSGW__MESSAGING__URI)"));
        }
        Ok(())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API binds to.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// PostgreSQL connection URL. Required.
    pub url: String,
    /// Connection pool size.
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
        }
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection URI (e.g. amqp://localhost:5672). Required.
    pub uri: String,
    /// Direct exchange SMS events are published to.
    pub exchange: String,
    /// Queue for express traffic; routing key equals the queue name.
    pub express_queue: String,
    /// Queue for normal traffic; routing key equals the queue name.
    pub normal_queue: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            exchange: "sms_exchange".to_string(),
            express_queue: "sms_express".to_string(),
            normal_queue: "sms_normal".to_string(),
        }
    }
}

impl MessagingConfig {
    /// Queue (and routing key) for a delivery class.
    pub fn queue_for(&self, kind: SmsType) -> &str {
        match kind {
            SmsType::Express => &self.express_queue,
            SmsType::Normal => &self.normal_queue,
        }
    }
}

/// Outbox publisher pool configuration.
///
/// The two pools have disjoint priority windows: the high pool claims rows
/// with `priority >= 5`, the low pool everything below. Neither steals from
/// the other, so a backlog in one class cannot starve the other.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub high_workers: usize,
    pub low_workers: usize,
    pub high_batch: i64,
    pub low_batch: i64,
    pub high_idle_ms: u64,
    pub low_idle_ms: u64,
    /// Attempts before an outbox row is failed terminally and refunded.
    pub max_attempts: i32,
    /// Lease after which a `processing` row is considered orphaned.
    pub reap_lease_secs: u64,
    /// Interval between reaper passes.
    pub reap_interval_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            high_workers: 4,
            low_workers: 2,
            high_batch: 200,
            low_batch: 100,
            high_idle_ms: 80,
            low_idle_ms: 250,
            max_attempts: 10,
            reap_lease_secs: 60,
            reap_interval_secs: 30,
        }
    }
}

impl PublisherConfig {
    pub fn high_idle(&self) -> Duration {
        Duration::from_millis(self.high_idle_ms)
    }

    pub fn low_idle(&self) -> Duration {
        Duration::from_millis(self.low_idle_ms)
    }

    pub fn reap_lease(&self) -> Duration {
        Duration::from_secs(self.reap_lease_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Operator dispatch and circuit breaker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Hard per-attempt timeout for an operator send.
    pub send_timeout_ms: u64,
    /// Retries after the first attempt (2 means up to 3 attempts).
    pub max_retries: u32,
    /// First retry delay; doubles on each attempt.
    pub initial_backoff_ms: u64,
    /// Consecutive failures before the primary breaker opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the breaker closes.
    pub success_threshold: u32,
    /// How long the breaker stays open before trialing again.
    pub open_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 2_000,
            max_retries: 2,
            initial_backoff_ms: 200,
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Queue consumer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Worker slots per queue.
    pub workers: usize,
    /// Channel prefetch; 0 leaves the broker default.
    pub prefetch: u16,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            prefetch: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.publisher.high_workers, 4);
        assert_eq!(config.publisher.low_workers, 2);
        assert_eq!(config.publisher.max_attempts, 10);
        assert_eq!(config.dispatcher.max_retries, 2);
        assert_eq!(config.consumer.workers, 10);
    }

    #[test]
    fn test_validate_requires_storage_and_messaging() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing(name)) if name.starts_with("storage.url")
        ));

        let mut config = Config::default();
        config.storage.url = "postgres://localhost/sms".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing(name)) if name.starts_with("messaging.uri")
        ));

        config.messaging.uri = "amqp://localhost:5672".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_for_type() {
        let messaging = MessagingConfig::default();
        assert_eq!(messaging.queue_for(SmsType::Express), "sms_express");
        assert_eq!(messaging.queue_for(SmsType::Normal), "sms_normal");
    }
}
