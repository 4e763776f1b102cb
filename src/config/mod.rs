//! Configuration Module
//!
//! TOML-based configuration for rosmq with support for:
//! - Logging level
//! - Per-session limits (inflight window, offline queue, QoS 2 backlog)
//! - Session parameters (keepalive, sweep interval)
//! - Protocol feature limits (max QoS, payload size)
//! - Environment variable overrides (ROSMQ_* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerOptions;
use crate::protocol::QoS;
use crate::session::SessionLimits;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Period of the stats log line in seconds (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    30
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stats_interval: default_stats_interval(),
        }
    }
}

/// Per-session limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum in-flight messages per client (QoS 1/2)
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Maximum queued messages per offline or stalled client
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Maximum pending PUBREL for QoS 2
    #[serde(default = "default_max_awaiting_rel")]
    pub max_awaiting_rel: usize,
    /// Seconds before retrying unacked messages
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Re-sends before an unacked message is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-connection outbound message channel capacity
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
}

fn default_max_inflight() -> usize {
    20
}
fn default_max_queued_messages() -> usize {
    100
}
fn default_max_awaiting_rel() -> usize {
    100
}
fn default_retry_interval() -> u64 {
    20
}
fn default_max_retries() -> u32 {
    5
}
fn default_outbound_channel_capacity() -> usize {
    256
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            max_queued_messages: default_max_queued_messages(),
            max_awaiting_rel: default_max_awaiting_rel(),
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
            outbound_channel_capacity: default_outbound_channel_capacity(),
        }
    }
}

impl LimitsConfig {
    pub fn retry_interval_duration(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default keep alive in seconds
    #[serde(default = "default_keep_alive")]
    pub default_keep_alive: u16,
    /// Keepalive sweep / retry scan interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

fn default_keep_alive() -> u16 {
    60
}
fn default_sweep_interval() -> u64 {
    1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: default_keep_alive(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl SessionConfig {
    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

/// Protocol feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Maximum accepted payload size in bytes
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

fn default_max_qos() -> u8 {
    2
}
fn default_max_payload_size() -> usize {
    1024 * 1024
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `ROSMQ__` prefix with double underscores for nesting:
    ///    - `ROSMQ__LIMITS__MAX_INFLIGHT=50` overrides `limits.max_inflight`
    ///    - `ROSMQ__LOG__LEVEL=debug` overrides `log.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("log.stats_interval", 30)?
            .set_default("limits.max_inflight", 20)?
            .set_default("limits.max_queued_messages", 100)?
            .set_default("limits.max_awaiting_rel", 100)?
            .set_default("limits.retry_interval", 20)?
            .set_default("limits.max_retries", 5)?
            .set_default("limits.outbound_channel_capacity", 256)?
            .set_default("session.default_keep_alive", 60)?
            .set_default("session.sweep_interval", 1)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.max_payload_size", 1024 * 1024)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("ROSMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.limits.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "max_inflight must be at least 1".to_string(),
            ));
        }
        if self.limits.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "outbound_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.session.sweep_interval == 0 {
            return Err(ConfigError::Validation(
                "sweep_interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// Derive the broker engine tunables from this configuration.
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            limits: SessionLimits {
                max_inflight: self.limits.max_inflight,
                max_queued: self.limits.max_queued_messages,
                max_awaiting_rel: self.limits.max_awaiting_rel,
            },
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            max_payload_size: self.mqtt.max_payload_size,
            retry_interval: self.limits.retry_interval_duration(),
            max_retries: self.limits.max_retries,
            maintenance_interval: self.session.sweep_interval_duration(),
            outbound_channel_size: self.limits.outbound_channel_capacity,
        }
    }
}
