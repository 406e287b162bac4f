//! # Configuration
//!
//! `meshlink.toml` drives the command line tool and can be loaded by library users who
//! want the same knobs. Every section is optional; missing keys fall back to the
//! defaults the connection layer uses on its own.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"      # empty string means auto-discover
//! baud_rate = 115200
//!
//! [connection]
//! config_timeout_secs = 30
//! max_retries = 5
//! retry_delay_ms = 1000
//!
//! [heartbeat]
//! enabled = true
//! interval_secs = 300
//!
//! [queue]
//! capacity = 100
//! max_window = 10
//!
//! [logging]
//! level = "info"
//! file = "meshlink.log"
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshlink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshlink.toml").await?;
//!     config.validate()?;
//!     println!("Serial Port: {}", config.serial.port);
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::meshtastic::discovery::DiscoveryConfig;
use crate::meshtastic::transport::SerialSettings;

#[cfg(feature = "meshtastic-proto")]
use crate::meshtastic::manager::{ClientSettings, ReconnectPolicy, RetryPolicy};
#[cfg(feature = "meshtastic-proto")]
use crate::meshtastic::stream::StreamSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Replaces the built-in device table and vendor lists when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub config_timeout_secs: u64,
    pub admin_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_multiplier: f64,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            config_timeout_secs: 30,
            admin_timeout_secs: 30,
            max_retries: 5,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            retry_multiplier: 2.0,
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_window: usize,
    pub ack_timeout_secs: u64,
    pub ack_required: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_window: 10,
            ack_timeout_secs: 30,
            ack_required: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Parsed level; unknown names fall back to `Info`.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the connection layer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.serial.baud_rate == 0 {
            bail!("serial.baud_rate must be greater than zero");
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            bail!("serial.data_bits must be between 5 and 8, got {}", self.serial.data_bits);
        }
        if !matches!(self.serial.stop_bits, 1 | 2) {
            bail!("serial.stop_bits must be 1 or 2, got {}", self.serial.stop_bits);
        }
        match self.serial.parity.to_ascii_lowercase().as_str() {
            "none" | "odd" | "even" => {}
            other => bail!("serial.parity must be none, odd or even, got '{}'", other),
        }

        let c = &self.connection;
        if c.config_timeout_secs == 0 || c.admin_timeout_secs == 0 {
            bail!("connection timeouts must be greater than zero");
        }
        if c.max_retries == 0 {
            bail!("connection.max_retries must be at least 1");
        }
        if c.retry_multiplier < 1.0 {
            bail!("connection.retry_multiplier must be >= 1.0");
        }
        if c.max_retry_delay_ms < c.retry_delay_ms {
            bail!("connection.max_retry_delay_ms must not be below retry_delay_ms");
        }

        if self.heartbeat.enabled && self.heartbeat.interval_secs == 0 {
            bail!("heartbeat.interval_secs must be greater than zero when enabled");
        }

        if self.queue.capacity == 0 {
            bail!("queue.capacity must be greater than zero");
        }
        if self.queue.max_window == 0 || self.queue.max_window > self.queue.capacity {
            bail!(
                "queue.max_window must be between 1 and capacity ({}), got {}",
                self.queue.capacity,
                self.queue.max_window
            );
        }

        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            bail!("logging.level '{}' is not a valid level", self.logging.level);
        }
        Ok(())
    }

    /// Empty `serial.port` means the device should be found by discovery.
    pub fn wants_discovery(&self) -> bool {
        self.serial.port.trim().is_empty()
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        self.discovery.clone().unwrap_or_default()
    }

    #[cfg(feature = "meshtastic-proto")]
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            config_timeout: Duration::from_secs(self.connection.config_timeout_secs),
            admin_timeout: Duration::from_secs(self.connection.admin_timeout_secs),
            heartbeat_interval: self
                .heartbeat
                .enabled
                .then(|| Duration::from_secs(self.heartbeat.interval_secs.max(1))),
            queue_capacity: self.queue.capacity,
            max_window: self.queue.max_window,
            ack_timeout: Duration::from_secs(self.queue.ack_timeout_secs),
            ack_required: self.queue.ack_required,
            ..StreamSettings::default()
        }
    }

    #[cfg(feature = "meshtastic-proto")]
    pub fn client_settings(&self) -> ClientSettings {
        let c = &self.connection;
        ClientSettings {
            serial: self.serial.clone(),
            // The client's HeartbeatManager is the only keep-alive sender.
            stream: StreamSettings {
                heartbeat_interval: None,
                ..self.stream_settings()
            },
            retry: RetryPolicy {
                max_attempts: c.max_retries,
                initial_delay: Duration::from_millis(c.retry_delay_ms),
                max_delay: Duration::from_millis(c.max_retry_delay_ms),
                multiplier: c.retry_multiplier,
                ..RetryPolicy::default()
            },
            reconnect: ReconnectPolicy {
                enabled: c.auto_reconnect,
                max_attempts: c.max_reconnect_attempts,
                delay: Duration::from_millis(c.reconnect_delay_ms),
                ..ReconnectPolicy::default()
            },
            heartbeat_enabled: self.heartbeat.enabled,
            heartbeat_interval: Duration::from_secs(self.heartbeat.interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat.timeout_secs),
        }
    }
}
