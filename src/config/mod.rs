//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`RABBITMQ_*`, `ARCA_RPC_*`)
//! - CLI arguments (for the binary)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Request-reply settings
    #[serde(default)]
    pub rpc: RpcConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| RpcError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| RpcError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`$XDG_CONFIG_HOME/arca-rpc/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("arca-rpc").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment variable overrides on top of this config
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("RABBITMQ_HOST") {
            self.broker.host = host;
        }
        if let Ok(port) = std::env::var("RABBITMQ_PORT") {
            if let Ok(port) = port.parse() {
                self.broker.port = port;
            }
        }
        if let Ok(user) = std::env::var("RABBITMQ_USER") {
            self.broker.username = user;
        }
        if let Ok(password) = std::env::var("RABBITMQ_PASSWORD") {
            self.broker.password = password;
        }

        if let Ok(queue) = std::env::var("ARCA_RPC_QUEUE") {
            self.rpc.request_queue = queue;
        }
        if let Ok(val) = std::env::var("ARCA_RPC_TIMEOUT") {
            if let Ok(val) = val.parse() {
                self.rpc.timeout_secs = val;
            }
        }

        self
    }

    /// Reject values that would make a transaction hang or never connect
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.is_empty() {
            return Err(RpcError::Config("broker.host must not be empty".to_string()));
        }
        if self.broker.port == 0 {
            return Err(RpcError::Config("broker.port must be non-zero".to_string()));
        }
        if self.broker.connection_attempts == 0 {
            return Err(RpcError::Config(
                "broker.connection_attempts must be at least 1".to_string(),
            ));
        }
        if self.rpc.request_queue.is_empty() {
            return Err(RpcError::Config("rpc.request_queue must not be empty".to_string()));
        }
        if self.rpc.timeout_secs == 0 {
            return Err(RpcError::Config("rpc.timeout_secs must be positive".to_string()));
        }
        if self.rpc.wait == WaitMode::Poll && self.rpc.poll_interval_ms == 0 {
            return Err(RpcError::Config(
                "rpc.poll_interval_ms must be positive when wait = \"poll\"".to_string(),
            ));
        }
        Ok(())
    }
}

/// Broker connection configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Login user
    pub username: String,

    /// Login password
    #[serde(skip_serializing)]
    pub password: String,

    /// Heartbeat interval in seconds (0 disables heartbeats)
    pub heartbeat_secs: u16,

    /// Maximum channels per connection
    pub channel_max: u16,

    /// Connection handshake timeout in milliseconds
    pub connection_timeout_ms: u64,

    /// Accepted authentication mechanisms, in preference order
    pub auth_mechanisms: Vec<String>,

    /// Virtual host namespace
    pub vhost: String,

    /// Attempts made to establish the connection
    pub connection_attempts: u32,

    /// Delay between connection attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat_secs: 60,
            channel_max: 5,
            connection_timeout_ms: 10_000,
            auth_mechanisms: vec!["AMQPLAIN".to_string(), "PLAIN".to_string()],
            vhost: "/".to_string(),
            connection_attempts: 1,
            retry_delay_ms: 1_000,
        }
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("channel_max", &self.channel_max)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("auth_mechanisms", &self.auth_mechanisms)
            .field("vhost", &self.vhost)
            .field("connection_attempts", &self.connection_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .finish()
    }
}

impl BrokerConfig {
    /// `host:port` pair
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection URI with the password redacted, safe for logs
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}:***@{}/{}",
            self.username,
            self.address(),
            self.vhost.trim_start_matches('/')
        )
    }

    /// Handshake timeout
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Delay between connection attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// How the caller suspends while waiting for the correlated reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Suspend on the reply slot directly
    #[default]
    Event,
    /// Re-check the reply slot every `poll_interval_ms`
    Poll,
}

/// Request-reply configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Queue the remote service consumes requests from
    pub request_queue: String,

    /// Default reply timeout in seconds
    pub timeout_secs: u64,

    /// Wait strategy
    pub wait: WaitMode,

    /// Poll interval in milliseconds (only used with `wait = "poll"`)
    pub poll_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_queue: crate::DEFAULT_REQUEST_QUEUE.to_string(),
            timeout_secs: 30,
            wait: WaitMode::Event,
            poll_interval_ms: 1_000,
        }
    }
}

impl RpcConfig {
    /// Default reply timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
