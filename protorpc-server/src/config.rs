//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PROTORPC_CONFIG)
//! 3. Environment variables

use crate::strategy::{BrokerStrategy, PooledStrategy};
use protorpc_protocol::{frame::tcp_endpoint, validate_endpoint, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and concurrency configuration.
    pub server: ServerSection,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PROTORPC_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))
    }

    fn from_yaml(content: &str) -> Result<Self, String> {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    fn apply_env_overrides(&mut self) {
        self.server.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.server.bind)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if self.server.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "server.pool_size must be at least 1".to_string(),
            ));
        }
        if self.server.workers == 0 {
            return Err(ConfigError::ValidationError(
                "server.workers must be at least 1".to_string(),
            ));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "server.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which server concurrency architecture to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Bounded task pool on one socket.
    #[default]
    Pooled,
    /// Broker fanning out to long-lived worker threads.
    Broker,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pooled" | "pool" => Ok(StrategyKind::Pooled),
            "broker" => Ok(StrategyKind::Broker),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Listener and concurrency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Endpoint to bind, `tcp://host:port` or `ipc://path`.
    pub bind: String,
    pub strategy: StrategyKind,
    /// Maximum in-flight calls for the pooled strategy.
    pub pool_size: usize,
    /// Worker thread count for the broker strategy.
    pub workers: usize,
    /// How often broker workers re-check the stop flag.
    pub poll_interval_ms: u64,
    /// Upper bound on joining broker workers at shutdown.
    pub join_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: tcp_endpoint("127.0.0.1", DEFAULT_PORT),
            strategy: StrategyKind::Pooled,
            pool_size: 100,
            workers: 4,
            poll_interval_ms: 1000,
            join_timeout_ms: 5000,
        }
    }
}

impl ServerSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("PROTORPC_BIND") {
            self.bind = bind;
        }

        if let Ok(strategy) = std::env::var("PROTORPC_STRATEGY") {
            match strategy.parse() {
                Ok(kind) => self.strategy = kind,
                Err(e) => tracing::warn!("Ignoring PROTORPC_STRATEGY: {}", e),
            }
        }

        if let Ok(size) = std::env::var("PROTORPC_POOL_SIZE") {
            if let Ok(n) = size.parse() {
                self.pool_size = n;
            }
        }

        if let Ok(workers) = std::env::var("PROTORPC_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.workers = n;
            }
        }

        if let Ok(interval) = std::env::var("PROTORPC_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.poll_interval_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("PROTORPC_JOIN_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.join_timeout_ms = ms;
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn pooled_strategy(&self) -> PooledStrategy {
        PooledStrategy::new(self.pool_size)
    }

    pub fn broker_strategy(&self) -> BrokerStrategy {
        BrokerStrategy::new(self.workers)
            .with_poll_interval(self.poll_interval())
            .with_join_timeout(self.join_timeout())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("PROTORPC_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("PROTORPC_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes `SocketAddr` as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
