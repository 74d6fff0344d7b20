use serde::Deserialize;
use std::time::Duration;

/// Configuration for the connection manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Number of shards the connection space is partitioned into
    pub shards: usize,
    /// Initial capacity hint for each shard's connection map
    pub initial_shard_capacity: usize,
    /// Per-connection settings
    pub connection: ConnectionConfig,
    /// Presence registry backend
    pub registry: RegistryKind,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            initial_shard_capacity: 64,
            connection: ConnectionConfig::default(),
            registry: RegistryKind::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Parse a TOML document and validate the result.
    ///
    /// Missing keys fall back to their defaults; durations use humantime
    /// syntax (`"10s"`, `"500ms"`).
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the manager relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::InvalidShards(
                "shards cannot be 0".to_string(),
            ));
        }

        if self.connection.queue_capacity == 0 {
            return Err(ConfigError::InvalidConnection(
                "queue_capacity cannot be 0".to_string(),
            ));
        }

        if self.connection.write_timeout.is_zero() {
            return Err(ConfigError::InvalidConnection(
                "write_timeout must be > 0".to_string(),
            ));
        }

        if let Some(idle) = self.connection.idle_timeout {
            if idle <= self.connection.write_timeout {
                return Err(ConfigError::InvalidConnection(
                    "idle_timeout must be > write_timeout".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Builder for ManagerConfig
#[derive(Debug, Clone, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set the number of shards
    pub fn shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    /// Set the initial per-shard capacity hint
    pub fn initial_shard_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_shard_capacity = capacity;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set the outbound queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.connection.queue_capacity = capacity;
        self
    }

    /// Set the per-write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.write_timeout = timeout;
        self
    }

    /// Close connections that have been silent for this long
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.idle_timeout = Some(timeout);
        self
    }

    /// Set the registry backend
    pub fn registry(mut self, kind: RegistryKind) -> Self {
        self.config.registry = kind;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g., shards = 0).
    pub fn build(self) -> Result<ManagerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid shard configuration
    #[error("Invalid shard configuration: {0}")]
    InvalidShards(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Configuration document could not be parsed
    #[error("Invalid configuration document: {0}")]
    Parse(String),
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Capacity of the bounded outbound message queue
    pub queue_capacity: usize,
    /// Deadline for a single write, pongs included
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Deadline for the best-effort close frame sent on shutdown
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
    /// Close the connection when neither a ping nor data arrived for this long
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            write_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
            idle_timeout: None, // Liveness is client-driven by default
        }
    }
}

/// Presence registry backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// In-process store
    #[default]
    Memory,
}
