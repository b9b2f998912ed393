//! Client configuration.

use crate::errors::RfbClientError;
use rfb_cache::engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete client configuration (TOML-backed).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Connection settings.
    pub connection: ConnectionConfig,
    /// Cache subsystem settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server hostname or IP address.
    #[serde(default)]
    pub host: String,
    /// Server port (typically 5900 + display number).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whether to request a shared session.
    #[serde(default = "default_true")]
    pub shared: bool,
    /// Connection timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_port() -> u16 {
    5900
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            shared: true,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Cache subsystem configuration.
///
/// `persistent_cache` enables the disk-backed protocol (-321);
/// `content_cache` enables the session-only alias (-320). With only the
/// alias enabled the engine still runs but never touches disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the disk-backed persistent cache protocol.
    #[serde(default = "default_true")]
    pub persistent_cache: bool,
    /// Enable the session-only content cache alias.
    #[serde(default = "default_true")]
    pub content_cache: bool,
    /// In-memory ARC budget in MiB.
    #[serde(default = "default_cache_size_mb")]
    pub size_mb: usize,
    /// On-disk budget in MiB; 0 means twice the memory budget.
    #[serde(default)]
    pub disk_size_mb: usize,
    /// Target shard file size in MiB.
    #[serde(default = "default_shard_size_mb")]
    pub shard_size_mb: usize,
    /// Cache directory override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Enable bounding-box whole-region lookups (server side honours the
    /// same option; the client carries it for the options dialog).
    #[serde(default = "default_true")]
    pub bbox_cache: bool,
    /// Rectangles below this pixel area are never cached.
    #[serde(default = "default_min_rect_area")]
    pub min_rect_area: u64,
}

fn default_cache_size_mb() -> usize {
    2048
}

fn default_shard_size_mb() -> usize {
    64
}

fn default_min_rect_area() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistent_cache: true,
            content_cache: true,
            size_mb: default_cache_size_mb(),
            disk_size_mb: 0,
            shard_size_mb: default_shard_size_mb(),
            path: None,
            bbox_cache: true,
            min_rect_area: default_min_rect_area(),
        }
    }
}

impl CacheConfig {
    /// Whether any cache pseudo-encoding should be advertised.
    pub fn any_cache_enabled(&self) -> bool {
        self.persistent_cache || self.content_cache
    }

    /// Build the engine configuration. Disk persistence follows the
    /// `persistent_cache` flag alone; the session-only alias keeps the
    /// engine memory-only.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_memory_mb: self.size_mb,
            max_disk_mb: self.disk_size_mb,
            shard_size_mb: self.shard_size_mb,
            cache_dir: self.path.clone(),
            persistence_enabled: self.persistent_cache,
        }
    }
}

impl Config {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse a TOML configuration string.
    pub fn from_toml(input: &str) -> Result<Self, RfbClientError> {
        let config: Config =
            toml::from_str(input).map_err(|e| RfbClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), RfbClientError> {
        if self.connection.host.is_empty() {
            return Err(RfbClientError::Config("Host cannot be empty".to_string()));
        }
        if self.connection.port == 0 {
            return Err(RfbClientError::Config("Port cannot be 0".to_string()));
        }
        if self.cache.any_cache_enabled() && self.cache.size_mb == 0 {
            return Err(RfbClientError::Config(
                "Cache size cannot be 0 when a cache protocol is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// The connection timeout duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.connection.timeout_ms)
    }
}

/// Builder for creating a `Config`.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets the server hostname or IP address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.connection.host = host.into();
        self
    }

    /// Sets the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.connection.port = port;
        self
    }

    /// Enables or disables the persistent (disk-backed) cache.
    #[must_use]
    pub fn persistent_cache(mut self, enabled: bool) -> Self {
        self.config.cache.persistent_cache = enabled;
        self
    }

    /// Enables or disables the session-only content cache alias.
    #[must_use]
    pub fn content_cache(mut self, enabled: bool) -> Self {
        self.config.cache.content_cache = enabled;
        self
    }

    /// Overrides the cache directory.
    #[must_use]
    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache.path = Some(path.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<Config, RfbClientError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_defaults() {
        let config = Config::builder().host("localhost").port(5901).build().unwrap();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 5901);

        assert!(config.cache.persistent_cache);
        assert!(config.cache.content_cache);
        assert_eq!(config.cache.size_mb, 2048);
        assert_eq!(config.cache.disk_size_mb, 0);
        assert_eq!(config.cache.shard_size_mb, 64);
        assert!(config.cache.bbox_cache);
        assert_eq!(config.cache.min_rect_area, 10_000);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(Config::default().validate().is_err()); // empty host

        let mut config = Config::builder().host("h").build().unwrap();
        config.connection.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::builder().host("h").build().unwrap();
        config.cache.size_mb = 0;
        assert!(config.validate().is_err());

        // Zero size is fine when both cache protocols are off.
        config.cache.persistent_cache = false;
        config.cache.content_cache = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_round_trip() {
        let input = r#"
            [connection]
            host = "vnc.example"
            port = 5902

            [cache]
            persistent_cache = false
            content_cache = true
            size_mb = 512
            path = "/var/tmp/vnc-cache"
        "#;
        let config = Config::from_toml(input).unwrap();
        assert_eq!(config.connection.host, "vnc.example");
        assert!(!config.cache.persistent_cache);
        assert!(config.cache.content_cache);
        assert_eq!(config.cache.size_mb, 512);
        assert_eq!(config.cache.path.as_deref().unwrap().to_str(), Some("/var/tmp/vnc-cache"));

        // Session-only alias: engine runs without disk persistence.
        let engine = config.cache.engine_config();
        assert!(!engine.persistence_enabled);
        assert_eq!(engine.max_memory_mb, 512);
    }

    #[test]
    fn engine_config_carries_disk_budgets() {
        let mut config = Config::builder().host("h").build().unwrap();
        config.cache.disk_size_mb = 4096;
        config.cache.shard_size_mb = 16;
        let engine = config.cache.engine_config();
        assert_eq!(engine.max_disk_mb, 4096);
        assert_eq!(engine.shard_size_mb, 16);
        assert!(engine.persistence_enabled);
    }
}
