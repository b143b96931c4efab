//! Configuration management for Floodgate.
//!
//! Configuration is read from an optional YAML file and then overlaid with
//! `FLOODGATE__SECTION__KEY` environment variables. Every rate limit policy is
//! validated while loading, so a service that starts has a usable policy table.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{CategoryDefaults, PathOverride};

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Paths that skip admission control entirely (exact match)
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bypass_paths: default_bypass_paths(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_bypass_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Shared Redis store. When absent, counters live in process memory.
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Namespace prepended to every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the memory store drops expired entries (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis: None,
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

/// Redis connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Logical database; kept apart from the application's own data
    #[serde(default = "default_redis_db")]
    pub db: i64,

    #[serde(default)]
    pub password: Option<String>,

    /// Bound on the startup connection and probe
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Bound on each command; exceeding it fails the check open
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: default_redis_db(),
            password: None,
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_db() -> i64 {
    1
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_command_timeout() -> u64 {
    250
}

impl RedisConfig {
    /// Connection URL understood by the Redis client.
    pub fn connection_url(&self) -> String {
        match self.password {
            Some(ref password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path substring overrides, checked in order before the categories
    #[serde(default)]
    pub overrides: Vec<PathOverride>,

    /// Policies for the built-in endpoint categories
    #[serde(default)]
    pub categories: CategoryDefaults,
}

impl FloodgateConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FLOODGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: FloodgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that deserialization alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(rule) = self
            .rate_limiting
            .overrides
            .iter()
            .find(|rule| rule.pattern.is_empty())
        {
            return Err(FloodgateError::Config(format!(
                "override pattern must not be empty (limit {:?})",
                rule.limit
            )));
        }

        if let Some(ref redis) = self.store.redis {
            if redis.command_timeout_ms == 0 || redis.connect_timeout_ms == 0 {
                return Err(FloodgateError::Config(
                    "Redis timeouts must be positive".to_string(),
                ));
            }
        }

        if let Some(path) = self.server.bypass_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(FloodgateError::Config(format!(
                "bypass path {:?} must start with '/'",
                path
            )));
        }

        Ok(())
    }
}
