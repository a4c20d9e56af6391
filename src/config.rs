//! Configuration management for Solegate.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables of the form `SOLEGATE__SECTION__FIELD`
//! (e.g. `SOLEGATE__RATE_LIMITING__STORE_TIMEOUT_MS=250`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use axum::http::Method;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};
use crate::ratelimit::{RouteConfig, RouteRules, RuleConfig, DEFAULT_KEY_PREFIX};

const ENV_PREFIX: &str = "SOLEGATE";

/// Main configuration for the Solegate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Rule applied when no route override matches
    #[serde(default)]
    pub default: RuleConfig,

    /// Per-route overrides, matched by path prefix
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,

    /// Methods that bypass rate limiting
    #[serde(default = "default_skip_methods")]
    pub skip_methods: Vec<String>,

    /// Honor `X-Forwarded-For` / `X-Real-IP`
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// Bound on each store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Backing store
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default: RuleConfig::default(),
            routes: default_routes(),
            skip_methods: default_skip_methods(),
            trust_proxy_headers: false,
            store_timeout_ms: default_store_timeout_ms(),
            store: StoreConfig::default(),
        }
    }
}

fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig {
            path: "/api/auth".to_string(),
            max_requests: 5,
            window_ms: 15 * 60 * 1000,
            count_only_failures: false,
        },
        RouteConfig {
            path: "/api/search".to_string(),
            max_requests: 30,
            window_ms: 60 * 1000,
            count_only_failures: true,
        },
    ]
}

fn default_skip_methods() -> Vec<String> {
    vec!["OPTIONS".to_string()]
}

fn default_store_timeout_ms() -> u64 {
    500
}

impl RateLimitingConfig {
    /// Resolve the default rule and route overrides.
    pub fn rules(&self) -> Result<RouteRules> {
        RouteRules::from_config(&self.default, &self.routes)
    }

    /// Parse the exempt methods.
    pub fn skip_methods(&self) -> Result<Vec<Method>> {
        self.skip_methods
            .iter()
            .map(|name| {
                Method::from_bytes(name.trim().to_uppercase().as_bytes())
                    .map_err(|_| GateError::Config(format!("invalid skip method '{}'", name)))
            })
            .collect()
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Memory store settings used when the configured Redis is unreachable.
    ///
    /// The staleness threshold is raised past the longest rule window so the
    /// sweep never drops a bucket that still holds in-window hits.
    pub fn fallback_memory_store(&self) -> Result<MemoryStoreConfig> {
        let longest = self.rules()?.longest_window();
        let defaults = MemoryStoreConfig::default();

        Ok(MemoryStoreConfig {
            stale_after_secs: defaults.stale_after_secs.max(longest.as_secs() + 1),
            ..defaults
        })
    }
}

/// Store selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process sliding window buckets
    Memory(MemoryStoreConfig),
    /// Shared counters in Redis
    Redis(RedisStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory(MemoryStoreConfig::default())
    }
}

/// Local store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Seconds between cleanup sweeps
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Idle seconds after which a bucket is deleted
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl MemoryStoreConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_stale_after_secs() -> u64 {
    60 * 60
}

/// Redis store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,

    /// Prefix for every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on establishing the first connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl RedisStoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

impl GateConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config: GateConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("rate_limiting.skip_methods")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: GateConfig =
            serde_yaml::from_str(contents).map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;
        let rules = limits.rules()?;
        limits.skip_methods()?;

        if limits.store_timeout_ms == 0 {
            return Err(GateError::Config(
                "store_timeout_ms must be positive".to_string(),
            ));
        }

        match &limits.store {
            StoreConfig::Memory(memory) => {
                if memory.cleanup_interval_secs == 0 {
                    return Err(GateError::Config(
                        "cleanup_interval_secs must be positive".to_string(),
                    ));
                }
                let longest = rules.longest_window();
                if memory.stale_after() <= longest {
                    return Err(GateError::Config(format!(
                        "stale_after_secs ({}) must exceed the longest window ({:?})",
                        memory.stale_after_secs, longest
                    )));
                }
            }
            StoreConfig::Redis(redis) => {
                if redis.url.trim().is_empty() {
                    return Err(GateError::Config("redis url must not be empty".to_string()));
                }
            }
        }

        Ok(())
    }
}
