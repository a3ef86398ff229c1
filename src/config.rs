//! Configuration management for Turnstile.
//!
//! Settings are resolved once at startup: defaults, then an optional YAML
//! file, then environment overrides. The result is validated and handed to
//! the rate limiter and the HTTP layer by reference; nothing re-reads the
//! environment afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Prefix of the environment variables carrying per-token limit overrides.
const TOKEN_LIMIT_PREFIX: &str = "TOKEN_LIMIT_";

/// Longest accepted block duration or window: one year.
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// What the dispatch layer does with a request when the counter store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request
    Open,
    /// Reject the request
    #[default]
    Closed,
}

impl std::str::FromStr for FailurePolicy {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            other => Err(TurnstileError::Config(format!(
                "unknown failure policy '{}', expected 'open' or 'closed'",
                other
            ))),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per window for identifiers without an override
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Cooldown applied once an identifier exceeds its limit, in seconds
    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,

    /// Length of the counting window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Behaviour when the counter store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Per-identifier limit overrides
    #[serde(default)]
    pub token_limits: HashMap<String, u64>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            block_duration_secs: default_block_duration_secs(),
            window_ms: default_window_ms(),
            failure_policy: FailurePolicy::default(),
            token_limits: HashMap::new(),
        }
    }
}

fn default_limit() -> u64 {
    10
}

fn default_block_duration_secs() -> u64 {
    60
}

fn default_window_ms() -> u64 {
    1000
}

impl RateLimitingConfig {
    /// The cooldown as a duration.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    /// The counting window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Which counter store backs the rate limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server
    #[default]
    Redis,
    /// In-process store, only meaningful for a single instance
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(TurnstileError::Config(format!(
                "unknown store backend '{}', expected 'redis' or 'memory'",
                other
            ))),
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Redis per-decision response timeout in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// How often the in-memory store evicts expired entries, in seconds
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_response_timeout_ms() -> u64 {
    2000
}

fn default_purge_interval_secs() -> u64 {
    30
}

impl Settings {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Resolve the full configuration: file (if any), then the process
    /// environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(unicode_vars(std::env::vars_os()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay environment variables onto these settings.
    ///
    /// Recognised variables: `DEFAULT_LIMIT`, `BLOCK_DURATION` (seconds),
    /// `REDIS_HOST`, `PORT`, `FAILURE_POLICY`, `STORE_BACKEND` and
    /// `TOKEN_LIMIT_<token>`. Token names keep their case.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "DEFAULT_LIMIT" => {
                    self.rate_limiting.default_limit = parse_number(&key, &value)?;
                }
                "BLOCK_DURATION" => {
                    self.rate_limiting.block_duration_secs = parse_number(&key, &value)?;
                }
                "REDIS_HOST" => {
                    self.store.redis_url = redis_url_from_host(&value);
                }
                "PORT" => {
                    let port: u16 = value.trim().parse().map_err(|_| {
                        TurnstileError::Config(format!("PORT must be a port number, got '{}'", value))
                    })?;
                    self.server.listen_addr.set_port(port);
                }
                "FAILURE_POLICY" => {
                    self.rate_limiting.failure_policy = value.parse()?;
                }
                "STORE_BACKEND" => {
                    self.store.backend = value.parse()?;
                }
                _ => {
                    if let Some(token) = key.strip_prefix(TOKEN_LIMIT_PREFIX) {
                        if token.is_empty() {
                            continue;
                        }
                        let limit = parse_number(&key, &value)?;
                        self.rate_limiting.token_limits.insert(token.to_string(), limit);
                    }
                }
            }
        }
        Ok(())
    }

    /// Reject settings the rate limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.block_duration_secs == 0 {
            return Err(TurnstileError::Config(
                "block_duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.block_duration_secs > MAX_TTL_SECS {
            return Err(TurnstileError::Config(format!(
                "block_duration_secs must be at most {}",
                MAX_TTL_SECS
            )));
        }
        if self.rate_limiting.window_ms == 0 {
            return Err(TurnstileError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.window_ms > MAX_TTL_SECS * 1000 {
            return Err(TurnstileError::Config(format!(
                "window_ms must be at most {}",
                MAX_TTL_SECS * 1000
            )));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(TurnstileError::Config("redis_url must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Keep only variables whose name and value are valid unicode; none of the
/// others can be ours.
fn unicode_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        TurnstileError::Config(format!(
            "{} must be a non-negative integer, got '{}'",
            key, value
        ))
    })
}

/// `REDIS_HOST` is usually a bare `host:port`; accept full URLs as well.
fn redis_url_from_host(host: &str) -> String {
    let host = host.trim();
    if host.contains("://") {
        host.to_string()
    } else {
        format!("redis://{}", host)
    }
}
