//! Server Configuration
//!
//! Centralized configuration for the API server, the wait protocol, the
//! conflict retrier and the allocation bus, with environment variable
//! overrides.

use std::str::FromStr;
use std::time::Duration;

/// Default keep-alive cadence on wait streams
pub const DEFAULT_RESPONSE_INTERVAL: Duration = Duration::from_secs(5);

/// Default fallback store poll cadence on wait streams
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Backing store selection (env: STORE_BACKEND)
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StoreBackend {
    Etcd,
    /// Single-process store and bus, for local development
    Memory,
}

/// Wait protocol timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Timer tick on a blocked stream; a keep-alive goes out on every tick
    pub response_interval: Duration,
    /// Minimum time between fallback store re-checks
    pub check_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            response_interval: DEFAULT_RESPONSE_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl WaitConfig {
    /// Build from raw values; zero intervals fall back to the defaults.
    pub fn new(response_interval: Duration, check_interval: Duration) -> Self {
        Self {
            response_interval: non_zero_or(response_interval, DEFAULT_RESPONSE_INTERVAL),
            check_interval: non_zero_or(check_interval, DEFAULT_CHECK_INTERVAL),
        }
    }

    /// Build from signed second counts as read from the environment.
    /// Missing, zero or negative values fall back to the defaults.
    pub fn from_secs(response_secs: Option<i64>, check_secs: Option<i64>) -> Self {
        Self {
            response_interval: positive_secs_or(response_secs, DEFAULT_RESPONSE_INTERVAL),
            check_interval: positive_secs_or(check_secs, DEFAULT_CHECK_INTERVAL),
        }
    }
}

/// Bounded conflict retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Jitter applied to every delay (0.0 disables it)
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            randomization_factor: 0.5,
        }
    }
}

/// Allocation bus settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub allocation_topic: String,
    /// Concurrent handler invocations per subscription
    pub handler_concurrency: usize,
    /// A handler running longer than this counts as failed for that delivery
    pub handler_timeout: Duration,
    /// Messages older than this are dropped (and expire from etcd)
    pub message_ttl: Duration,
    /// Delay before re-establishing a broken etcd watch
    pub reconnect_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            allocation_topic: "machine.allocation".to_string(),
            handler_concurrency: 10,
            handler_timeout: Duration::from_secs(10),
            message_ttl: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Top-level server configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address (env: BIND_ADDR)
    pub bind_addr: String,

    /// Replica identifier, also the prefix of the bus subscription name (env: NODE_ID)
    pub node_id: String,

    /// Store and bus backend (env: STORE_BACKEND)
    pub store_backend: StoreBackend,

    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub etcd_endpoints: Vec<String>,

    /// Wait intervals (env: WAIT_RESPONSE_INTERVAL_SECS, WAIT_CHECK_INTERVAL_SECS)
    pub wait: WaitConfig,

    /// Conflict retry (env: CONFLICT_RETRY_MAX_ATTEMPTS)
    pub retry: RetryConfig,

    pub bus: BusConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            node_id: format!("metal-api-{}", uuid::Uuid::new_v4()),
            store_backend: StoreBackend::Etcd,
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            wait: WaitConfig::default(),
            retry: RetryConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bind_addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = bind_addr;
        }

        if let Ok(node_id) = std::env::var("NODE_ID") {
            config.node_id = node_id;
        }

        if let Some(backend) = env_parse::<StoreBackend>("STORE_BACKEND") {
            config.store_backend = backend;
        }

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.etcd_endpoints = endpoints.split(',').map(String::from).collect();
        }

        config.wait = WaitConfig::from_secs(
            env_parse("WAIT_RESPONSE_INTERVAL_SECS"),
            env_parse("WAIT_CHECK_INTERVAL_SECS"),
        );

        if let Some(attempts) = env_parse::<u32>("CONFLICT_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts.max(1);
        }

        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn non_zero_or(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

fn positive_secs_or(secs: Option<i64>, default: Duration) -> Duration {
    match secs {
        Some(s) if s > 0 => Duration::from_secs(s as u64),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_config_defaults_for_non_positive() {
        let config = WaitConfig::from_secs(Some(0), Some(-5));
        assert_eq!(config.response_interval, DEFAULT_RESPONSE_INTERVAL);
        assert_eq!(config.check_interval, DEFAULT_CHECK_INTERVAL);

        let config = WaitConfig::from_secs(None, None);
        assert_eq!(config, WaitConfig::default());
    }

    #[test]
    fn test_wait_config_keeps_positive_values() {
        let config = WaitConfig::from_secs(Some(2), Some(30));
        assert_eq!(config.response_interval, Duration::from_secs(2));
        assert_eq!(config.check_interval, Duration::from_secs(30));

        let config = WaitConfig::new(Duration::ZERO, Duration::from_millis(200));
        assert_eq!(config.response_interval, DEFAULT_RESPONSE_INTERVAL);
        assert_eq!(config.check_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("etcd".parse::<StoreBackend>().unwrap(), StoreBackend::Etcd);
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert!(config.node_id.starts_with("metal-api-"));
        assert_eq!(config.bus.allocation_topic, "machine.allocation");
        assert_eq!(config.retry.max_attempts, 10);
    }
}
