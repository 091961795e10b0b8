//! Pool configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Connection pool configuration.
///
/// Durations are written in milliseconds when loaded from JSON:
///
/// ```json
/// { "max_open": 20, "max_lifetime_ms": 1800000, "acquire_timeout_ms": 5000 }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of open connections (leased + idle)
    pub max_open: usize,
    /// Maximum number of idle connections kept for reuse
    pub max_idle: usize,
    /// Connections opened eagerly by `Pool::connect`
    pub min_idle: usize,
    /// Connections older than this are closed instead of reused
    #[serde(rename = "max_lifetime_ms", with = "millis_opt")]
    pub max_lifetime: Option<Duration>,
    /// Idle connections unused for this long are closed
    #[serde(rename = "idle_timeout_ms", with = "millis_opt")]
    pub idle_timeout: Option<Duration>,
    /// How long `acquire` waits for a free slot
    #[serde(rename = "acquire_timeout_ms", with = "millis")]
    pub acquire_timeout: Duration,
    /// Period of the background reaper; `None` disables it
    #[serde(rename = "reap_interval_ms", with = "millis_opt")]
    pub reap_interval: Option<Duration>,
    /// Statement cache capacity per connection; 0 disables caching
    pub statement_cache_capacity: usize,
    /// Ping idle connections before handing them out
    pub test_on_acquire: bool,
    /// Log the SQL of every prepare, exec and query at debug level
    pub log_queries: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 2,
            min_idle: 0,
            max_lifetime: None,
            idle_timeout: None,
            acquire_timeout: Duration::from_secs(30),
            reap_interval: None,
            statement_cache_capacity: 100,
            test_on_acquire: false,
            log_queries: false,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open == 0 {
            return Err(Error::Config("max_open must be at least 1".to_string()));
        }
        if self.min_idle > self.max_open {
            return Err(Error::Config(format!(
                "min_idle ({}) exceeds max_open ({})",
                self.min_idle, self.max_open
            )));
        }
        Ok(())
    }

    /// Set the maximum number of open connections.
    pub fn max_open(mut self, max: usize) -> Self {
        self.max_open = max;
        self
    }

    /// Set the maximum number of idle connections.
    pub fn max_idle(mut self, max: usize) -> Self {
        self.max_idle = max;
        self
    }

    /// Set the number of connections opened eagerly.
    pub fn min_idle(mut self, min: usize) -> Self {
        self.min_idle = min;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    /// Set the statement cache capacity per connection.
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn test_on_acquire(mut self, enabled: bool) -> Self {
        self.test_on_acquire = enabled;
        self
    }

    /// Trace query text on every connection of the pool.
    pub fn log_queries(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new()
            .max_open(20)
            .max_idle(5)
            .max_lifetime(Duration::from_secs(60))
            .statement_cache_capacity(200);

        assert_eq!(config.max_open, 20);
        assert_eq!(config.max_idle, 5);
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(60)));
        assert_eq!(config.statement_cache_capacity, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            PoolConfig::from_json(r#"{"max_open": 4, "max_lifetime_ms": 1500}"#).unwrap();
        assert_eq!(config.max_open, 4);
        assert_eq!(config.max_lifetime, Some(Duration::from_millis(1500)));
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, None);
        assert!(!config.log_queries);
    }

    #[test]
    fn test_from_json_log_queries() {
        let config = PoolConfig::from_json(r#"{"log_queries": true}"#).unwrap();
        assert!(config.log_queries);
        assert_eq!(config, PoolConfig::new().log_queries(true));
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            PoolConfig::from_json(r#"{"max_open": 0}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PoolConfig::from_json(r#"{"max_open": 1, "min_idle": 3}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PoolConfig::from_json(r#"{"max_connections": 3}"#),
            Err(Error::Config(_))
        ));
    }
}
