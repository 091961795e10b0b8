//! Driver registry.
//!
//! Maps driver names to factories. The process-wide registry behind
//! [`register`] and [`open`] is what applications normally use; a local
//! [`Registry`] is handy for isolation in tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::PoolConfig;
use crate::driver::{DataSource, Driver};
use crate::error::{Error, Result};
use crate::pool::Pool;

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// A set of named drivers.
#[derive(Default)]
pub struct Registry {
    drivers: RwLock<BTreeMap<String, Arc<dyn Driver>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under `name`. Names are never replaced.
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>) -> Result<()> {
        let mut drivers = self.drivers.write();
        if drivers.contains_key(name) {
            return Err(Error::DuplicateDriver(name.to_string()));
        }
        drivers.insert(name.to_string(), driver);
        debug!(driver = name, "registered driver");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDriver(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.read().contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn drivers(&self) -> Vec<String> {
        self.drivers.read().keys().cloned().collect()
    }

    /// Create a pool with the default configuration. No connection is opened.
    pub fn open(&self, name: &str, source: impl Into<DataSource>) -> Result<Pool> {
        self.open_with(name, source, PoolConfig::default())
    }

    pub fn open_with(
        &self,
        name: &str,
        source: impl Into<DataSource>,
        config: PoolConfig,
    ) -> Result<Pool> {
        Pool::open(self.get(name)?, source, config)
    }

    /// Create a pool and pre-create its `min_idle` connections.
    pub async fn connect(
        &self,
        name: &str,
        source: impl Into<DataSource>,
        config: PoolConfig,
    ) -> Result<Pool> {
        let driver = self.get(name)?;
        Pool::connect(driver, source, config).await
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("drivers", &self.drivers())
            .finish()
    }
}

/// Register a driver in the process-wide registry.
pub fn register(name: &str, driver: Arc<dyn Driver>) -> Result<()> {
    GLOBAL.register(name, driver)
}

/// Open a pool on a driver from the process-wide registry.
pub fn open(name: &str, source: impl Into<DataSource>) -> Result<Pool> {
    GLOBAL.open(name, source)
}

pub fn open_with(name: &str, source: impl Into<DataSource>, config: PoolConfig) -> Result<Pool> {
    GLOBAL.open_with(name, source, config)
}

pub async fn connect(name: &str, source: impl Into<DataSource>, config: PoolConfig) -> Result<Pool> {
    GLOBAL.connect(name, source, config).await
}

/// Names registered in the process-wide registry.
pub fn drivers() -> Vec<String> {
    GLOBAL.drivers()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDriver, MemoryServer};

    fn driver() -> Arc<dyn Driver> {
        Arc::new(MemoryDriver::new(MemoryServer::new()))
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        registry.register("mem", driver()).unwrap();
        assert!(matches!(
            registry.register("mem", driver()),
            Err(Error::DuplicateDriver(name)) if name == "mem"
        ));
        assert_eq!(registry.drivers(), vec!["mem".to_string()]);
    }

    #[test]
    fn test_unknown_driver() {
        let registry = Registry::new();
        assert!(matches!(
            registry.open("nope", "x"),
            Err(Error::UnknownDriver(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_drivers_sorted() {
        let registry = Registry::new();
        registry.register("zeta", driver()).unwrap();
        registry.register("alpha", driver()).unwrap();
        assert_eq!(registry.drivers(), vec!["alpha".to_string(), "zeta".to_string()]);
        assert!(registry.contains("alpha"));
    }

    #[tokio::test]
    async fn test_open_is_lazy() {
        let server = MemoryServer::new();
        let registry = Registry::new();
        registry
            .register("mem", Arc::new(MemoryDriver::new(server.clone())))
            .unwrap();

        let pool = registry.open("mem", "mem://test").unwrap();
        assert_eq!(pool.stats().open, 0);
        assert_eq!(server.connects(), 0);
        assert_eq!(pool.data_source().as_str(), "mem://test");
    }

    #[test]
    fn test_global_registry() {
        register("registry-test-global", driver()).unwrap();
        assert!(drivers().contains(&"registry-test-global".to_string()));
        assert!(matches!(
            register("registry-test-global", driver()),
            Err(Error::DuplicateDriver(_))
        ));
    }
}
