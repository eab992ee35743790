//! Driver gateway for rdbc-pool
//!
//! Process-wide registry mapping driver names to driver instances.
//! Registration is idempotent: a driver constructor runs at most once per
//! name per process, and every registered driver is wrapped in a
//! delegating shim before callers see it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::connection::Connection;
use crate::error::{Error, Result};

/// A database driver: the factory for physical connections.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Open a physical connection from a URL and a property bag.
    ///
    /// The property bag carries driver-specific settings plus the `user`
    /// and `password` entries overlaid by the datasource layer.
    async fn connect(
        &self,
        url: &str,
        properties: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>>;
}

/// Delegating wrapper placed around every registered driver.
///
/// Gives the registry a uniform handle type and keeps the registered
/// instance itself out of caller hands.
pub struct DriverShim {
    inner: Arc<dyn Driver>,
}

impl std::fmt::Debug for DriverShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverShim").finish_non_exhaustive()
    }
}

impl DriverShim {
    fn new(inner: Arc<dyn Driver>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Driver for DriverShim {
    async fn connect(
        &self,
        url: &str,
        properties: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>> {
        self.inner.connect(url, properties).await
    }
}

/// Process-wide map from driver name to a registered driver instance.
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<DriverShim>>>,
}

impl DriverRegistry {
    fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static DriverRegistry {
        static REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();
        REGISTRY.get_or_init(DriverRegistry::new)
    }

    /// Register a driver instance under `name`.
    ///
    /// If a driver is already registered under that name the existing
    /// instance is kept and the new one is dropped.
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        let mut drivers = self.drivers.write().expect("driver registry poisoned");
        drivers
            .entry(name.into())
            .or_insert_with(|| Arc::new(DriverShim::new(driver)));
    }

    /// Register a driver under `name`, instantiating it at most once.
    ///
    /// The constructor only runs when no driver is registered under the
    /// name. A constructor failure is reported as a driver-setup error
    /// carrying the originating cause, and nothing is registered.
    pub fn register_with<F>(&self, name: &str, constructor: F) -> Result<Arc<DriverShim>>
    where
        F: FnOnce() -> Result<Arc<dyn Driver>>,
    {
        {
            let drivers = self.drivers.read().expect("driver registry poisoned");
            if let Some(existing) = drivers.get(name) {
                return Ok(existing.clone());
            }
        }
        let mut drivers = self.drivers.write().expect("driver registry poisoned");
        // A racing registration may have won between the two locks.
        if let Some(existing) = drivers.get(name) {
            return Ok(existing.clone());
        }
        let driver = constructor().map_err(|e| Error::DriverSetup {
            message: format!("could not instantiate driver '{name}'"),
            source: Some(Box::new(e)),
        })?;
        let shim = Arc::new(DriverShim::new(driver));
        drivers.insert(name.to_string(), shim.clone());
        Ok(shim)
    }

    /// Look up a registered driver.
    pub fn get(&self, name: &str) -> Result<Arc<DriverShim>> {
        let drivers = self.drivers.read().expect("driver registry poisoned");
        drivers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::driver_setup(format!("no driver registered under '{name}'")))
    }

    /// Whether a driver is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        let drivers = self.drivers.read().expect("driver registry poisoned");
        drivers.contains_key(name)
    }
}
