//! Unpooled datasource for rdbc-pool
//!
//! Creates one fresh physical connection per request and applies the
//! configured session settings (network timeout, auto-commit, isolation).
//! The pooled datasource builds on this for its physical opens.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::connection::{Connection, IsolationLevel};
use crate::datasource::{
    parse_bool, parse_int, split_driver_properties, DataSource, DataSourceFactory,
};
use crate::driver::{Driver, DriverRegistry};
use crate::error::{Error, Result};

/// Configuration for a datasource: which driver to use, where to connect,
/// and the session settings applied to every fresh connection.
#[derive(Clone, Default)]
pub struct DataSourceConfig {
    /// Registered driver name
    pub driver: String,
    /// Connection URL
    pub url: String,
    /// Default username
    pub username: Option<String>,
    /// Default password
    pub password: Option<String>,
    /// Driver-specific properties passed through on open
    pub driver_properties: HashMap<String, String>,
    /// Desired auto-commit setting, applied when it differs from the
    /// connection's current value
    pub auto_commit: Option<bool>,
    /// Default transaction isolation level
    pub default_isolation: Option<IsolationLevel>,
    /// Default network timeout
    pub default_network_timeout: Option<Duration>,
}

impl std::fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("driver", &self.driver)
            .field("url", &redact_url(&self.url))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("driver_properties", &self.driver_properties)
            .field("auto_commit", &self.auto_commit)
            .field("default_isolation", &self.default_isolation)
            .field("default_network_timeout", &self.default_network_timeout)
            .finish()
    }
}

impl DataSourceConfig {
    /// Create a configuration for a driver and URL.
    pub fn new(driver: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the default credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Add a driver property
    pub fn with_driver_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.driver_properties.insert(key.into(), value.into());
        self
    }

    /// Set the desired auto-commit setting
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = Some(auto_commit);
        self
    }

    /// Set the default isolation level
    pub fn with_default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = Some(level);
        self
    }

    /// Set the default network timeout
    pub fn with_default_network_timeout(mut self, timeout: Duration) -> Self {
        self.default_network_timeout = Some(timeout);
        self
    }
}

/// Redact the password component of a connection URL for logs and status
/// output. Unparseable URLs are masked wholesale.
pub(crate) fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

/// A datasource that opens one fresh physical connection per request.
pub struct UnpooledDataSource {
    config: RwLock<DataSourceConfig>,
}

impl UnpooledDataSource {
    /// Create an unpooled datasource from a configuration.
    pub fn new(config: DataSourceConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// A snapshot of the current configuration.
    pub fn config(&self) -> DataSourceConfig {
        self.config.read().expect("datasource config poisoned").clone()
    }

    /// Replace a configuration field in place.
    pub(crate) fn update_config(&self, apply: impl FnOnce(&mut DataSourceConfig)) {
        let mut config = self.config.write().expect("datasource config poisoned");
        apply(&mut config);
    }

    /// Open and configure a physical connection for the given credentials,
    /// falling back to the configured defaults when absent.
    pub async fn open(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Box<dyn Connection>> {
        let config = self.config();
        let mut properties = config.driver_properties.clone();
        if let Some(user) = username.or(config.username.as_deref()) {
            properties.insert("user".to_string(), user.to_string());
        }
        if let Some(pass) = password.or(config.password.as_deref()) {
            properties.insert("password".to_string(), pass.to_string());
        }

        let driver = DriverRegistry::global().get(&config.driver)?;
        let conn = driver
            .connect(&config.url, &properties)
            .await
            .map_err(|e| match e {
                e @ Error::ConnectionOpen { .. } => e,
                other => Error::ConnectionOpen {
                    message: format!("driver '{}' failed to open a connection", config.driver),
                    source: Some(Box::new(other)),
                },
            })?;

        configure_connection(conn.as_ref(), &config).await?;
        Ok(conn)
    }
}

/// Apply network timeout, auto-commit, and isolation settings to a fresh
/// connection, in that order.
async fn configure_connection(conn: &dyn Connection, config: &DataSourceConfig) -> Result<()> {
    if let Some(timeout) = config.default_network_timeout {
        conn.set_network_timeout(timeout).await?;
    }
    if let Some(auto_commit) = config.auto_commit {
        if auto_commit != conn.auto_commit().await? {
            conn.set_auto_commit(auto_commit).await?;
        }
    }
    if let Some(level) = config.default_isolation {
        conn.set_isolation(level).await?;
    }
    Ok(())
}

#[async_trait]
impl DataSource for UnpooledDataSource {
    async fn connection(&self) -> Result<Box<dyn Connection>> {
        self.open(None, None).await
    }

    async fn connection_as(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Box<dyn Connection>> {
        self.open(username, password).await
    }
}

/// Builds an [`UnpooledDataSource`] from a string property bag.
pub struct UnpooledDataSourceFactory {
    config: DataSourceConfig,
}

impl UnpooledDataSourceFactory {
    /// Create a factory with an empty configuration.
    pub fn new() -> Self {
        Self {
            config: DataSourceConfig::default(),
        }
    }

    /// Apply the datasource-level entries of a property bag to a config,
    /// returning the keys it did not recognize.
    pub(crate) fn apply_properties(
        config: &mut DataSourceConfig,
        properties: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let (driver_props, rest) = split_driver_properties(properties);
        config.driver_properties.extend(driver_props);

        let mut unknown = HashMap::new();
        for (key, value) in rest {
            match key.as_str() {
                "driver" => config.driver = value,
                "url" => config.url = value,
                "username" => config.username = Some(value),
                "password" => config.password = Some(value),
                "autoCommit" => config.auto_commit = Some(parse_bool(&key, &value)?),
                "defaultTransactionIsolationLevel" => {
                    let code = parse_int::<i32>(&key, &value)?;
                    let level = IsolationLevel::from_code(code).ok_or_else(|| {
                        Error::config(format!("unknown isolation level code: {code}"))
                    })?;
                    config.default_isolation = Some(level);
                }
                "defaultNetworkTimeout" => {
                    let millis = parse_int::<u64>(&key, &value)?;
                    config.default_network_timeout = Some(Duration::from_millis(millis));
                }
                _ => {
                    unknown.insert(key.clone(), value);
                }
            }
        }
        Ok(unknown)
    }
}

impl Default for UnpooledDataSourceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceFactory for UnpooledDataSourceFactory {
    fn set_properties(&mut self, properties: &HashMap<String, String>) -> Result<()> {
        let unknown = Self::apply_properties(&mut self.config, properties)?;
        if let Some(key) = unknown.keys().next() {
            return Err(Error::config(format!("unknown DataSource property: {key}")));
        }
        Ok(())
    }

    fn data_source(&self) -> Arc<dyn DataSource> {
        Arc::new(UnpooledDataSource::new(self.config.clone()))
    }
}
