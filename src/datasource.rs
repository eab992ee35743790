//! DataSource abstractions for rdbc-pool
//!
//! - DataSource: hands out logical connections
//! - DataSourceFactory: builds a datasource from a string property bag
//! - NamingContext: in-process directory for looking up shared datasources
//!   by name

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Property key prefix collected (with the prefix stripped) into the
/// driver property bag by the factories.
pub const DRIVER_PROPERTY_PREFIX: &str = "driver.";

/// Something that hands out logical database connections.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Obtain a connection using the configured credentials
    async fn connection(&self) -> Result<Box<dyn Connection>>;

    /// Obtain a connection for the given credentials
    async fn connection_as(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Box<dyn Connection>>;
}

/// Builds a configured datasource from a string property bag.
pub trait DataSourceFactory: Send {
    /// Apply a property bag. Unknown keys are configuration errors.
    fn set_properties(&mut self, properties: &HashMap<String, String>) -> Result<()>;

    /// The configured datasource.
    fn data_source(&self) -> Arc<dyn DataSource>;
}

/// Parse a boolean-valued property, reporting the offending key on failure.
pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value
        .parse::<bool>()
        .map_err(|_| Error::config(format!("property '{key}' is not a boolean: '{value}'")))
}

/// Parse an integer-valued property, reporting the offending key on failure.
pub(crate) fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::config(format!("property '{key}' is not a number: '{value}'")))
}

/// Split a property bag into driver properties (prefix stripped) and the
/// remaining datasource-level entries.
pub(crate) fn split_driver_properties(
    properties: &HashMap<String, String>,
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut driver_props = HashMap::new();
    let mut rest = HashMap::new();
    for (key, value) in properties {
        if let Some(stripped) = key.strip_prefix(DRIVER_PROPERTY_PREFIX) {
            driver_props.insert(stripped.to_string(), value.clone());
        } else {
            rest.insert(key.clone(), value.clone());
        }
    }
    (driver_props, rest)
}

/// An entry bound into a naming context.
enum Binding {
    Context(Arc<NamingContext>),
    DataSource(Arc<dyn DataSource>),
}

/// In-process directory of named datasources.
///
/// Stands in for an external naming service: applications bind shared
/// datasources (or nested contexts) under well-known names and look them
/// up from configuration.
pub struct NamingContext {
    environment: RwLock<HashMap<String, String>>,
    bindings: RwLock<HashMap<String, Binding>>,
}

impl NamingContext {
    /// Create an empty, free-standing context.
    pub fn new() -> Self {
        Self {
            environment: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// The process root context, with `env` merged into its environment.
    pub fn initial(env: &HashMap<String, String>) -> &'static NamingContext {
        static ROOT: OnceLock<NamingContext> = OnceLock::new();
        let root = ROOT.get_or_init(NamingContext::new);
        if !env.is_empty() {
            let mut environment = root.environment.write().expect("naming context poisoned");
            environment.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        root
    }

    /// A snapshot of this context's environment.
    pub fn environment(&self) -> HashMap<String, String> {
        self.environment
            .read()
            .expect("naming context poisoned")
            .clone()
    }

    /// Bind a sub-context under `name`, replacing any previous binding.
    pub fn bind_context(&self, name: impl Into<String>, context: Arc<NamingContext>) {
        let mut bindings = self.bindings.write().expect("naming context poisoned");
        bindings.insert(name.into(), Binding::Context(context));
    }

    /// Bind a datasource under `name`, replacing any previous binding.
    pub fn bind_data_source(&self, name: impl Into<String>, data_source: Arc<dyn DataSource>) {
        let mut bindings = self.bindings.write().expect("naming context poisoned");
        bindings.insert(name.into(), Binding::DataSource(data_source));
    }

    /// Look up a sub-context bound under `name`.
    pub fn lookup_context(&self, name: &str) -> Result<Arc<NamingContext>> {
        let bindings = self.bindings.read().expect("naming context poisoned");
        match bindings.get(name) {
            Some(Binding::Context(ctx)) => Ok(ctx.clone()),
            Some(Binding::DataSource(_)) => Err(Error::config(format!(
                "'{name}' is bound to a datasource, not a context"
            ))),
            None => Err(Error::config(format!("nothing bound under '{name}'"))),
        }
    }

    /// Look up a datasource bound under `name`.
    pub fn lookup_data_source(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        let bindings = self.bindings.read().expect("naming context poisoned");
        match bindings.get(name) {
            Some(Binding::DataSource(ds)) => Ok(ds.clone()),
            Some(Binding::Context(_)) => Err(Error::config(format!(
                "'{name}' is bound to a context, not a datasource"
            ))),
            None => Err(Error::config(format!("nothing bound under '{name}'"))),
        }
    }
}

impl Default for NamingContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves a datasource from the naming directory.
///
/// Recognized properties:
/// - `initial_context`: name of a sub-context to resolve first
/// - `data_source`: name of the datasource binding
/// - `env.`-prefixed keys: forwarded (prefix stripped) to the root
///   context's environment
///
/// With both keys present the sub-context is resolved first and the
/// datasource is looked up within it; with only `data_source` the lookup
/// runs directly against the root.
pub struct LookupDataSourceFactory {
    data_source: Option<Arc<dyn DataSource>>,
}

impl LookupDataSourceFactory {
    /// Property naming the sub-context to resolve first
    pub const INITIAL_CONTEXT: &'static str = "initial_context";
    /// Property naming the datasource binding
    pub const DATA_SOURCE: &'static str = "data_source";
    /// Prefix of keys forwarded to the context environment
    pub const ENV_PREFIX: &'static str = "env.";

    /// Create a factory with no datasource resolved yet.
    pub fn new() -> Self {
        Self { data_source: None }
    }

    fn env_properties(properties: &HashMap<String, String>) -> HashMap<String, String> {
        properties
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(Self::ENV_PREFIX)
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect()
    }
}

impl Default for LookupDataSourceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceFactory for LookupDataSourceFactory {
    fn set_properties(&mut self, properties: &HashMap<String, String>) -> Result<()> {
        let env = Self::env_properties(properties);
        let root = NamingContext::initial(&env);

        if let (Some(ctx_name), Some(ds_name)) = (
            properties.get(Self::INITIAL_CONTEXT),
            properties.get(Self::DATA_SOURCE),
        ) {
            let ctx = root.lookup_context(ctx_name)?;
            self.data_source = Some(ctx.lookup_data_source(ds_name)?);
        } else if let Some(ds_name) = properties.get(Self::DATA_SOURCE) {
            self.data_source = Some(root.lookup_data_source(ds_name)?);
        }
        Ok(())
    }

    fn data_source(&self) -> Arc<dyn DataSource> {
        self.data_source
            .clone()
            .expect("no datasource resolved; call set_properties first")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helpers_report_key() {
        let err = parse_bool("autoCommit", "yes").unwrap_err();
        assert!(err.to_string().contains("autoCommit"));

        let err = parse_int::<u64>("poolTimeToWait", "soon").unwrap_err();
        assert!(err.to_string().contains("poolTimeToWait"));

        assert!(parse_bool("flag", "true").unwrap());
        assert_eq!(parse_int::<u32>("n", "42").unwrap(), 42);
    }

    #[test]
    fn test_split_driver_properties() {
        let mut props = HashMap::new();
        props.insert("driver.encoding".to_string(), "UTF-8".to_string());
        props.insert("driver.ssl".to_string(), "true".to_string());
        props.insert("url".to_string(), "db://localhost/app".to_string());

        let (driver_props, rest) = split_driver_properties(&props);
        assert_eq!(driver_props.get("encoding").map(String::as_str), Some("UTF-8"));
        assert_eq!(driver_props.get("ssl").map(String::as_str), Some("true"));
        assert_eq!(driver_props.len(), 2);
        assert_eq!(rest.len(), 1);
        assert!(rest.contains_key("url"));
    }

    #[test]
    fn test_naming_context_binding_mismatch() {
        let ctx = NamingContext::new();
        ctx.bind_context("databases", Arc::new(NamingContext::new()));

        assert!(ctx.lookup_data_source("databases").is_err());
        assert!(ctx.lookup_context("missing").is_err());
    }

    #[test]
    fn test_env_properties_stripped() {
        let mut props = HashMap::new();
        props.insert("env.provider".to_string(), "in-process".to_string());
        props.insert("data_source".to_string(), "main".to_string());

        let env = LookupDataSourceFactory::env_properties(&props);
        assert_eq!(env.get("provider").map(String::as_str), Some("in-process"));
        assert_eq!(env.len(), 1);
    }
}
