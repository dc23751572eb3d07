// Typed XA datasource construction.
//
// Vendors disagree on property names (URL vs url, user vs username, port as
// int vs string). Instead of reflective setter search, each driver id maps
// to a typed factory that reads the canonical config map and knows its own
// spelling; `XaDataSourceConfig::first_of` covers the remaining aliases.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{OjpError, Result};

use super::connection::XaDataSource;

/// Canonical config keys for an XA datasource.
pub const KEY_CLASS_NAME: &str = "xa.datasource.className";
pub const KEY_URL: &str = "xa.url";
pub const KEY_USERNAME: &str = "xa.username";
pub const KEY_PASSWORD: &str = "xa.password";
pub const KEY_MAX_POOL_SIZE: &str = "xa.maxPoolSize";
pub const KEY_MIN_IDLE: &str = "xa.minIdle";
pub const KEY_CONNECTION_TIMEOUT_MS: &str = "xa.connectionTimeoutMs";
pub const KEY_IDLE_TIMEOUT_MS: &str = "xa.idleTimeoutMs";
pub const KEY_MAX_LIFETIME_MS: &str = "xa.maxLifetimeMs";

/// Canonical configuration map handed to adapter factories.
#[derive(Debug, Clone, Default)]
pub struct XaDataSourceConfig {
    entries: HashMap<String, String>,
}

impl XaDataSourceConfig {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// First present value among alias spellings.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| OjpError::Config(format!("missing XA datasource key: {key}")))
    }

    /// Integer value regardless of whether the vendor wrote it as a number
    /// or a quoted string.
    pub fn int(&self, keys: &[&str]) -> Result<Option<u64>> {
        match self.first_of(keys) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .trim_matches('"')
                .parse::<u64>()
                .map(Some)
                .map_err(|_| OjpError::Config(format!("not an integer: {raw}"))),
        }
    }

    pub fn millis(&self, keys: &[&str]) -> Result<Option<Duration>> {
        Ok(self.int(keys)?.map(Duration::from_millis))
    }
}

type XaDataSourceFactory =
    Arc<dyn Fn(&XaDataSourceConfig) -> Result<Arc<dyn XaDataSource>> + Send + Sync>;

/// Per-driver-id XA datasource factories.
#[derive(Default)]
pub struct XaAdapterRegistry {
    factories: RwLock<Vec<(String, XaDataSourceFactory)>>,
}

impl XaAdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, driver_id: impl Into<String>, factory: F)
    where
        F: Fn(&XaDataSourceConfig) -> Result<Arc<dyn XaDataSource>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .push((driver_id.into(), Arc::new(factory)));
    }

    /// Builds a datasource for the configured class name.
    ///
    /// Exact factory-id match on `xa.datasource.className` wins; otherwise
    /// any factory whose id appears in the class name or the URL scheme is
    /// probed, registration order.
    pub fn create(&self, config: &XaDataSourceConfig) -> Result<Arc<dyn XaDataSource>> {
        let class_name = config.require(KEY_CLASS_NAME)?.to_string();
        let url = config
            .first_of(&[KEY_URL, "xa.URL", "xa.Url"])
            .unwrap_or("")
            .to_ascii_lowercase();

        let factories = self.factories.read();
        if let Some((_, f)) = factories.iter().find(|(id, _)| *id == class_name) {
            return f(config);
        }
        for (id, f) in factories.iter() {
            if class_name.to_ascii_lowercase().contains(&id.to_ascii_lowercase())
                || url.contains(&id.to_ascii_lowercase())
            {
                return f(config);
            }
        }
        Err(OjpError::DriverMissing(format!(
            "no XA datasource adapter for {class_name}"
        )))
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.factories.read().iter().map(|(id, _)| id.clone()).collect()
    }
}
