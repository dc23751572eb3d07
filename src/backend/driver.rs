// Driver registration and external archive discovery.
//
// Drivers are published by explicit registration, not classpath scanning.
// The external loader bridges the gap for out-of-tree drivers: it walks the
// configured library directory (default `./ojp-libs`), reads each archive's
// sibling `<name>.manifest` naming the driver ids the archive provides, and
// publishes those ids from the factory table populated at startup.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{OjpError, Result};

use super::connection::{BackendConnection, ConnectionSettings};

/// A backend driver able to open connections for a URL family.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    fn id(&self) -> &str;

    /// Whether this driver understands the native URL.
    fn accepts_url(&self, url: &str) -> bool;

    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn BackendConnection>>;
}

type DriverFactory = Arc<dyn Fn() -> Arc<dyn Driver> + Send + Sync>;

/// Registry of published drivers plus the factory table used by the
/// external loader.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
    factories: RwLock<Vec<(String, DriverFactory)>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a driver instance immediately.
    pub fn register(&self, driver: Arc<dyn Driver>) {
        info!(driver = driver.id(), "registered backend driver");
        self.drivers.write().push(driver);
    }

    /// Registers a factory the external loader may publish by id.
    pub fn register_factory<F>(&self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.write().push((id.into(), Arc::new(factory)));
    }

    /// Publishes the driver a previously registered factory produces.
    pub fn publish(&self, id: &str) -> Result<()> {
        let factory = self
            .factories
            .read()
            .iter()
            .find(|(fid, _)| fid == id)
            .map(|(_, f)| Arc::clone(f));
        match factory {
            Some(f) => {
                self.register(f());
                Ok(())
            }
            None => Err(OjpError::DriverMissing(format!("no factory for driver id {id}"))),
        }
    }

    /// First registered driver accepting the URL, registration order.
    pub fn driver_for_url(&self, url: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .iter()
            .find(|d| d.accepts_url(url))
            .cloned()
            .ok_or_else(|| OjpError::DriverMissing(url.to_string()))
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.drivers.read().iter().map(|d| d.id().to_string()).collect()
    }
}

/// Extensions treated as driver archives.
const ARCHIVE_EXTENSIONS: &[&str] = &["jar", "zip", "so", "dylib", "dll"];

/// Scans `dir` for driver archives and publishes the drivers their
/// manifests name. A missing directory is not an error; a manifest naming
/// an unknown driver id is logged and skipped.
pub fn load_external_drivers(dir: &Path, registry: &DriverRegistry) -> Result<Vec<String>> {
    if !dir.is_dir() {
        info!(path = %dir.display(), "driver library directory absent, skipping scan");
        return Ok(Vec::new());
    }

    let mut published = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_archive = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ARCHIVE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_archive {
            continue;
        }

        let manifest = path.with_extension("manifest");
        if !manifest.is_file() {
            warn!(archive = %path.display(), "driver archive has no manifest, skipping");
            continue;
        }
        let body = std::fs::read_to_string(&manifest)?;
        for line in body.lines() {
            let id = line.trim();
            if id.is_empty() || id.starts_with('#') {
                continue;
            }
            match registry.publish(id) {
                Ok(()) => {
                    info!(driver = id, archive = %path.display(), "published external driver");
                    published.push(id.to_string());
                }
                Err(e) => {
                    warn!(driver = id, error = %e, "cannot publish driver from manifest");
                }
            }
        }
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDriver;
    use std::fs;

    #[test]
    fn test_register_and_lookup() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(MemoryDriver::new()));

        assert!(registry.driver_for_url("jdbc:mem:orders").is_ok());
        let err = registry.driver_for_url("jdbc:oracle:thin:@db").unwrap_err();
        assert!(matches!(err, OjpError::DriverMissing(_)));
    }

    #[test]
    fn test_publish_from_factory() {
        let registry = DriverRegistry::new();
        registry.register_factory("mem", || Arc::new(MemoryDriver::new()) as Arc<dyn Driver>);

        assert!(registry.registered_ids().is_empty());
        registry.publish("mem").unwrap();
        assert_eq!(registry.registered_ids(), vec!["mem".to_string()]);

        assert!(registry.publish("oracle").is_err());
    }

    #[test]
    fn test_external_scan_publishes_manifest_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mem-driver.jar"), b"not a real archive").unwrap();
        fs::write(dir.path().join("mem-driver.manifest"), "# test driver\nmem\n").unwrap();
        fs::write(dir.path().join("README.txt"), b"ignored").unwrap();

        let registry = DriverRegistry::new();
        registry.register_factory("mem", || Arc::new(MemoryDriver::new()) as Arc<dyn Driver>);

        let published = load_external_drivers(dir.path(), &registry).unwrap();
        assert_eq!(published, vec!["mem".to_string()]);
        assert!(registry.driver_for_url("jdbc:mem:x").is_ok());
    }

    #[test]
    fn test_external_scan_missing_dir_is_empty() {
        let registry = DriverRegistry::new();
        let published =
            load_external_drivers(Path::new("./definitely-not-a-dir-404"), &registry).unwrap();
        assert!(published.is_empty());
    }
}
