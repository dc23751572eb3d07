// Server configuration.
//
// All options are dotted property names (`ojp.server.port`, ...) resolved
// from an explicit property map first, then from environment variables by
// rewriting the name: dots become underscores, the whole name is upper-cased
// (`ojp.server.port` -> `OJP_SERVER_PORT`). String values may carry
// `${...}` placeholders which are resolved before parsing.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::{OjpError, Result};

pub mod placeholder;

pub use placeholder::resolve_placeholders;

/// Default port for the proxy listener.
pub const DEFAULT_PORT: u16 = 1059;

/// Layered lookup: explicit properties first, process environment second.
#[derive(Debug, Clone, Default)]
pub struct PropertySource {
    props: HashMap<String, String>,
}

impl PropertySource {
    pub fn new(props: HashMap<String, String>) -> Self {
        Self { props }
    }

    /// Reads only the explicit property map and the environment; no file IO.
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.props.insert(name.into(), value.into());
    }

    /// Looks up a dotted name, falling back to `NAME_WITH_UNDERSCORES` in
    /// the environment.
    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(v) = self.props.get(name) {
            return Some(v.clone());
        }
        let env_name = name.replace('.', "_").to_uppercase();
        std::env::var(env_name).ok()
    }

    fn get_parsed<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => {
                let resolved = resolve_placeholders(&raw, self)?;
                resolved
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| OjpError::Config(format!("invalid value for {name}: {resolved}")))
            }
        }
    }

    fn get_string(&self, name: &str) -> Result<Option<String>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => resolve_placeholders(&raw, self).map(Some),
        }
    }

    /// Collects `prefix.<name>.<key>` properties into per-name maps.
    ///
    /// Used for named datasource sections (`ojp.datasource.orders.url`, ...).
    pub fn named_sections(&self, prefix: &str) -> HashMap<String, HashMap<String, String>> {
        let mut out: HashMap<String, HashMap<String, String>> = HashMap::new();
        let prefix = format!("{prefix}.");
        for (k, v) in &self.props {
            if let Some(rest) = k.strip_prefix(&prefix) {
                if let Some((name, key)) = rest.split_once('.') {
                    out.entry(name.to_string())
                        .or_default()
                        .insert(key.to_string(), v.clone());
                }
            }
        }
        out
    }
}

/// Session reaper knobs (`ojp.server.sessionCleanup.*`).
#[derive(Debug, Clone, Serialize)]
pub struct SessionCleanupConfig {
    pub enabled: bool,
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for SessionCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Slow-query segregation knobs (`ojp.server.slowQuerySegregation.*`).
#[derive(Debug, Clone, Serialize)]
pub struct SlowQueryConfig {
    pub enabled: bool,
    /// Share of per-pool concurrency reserved for slow operations, 0-100.
    pub slow_slot_percentage: u32,
    pub idle_timeout: Duration,
    pub slow_slot_timeout: Duration,
    pub fast_slot_timeout: Duration,
    pub update_global_avg_interval: Duration,
}

impl Default for SlowQueryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_slot_percentage: 20,
            idle_timeout: Duration::from_secs(600),
            slow_slot_timeout: Duration::from_secs(30),
            fast_slot_timeout: Duration::from_secs(10),
            update_global_avg_interval: Duration::from_secs(10),
        }
    }
}

/// Leak-detection knobs shared by every pool (`ojp.server.leakDetection.*`).
#[derive(Debug, Clone, Serialize)]
pub struct LeakDetectionConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Capture a backtrace at borrow time. Off by default; borrowing becomes
    /// measurably slower with it on.
    pub enhanced: bool,
}

impl Default for LeakDetectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5 * 60),
            enhanced: false,
        }
    }
}

/// Opt-in pool diagnostics logging (`ojp.server.diagnostics.*`).
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
        }
    }
}

/// XA pool sizing (`ojp.xa.*`).
#[derive(Debug, Clone, Serialize)]
pub struct XaPoolConfig {
    pub enabled: bool,
    pub max_pool_size: usize,
    pub min_idle: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for XaPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pool_size: 10,
            min_idle: 1,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    pub thread_pool_size: usize,
    pub max_request_size: usize,
    pub connection_idle_timeout: Duration,
    pub session_cleanup: SessionCleanupConfig,
    pub slow_query: SlowQueryConfig,
    pub leak_detection: LeakDetectionConfig,
    pub diagnostics: DiagnosticsConfig,
    pub xa: XaPoolConfig,
    /// Directory scanned for external driver archives.
    pub libs_path: String,
    /// Named datasource property sections keyed by datasource name.
    pub datasources: HashMap<String, HashMap<String, String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            thread_pool_size: num_cpus::get().max(4),
            max_request_size: 4 * 1024 * 1024,
            connection_idle_timeout: Duration::from_secs(30),
            session_cleanup: SessionCleanupConfig::default(),
            slow_query: SlowQueryConfig::default(),
            leak_detection: LeakDetectionConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            xa: XaPoolConfig::default(),
            libs_path: "./ojp-libs".to_string(),
            datasources: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Builds a configuration from a property source, falling back to
    /// defaults for every absent key.
    pub fn from_source(source: &PropertySource) -> Result<Self> {
        let mut cfg = ServerConfig::default();

        if let Some(port) = source.get_parsed::<u16>("ojp.server.port")? {
            cfg.port = port;
        }
        if let Some(n) = source.get_parsed::<usize>("ojp.server.threadPoolSize")? {
            if n == 0 {
                return Err(OjpError::Config("ojp.server.threadPoolSize must be > 0".into()));
            }
            cfg.thread_pool_size = n;
        }
        if let Some(n) = source.get_parsed::<usize>("ojp.server.maxRequestSize")? {
            cfg.max_request_size = n;
        }
        if let Some(s) = source.get_parsed::<u64>("ojp.server.connectionIdleTimeout")? {
            cfg.connection_idle_timeout = Duration::from_secs(s);
        }

        if let Some(b) = source.get_parsed::<bool>("ojp.server.sessionCleanup.enabled")? {
            cfg.session_cleanup.enabled = b;
        }
        if let Some(m) = source.get_parsed::<u64>("ojp.server.sessionCleanup.timeoutMinutes")? {
            cfg.session_cleanup.timeout = Duration::from_secs(m * 60);
        }
        if let Some(m) = source.get_parsed::<u64>("ojp.server.sessionCleanup.intervalMinutes")? {
            cfg.session_cleanup.interval = Duration::from_secs(m * 60);
        }

        if let Some(b) = source.get_parsed::<bool>("ojp.server.slowQuerySegregation.enabled")? {
            cfg.slow_query.enabled = b;
        }
        if let Some(p) =
            source.get_parsed::<u32>("ojp.server.slowQuerySegregation.slowSlotPercentage")?
        {
            if p > 100 {
                return Err(OjpError::Config(
                    "ojp.server.slowQuerySegregation.slowSlotPercentage must be 0-100".into(),
                ));
            }
            cfg.slow_query.slow_slot_percentage = p;
        }
        if let Some(s) = source.get_parsed::<u64>("ojp.server.slowQuerySegregation.idleTimeout")? {
            cfg.slow_query.idle_timeout = Duration::from_secs(s);
        }
        if let Some(s) =
            source.get_parsed::<u64>("ojp.server.slowQuerySegregation.slowSlotTimeout")?
        {
            cfg.slow_query.slow_slot_timeout = Duration::from_secs(s);
        }
        if let Some(s) =
            source.get_parsed::<u64>("ojp.server.slowQuerySegregation.fastSlotTimeout")?
        {
            cfg.slow_query.fast_slot_timeout = Duration::from_secs(s);
        }
        if let Some(s) =
            source.get_parsed::<u64>("ojp.server.slowQuerySegregation.updateGlobalAvgInterval")?
        {
            cfg.slow_query.update_global_avg_interval = Duration::from_secs(s);
        }

        if let Some(ms) = source.get_parsed::<u64>("ojp.server.leakDetection.intervalMs")? {
            cfg.leak_detection.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = source.get_parsed::<u64>("ojp.server.leakDetection.timeoutMs")? {
            cfg.leak_detection.timeout = Duration::from_millis(ms);
        }
        if let Some(b) = source.get_parsed::<bool>("ojp.server.leakDetection.enhanced")? {
            cfg.leak_detection.enhanced = b;
        }

        if let Some(b) = source.get_parsed::<bool>("ojp.server.diagnostics.enabled")? {
            cfg.diagnostics.enabled = b;
        }
        if let Some(ms) = source.get_parsed::<u64>("ojp.server.diagnostics.intervalMs")? {
            cfg.diagnostics.interval = Duration::from_millis(ms);
        }

        if let Some(b) = source.get_parsed::<bool>("ojp.xa.pool.enabled")? {
            cfg.xa.enabled = b;
        }
        if let Some(n) = source.get_parsed::<usize>("ojp.xa.maxPoolSize")? {
            cfg.xa.max_pool_size = n;
        }
        if let Some(n) = source.get_parsed::<usize>("ojp.xa.minIdle")? {
            cfg.xa.min_idle = n;
        }
        if let Some(ms) = source.get_parsed::<u64>("ojp.xa.connectionTimeoutMs")? {
            cfg.xa.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = source.get_parsed::<u64>("ojp.xa.idleTimeoutMs")? {
            cfg.xa.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = source.get_parsed::<u64>("ojp.xa.maxLifetimeMs")? {
            cfg.xa.max_lifetime = Duration::from_millis(ms);
        }

        if let Some(p) = source.get_string("ojp.libs.path")? {
            cfg.libs_path = p;
        }

        cfg.datasources = source.named_sections("ojp.datasource");

        if cfg.xa.min_idle > cfg.xa.max_pool_size {
            return Err(OjpError::Config(format!(
                "ojp.xa.minIdle ({}) exceeds ojp.xa.maxPoolSize ({})",
                cfg.xa.min_idle, cfg.xa.max_pool_size
            )));
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> PropertySource {
        let mut s = PropertySource::default();
        for (k, v) in pairs {
            s.set(*k, *v);
        }
        s
    }

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::from_source(&PropertySource::default()).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.session_cleanup.enabled);
        assert_eq!(cfg.slow_query.slow_slot_percentage, 20);
        assert_eq!(cfg.leak_detection.interval, Duration::from_secs(60));
        assert_eq!(cfg.leak_detection.timeout, Duration::from_secs(300));
        assert_eq!(cfg.libs_path, "./ojp-libs");
    }

    #[test]
    fn test_explicit_properties_win() {
        let s = source(&[
            ("ojp.server.port", "2059"),
            ("ojp.server.sessionCleanup.timeoutMinutes", "10"),
            ("ojp.xa.maxPoolSize", "25"),
        ]);
        let cfg = ServerConfig::from_source(&s).unwrap();
        assert_eq!(cfg.port, 2059);
        assert_eq!(cfg.session_cleanup.timeout, Duration::from_secs(600));
        assert_eq!(cfg.xa.max_pool_size, 25);
    }

    #[test]
    fn test_invalid_value_rejected() {
        let s = source(&[("ojp.server.port", "not-a-port")]);
        assert!(ServerConfig::from_source(&s).is_err());

        let s = source(&[("ojp.server.slowQuerySegregation.slowSlotPercentage", "150")]);
        assert!(ServerConfig::from_source(&s).is_err());
    }

    #[test]
    fn test_min_idle_bounded_by_max() {
        let s = source(&[("ojp.xa.minIdle", "50"), ("ojp.xa.maxPoolSize", "10")]);
        assert!(ServerConfig::from_source(&s).is_err());
    }

    #[test]
    fn test_named_datasource_sections() {
        let s = source(&[
            ("ojp.datasource.orders.url", "jdbc:postgresql://db1/orders"),
            ("ojp.datasource.orders.user", "orders_rw"),
            ("ojp.datasource.billing.url", "jdbc:postgresql://db2/billing"),
        ]);
        let cfg = ServerConfig::from_source(&s).unwrap();
        assert_eq!(cfg.datasources.len(), 2);
        assert_eq!(
            cfg.datasources["orders"]["url"],
            "jdbc:postgresql://db1/orders"
        );
        assert_eq!(cfg.datasources["billing"].len(), 1);
    }
}
