//! Process configuration.
//!
//! Loaded once at startup from `EDGE_*` environment variables or from a TOML
//! file, validated, then shared read-only for the life of the process.

use crate::cache::CacheConfig;
use crate::error::RegistryError;
use crate::gateway::{EdgeToken, GatewayConfig};
use crate::health::HealthMonitorConfig;
use crate::model::{HealthCheckSpec, InstanceSpec, ServiceRoute, MAX_CACHE_TTL_SECS};
use crate::registry::{RegistryConfig, RegistryStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration validation and loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A listener address is not a socket address.
    #[error("invalid {field} '{addr}': {reason}")]
    InvalidAddr {
        field: &'static str,
        addr: String,
        reason: String,
    },

    /// Two listeners share an address.
    #[error("listeners cannot share address {addr}")]
    DuplicateAddrs { addr: String },

    #[error("invalid public hostname '{hostname}': {reason}")]
    InvalidHostname { hostname: String, reason: String },

    /// Only one of the TLS certificate and key paths was given.
    #[error("TLS requires both cert_path and key_path")]
    IncompleteTls,

    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    #[error("invalid limit: {reason}")]
    InvalidLimit { reason: String },

    #[error("invalid edge token: {reason}")]
    InvalidEdgeToken { reason: String },

    #[error("invalid default health check: {0}")]
    InvalidProbe(#[source] RegistryError),

    /// A bootstrap route or one of its instances is malformed.
    #[error("invalid bootstrap route '{name}': {source}")]
    InvalidRoute {
        name: String,
        #[source]
        source: RegistryError,
    },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Certificate and key files for TLS termination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// A route registered at startup together with its instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapRoute {
    #[serde(flatten)]
    pub route: ServiceRoute,
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
}

/// Edge gateway configuration.
///
/// # Environment Variables
///
/// * `EDGE_CONFIG_FILE` - TOML file to load instead of the variables below
/// * `EDGE_LISTEN_ADDR` - gateway address (default: "127.0.0.1:8443")
/// * `EDGE_ADMIN_ADDR` - admin API address (default: "127.0.0.1:9090")
/// * `EDGE_REDIRECT_ADDR` - optional HTTP to HTTPS redirect listener
/// * `EDGE_PUBLIC_HOSTNAME` - public hostname (default: "localhost")
/// * `EDGE_TLS_CERT_PATH`, `EDGE_TLS_KEY_PATH` - PEM files enabling TLS
/// * `EDGE_REQUEST_TIMEOUT_MS` - backend timeout (default: 30000)
/// * `EDGE_MAX_CONNECTIONS` - concurrent client connections (default: 10000)
/// * `EDGE_MAX_BODY_BYTES` - buffered request body limit (default: 10 MiB)
/// * `EDGE_TOKEN_HEADER`, `EDGE_TOKEN_VALUE` - header injected upstream
/// * `EDGE_PROBE_PATH`, `EDGE_PROBE_INTERVAL_MS`, `EDGE_PROBE_TIMEOUT_MS` - default probe
/// * `EDGE_MAX_CONCURRENT_PROBES` - probe concurrency (default: 64)
/// * `EDGE_DRAIN_TIMEOUT_MS` - drain bound (default: 30000)
/// * `EDGE_NO_HEALTHY_ALERT_AFTER_MS` - outage alert delay (default: 30000)
/// * `EDGE_CACHE_MAX_ENTRIES`, `EDGE_CACHE_DEFAULT_TTL_SECS` - response cache
///
/// TOML files use snake_case keys throughout. The `[probe]` and `[[routes]]`
/// tables also accept the camelCase keys of the admin API.
///
/// # Example
///
/// ```
/// use rust_edgemesh::config::ProxyConfig;
///
/// let config = ProxyConfig::from_env();
/// assert!(config.max_concurrent_probes > 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub admin_addr: String,
    pub redirect_addr: Option<String>,
    pub public_hostname: String,
    pub tls: Option<TlsFiles>,
    pub request_timeout_ms: u64,
    pub max_connections: usize,
    pub max_body_bytes: usize,
    pub edge_token: Option<EdgeToken>,
    /// Health check for routes that do not define one.
    pub probe: HealthCheckSpec,
    pub max_concurrent_probes: usize,
    pub drain_timeout_ms: u64,
    pub no_healthy_alert_after_ms: u64,
    pub cache: CacheConfig,
    pub routes: Vec<BootstrapRoute>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8443".to_string(),
            admin_addr: "127.0.0.1:9090".to_string(),
            redirect_addr: None,
            public_hostname: "localhost".to_string(),
            tls: None,
            request_timeout_ms: 30_000,
            max_connections: 10_000,
            max_body_bytes: 10 * 1024 * 1024,
            edge_token: None,
            probe: HealthCheckSpec::default(),
            max_concurrent_probes: 64,
            drain_timeout_ms: 30_000,
            no_healthy_alert_after_ms: 30_000,
            cache: CacheConfig::default(),
            routes: Vec::new(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl ProxyConfig {
    /// Loads configuration from `EDGE_*` environment variables with fallback
    /// to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let tls = match (env::var("EDGE_TLS_CERT_PATH").ok(), env::var("EDGE_TLS_KEY_PATH").ok()) {
            (None, None) => None,
            (cert, key) => Some(TlsFiles {
                cert_path: cert.map(PathBuf::from).unwrap_or_default(),
                key_path: key.map(PathBuf::from).unwrap_or_default(),
            }),
        };

        let edge_token = match (env::var("EDGE_TOKEN_HEADER").ok(), env::var("EDGE_TOKEN_VALUE").ok()) {
            (Some(header), Some(value)) => Some(EdgeToken { header, value }),
            _ => None,
        };

        let mut probe = defaults.probe.clone();
        if let Ok(path) = env::var("EDGE_PROBE_PATH") {
            probe.path = Some(path);
        }
        probe.interval_ms = env_parse("EDGE_PROBE_INTERVAL_MS").unwrap_or(probe.interval_ms);
        probe.timeout_ms = env_parse("EDGE_PROBE_TIMEOUT_MS").unwrap_or(probe.timeout_ms);

        let mut cache = defaults.cache.clone();
        cache.max_entries = env_parse("EDGE_CACHE_MAX_ENTRIES").unwrap_or(cache.max_entries);
        cache.default_ttl_secs =
            env_parse("EDGE_CACHE_DEFAULT_TTL_SECS").unwrap_or(cache.default_ttl_secs);

        Self {
            listen_addr: env::var("EDGE_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            admin_addr: env::var("EDGE_ADMIN_ADDR").unwrap_or(defaults.admin_addr),
            redirect_addr: env::var("EDGE_REDIRECT_ADDR").ok(),
            public_hostname: env::var("EDGE_PUBLIC_HOSTNAME").unwrap_or(defaults.public_hostname),
            tls,
            request_timeout_ms: env_parse("EDGE_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            max_connections: env_parse("EDGE_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            max_body_bytes: env_parse("EDGE_MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            edge_token,
            probe,
            max_concurrent_probes: env_parse("EDGE_MAX_CONCURRENT_PROBES")
                .unwrap_or(defaults.max_concurrent_probes),
            drain_timeout_ms: env_parse("EDGE_DRAIN_TIMEOUT_MS")
                .unwrap_or(defaults.drain_timeout_ms),
            no_healthy_alert_after_ms: env_parse("EDGE_NO_HEALTHY_ALERT_AFTER_MS")
                .unwrap_or(defaults.no_healthy_alert_after_ms),
            cache,
            routes: Vec::new(),
        }
    }

    /// Parses a TOML configuration file. Missing keys take their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&text).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Loads from the file named by `EDGE_CONFIG_FILE` if set, otherwise from
    /// the environment, and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match env::var("EDGE_CONFIG_FILE") {
            Ok(path) => Self::from_toml_file(path)?,
            Err(_) => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: unparsable or shared listener
    /// addresses, a bad hostname, half-configured TLS, out-of-range timeouts
    /// or limits, an invalid edge token or default probe, or a malformed
    /// bootstrap route.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let listeners = [
            ("listen_addr", Some(&self.listen_addr)),
            ("admin_addr", Some(&self.admin_addr)),
            ("redirect_addr", self.redirect_addr.as_ref()),
        ];
        for (field, addr) in listeners {
            let Some(addr) = addr else { continue };
            let parsed = addr
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidAddr {
                    field,
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
            if parsed.port() != 0 && !seen.insert(parsed) {
                return Err(ConfigError::DuplicateAddrs { addr: addr.clone() });
            }
        }

        self.validate_hostname()?;

        if let Some(tls) = &self.tls {
            if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
                return Err(ConfigError::IncompleteTls);
            }
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout {
                reason: "request timeout must be greater than zero".to_string(),
            });
        }
        if self.request_timeout_ms > 3_600_000 {
            return Err(ConfigError::InvalidTimeout {
                reason: "request timeout must not exceed 1 hour".to_string(),
            });
        }
        if self.drain_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout {
                reason: "drain timeout must be greater than zero".to_string(),
            });
        }

        for (name, value) in [
            ("max_connections", self.max_connections),
            ("max_body_bytes", self.max_body_bytes),
            ("max_concurrent_probes", self.max_concurrent_probes),
            ("cache.max_entries", self.cache.max_entries),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidLimit {
                    reason: format!("{} must be greater than zero", name),
                });
            }
        }

        if self.cache.default_ttl_secs > MAX_CACHE_TTL_SECS {
            return Err(ConfigError::InvalidLimit {
                reason: format!(
                    "cache.default_ttl_secs must not exceed {}",
                    MAX_CACHE_TTL_SECS
                ),
            });
        }

        if let Some(token) = &self.edge_token {
            http::HeaderName::from_bytes(token.header.as_bytes()).map_err(|e| {
                ConfigError::InvalidEdgeToken {
                    reason: format!("header '{}': {}", token.header, e),
                }
            })?;
            if token.value.is_empty() || http::HeaderValue::from_str(&token.value).is_err() {
                return Err(ConfigError::InvalidEdgeToken {
                    reason: "value must be a non-empty header value".to_string(),
                });
            }
        }

        self.probe.validate().map_err(ConfigError::InvalidProbe)?;

        let mut names = HashSet::new();
        for bootstrap in &self.routes {
            let name = bootstrap.route.name.clone();
            let invalid = |source| ConfigError::InvalidRoute {
                name: name.clone(),
                source,
            };
            bootstrap.route.validate().map_err(invalid)?;
            if !names.insert(name.clone()) {
                return Err(invalid(RegistryError::DuplicateName { name: name.clone() }));
            }
            for instance in &bootstrap.instances {
                instance.validate().map_err(invalid)?;
            }
        }

        Ok(())
    }

    fn validate_hostname(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidHostname {
            hostname: self.public_hostname.clone(),
            reason,
        };
        if self.public_hostname.is_empty() || self.public_hostname.contains(['/', ':', '@']) {
            return Err(invalid("must be a bare hostname".to_string()));
        }
        let url = url::Url::parse(&format!("https://{}/", self.public_hostname))
            .map_err(|e| invalid(e.to_string()))?;
        match url.host_str() {
            Some(host) if host.eq_ignore_ascii_case(&self.public_hostname) => Ok(()),
            _ => Err(invalid("must be a bare hostname".to_string())),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn no_healthy_alert_after(&self) -> Duration {
        Duration::from_millis(self.no_healthy_alert_after_ms)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            drain_timeout: self.drain_timeout(),
            default_health_check: self.probe.clone(),
            ..RegistryConfig::default()
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            request_timeout: self.request_timeout(),
            max_body_bytes: self.max_body_bytes,
            edge_token: self.edge_token.clone(),
            forwarded_proto: if self.tls.is_some() { "https" } else { "http" },
        }
    }

    pub fn health_monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            max_concurrent_probes: self.max_concurrent_probes,
            ..HealthMonitorConfig::default()
        }
    }

    /// Registers the bootstrap routes, each followed by its instances.
    pub fn register_routes(&self, registry: &RegistryStore) -> Result<(), RegistryError> {
        for bootstrap in &self.routes {
            let outcome = registry.upsert_route(bootstrap.route.clone())?;
            for instance in &bootstrap.instances {
                registry.add_instance(&bootstrap.route.name, instance.clone())?;
            }
            info!(
                route = %bootstrap.route.name,
                id = %outcome.id,
                instances = bootstrap.instances.len(),
                "bootstrap route registered"
            );
        }
        Ok(())
    }
}
