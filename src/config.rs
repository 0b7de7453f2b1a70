//! Configuration loading and constants.
//!
//! Loads gateway configuration from TOML files: listener addresses, the TLS
//! allow-list and ACME policy, the `(hostname -> handler)` bindings, and
//! logging settings. `AppConfig` is the root configuration struct. Loading is
//! fatal on failure; the process never starts serving with a partial config.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "hostgate=debug,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Default number of days before expiry at which a certificate is reissued.
/// This mirrors the issuing authority's recommended renewal margin; it is
/// policy, not a correctness constant, and can be overridden in `[tls]`.
pub const DEFAULT_RENEW_BEFORE_DAYS: u32 = 30;

/// Cache-Control for static file responses. Short TTL: the trees served
/// here are whole sites, not fingerprinted assets, so "immutable" would be
/// wrong.
pub const CACHE_CONTROL_STATIC: &str = "public, max-age=300";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Listener configuration
    pub http: HttpServerConfig,
    /// TLS allow-list and ACME policy
    pub tls: TlsConfig,
    /// Host routing table: one entry per served hostname
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    /// Bind address for both listeners
    #[serde(default = "HttpServerConfig::default_bind")]
    pub bind: String,
    /// Plaintext port (scheme upgrader + ACME HTTP-01 responder)
    #[serde(default = "HttpServerConfig::default_port")]
    pub port: u16,
    /// Encrypted port (host-routed application traffic)
    #[serde(default = "HttpServerConfig::default_https_port")]
    pub https_port: u16,
}

impl HttpServerConfig {
    fn default_bind() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        80
    }

    fn default_https_port() -> u16 {
        443
    }
}

/// TLS and ACME configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Durable certificate cache directory
    #[serde(default = "TlsConfig::default_cache_dir")]
    pub cache_dir: String,
    /// Contact email registered with the ACME account
    pub contact_email: String,
    /// The fixed set of hostnames certificates will ever be provisioned for.
    /// Handshakes for any other server name are refused before the authority
    /// is contacted.
    pub allow_hosts: Vec<String>,
    /// Reissue when fewer than this many days of validity remain
    #[serde(default = "TlsConfig::default_renew_before_days")]
    pub renew_before_days: u32,
    /// Use the production ACME directory (staging otherwise)
    #[serde(default)]
    pub production: bool,
}

impl TlsConfig {
    fn default_cache_dir() -> String {
        "certs".to_string()
    }

    fn default_renew_before_days() -> u32 {
        DEFAULT_RENEW_BEFORE_DAYS
    }

    /// Case-insensitive allow-list membership check.
    pub fn is_allowed(&self, hostname: &str) -> bool {
        self.allow_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(hostname))
    }
}

/// A single hostname binding.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    pub handler: HandlerConfig,
}

/// Handler descriptor for a hostname. Sub-API mounts are wired
/// programmatically through the gateway builder rather than declared here,
/// since their construction needs collaborator-specific state.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// Serve a read-only file tree rooted at `root`
    Static { root: String },
    /// Permanent redirect to a fixed target URL
    Redirect { target: String },
    /// Forward all requests (upgrades included) to a fixed upstream
    Proxy { upstream: String },
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
    /// Append-only access log file; access logging is disabled when unset
    #[serde(default)]
    pub access_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
            access_log: None,
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde can express.
    ///
    /// Every TLS-served hostname must be allow-listed; the reverse need not
    /// hold (a hostname may be allow-listed before it has traffic).
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tls.allow_hosts.is_empty() {
            return Err(ConfigError::Validation(
                "tls.allow_hosts is empty; no hostname could complete a handshake".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            let name = host.hostname.to_ascii_lowercase();
            if !seen.insert(name.clone()) {
                // Last-write-wins is router semantics; flag it here anyway
                // since in a static config a duplicate is almost always a typo.
                tracing::warn!(hostname = %name, "Duplicate host entry; the last one wins");
            }
            if !self.tls.is_allowed(&name) {
                return Err(ConfigError::Validation(format!(
                    "host '{}' is routed over TLS but missing from tls.allow_hosts",
                    host.hostname
                )));
            }
            host.handler.validate(&host.hostname)?;
        }

        Ok(())
    }
}

impl HandlerConfig {
    fn validate(&self, hostname: &str) -> Result<(), ConfigError> {
        match self {
            HandlerConfig::Static { root } => {
                if root.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "host '{}': static handler has an empty root",
                        hostname
                    )));
                }
            }
            HandlerConfig::Redirect { target } => {
                if target.parse::<http::Uri>().is_err() {
                    return Err(ConfigError::Validation(format!(
                        "host '{}': invalid redirect target '{}'",
                        hostname, target
                    )));
                }
            }
            HandlerConfig::Proxy { upstream } => {
                let uri: http::Uri = upstream.parse().map_err(|_| {
                    ConfigError::Validation(format!(
                        "host '{}': invalid upstream '{}'",
                        hostname, upstream
                    ))
                })?;
                if uri.authority().is_none() {
                    return Err(ConfigError::Validation(format!(
                        "host '{}': upstream '{}' has no authority",
                        hostname, upstream
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
