//! Application configuration.
//!
//! Settings come from an optional JSON file, overlaid by command line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ordertap_core::{AppProfile, AppRegistry, FieldTable};
use ordertap_proxy::{DomainAllowList, UpstreamTrust, DEFAULT_CAPTURE_LIMIT, DEFAULT_PROXY_PORT};

/// Config file name inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Source app reported for orders captured on `extra_domains`.
pub const CUSTOM_APP: &str = "Custom";

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No home directory; pass --ca-dir")]
    NoHomeDir,

    #[error("Invalid upstream roots: {0}")]
    UpstreamRoots(#[from] ordertap_proxy::ProxyError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Project directories (`~/.config/ordertap`, `~/.local/share/ordertap`, ...).
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "ordertap", "Ordertap")
}

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Listen port on 127.0.0.1.
    pub port: u16,
    /// Root CA directory. Defaults to `<data dir>/ca`.
    pub ca_dir: Option<PathBuf>,
    /// Domains intercepted in addition to the bundled apps. Their orders are
    /// read with generic field names and reported as [`CUSTOM_APP`].
    pub extra_domains: Vec<String>,
    /// Idle timeout per connection, in seconds.
    pub idle_timeout_secs: u64,
    /// Largest response body kept for parsing, in bytes.
    pub capture_limit: usize,
    /// PEM file of extra roots trusted for origins.
    pub upstream_roots: Option<PathBuf>,
    /// Skip origin certificate verification.
    pub accept_invalid_upstream_certs: bool,
    /// Order ingestion server. Orders are only logged when unset.
    pub server_url: Option<String>,
    /// Mask credentials and card numbers in submitted raw bodies.
    pub redact: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROXY_PORT,
            ca_dir: None,
            extra_domains: Vec::new(),
            idle_timeout_secs: 30,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
            upstream_roots: None,
            accept_invalid_upstream_certs: false,
            server_url: None,
            redact: true,
        }
    }
}

impl AppConfig {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Loads configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// read if present and defaults are used otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Reads a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies command line overrides.
    pub fn apply(&mut self, overrides: &RunOverrides) {
        if let Some(port) = overrides.port {
            self.port = port;
        }
        self.extra_domains.extend(overrides.domains.iter().cloned());
        if let Some(secs) = overrides.idle_timeout {
            self.idle_timeout_secs = secs;
        }
        if let Some(limit) = overrides.capture_limit {
            self.capture_limit = limit;
        }
        if let Some(roots) = &overrides.upstream_roots {
            self.upstream_roots = Some(roots.clone());
        }
        if overrides.insecure_upstream {
            self.accept_invalid_upstream_certs = true;
        }
        if let Some(url) = &overrides.server_url {
            self.server_url = Some(url.clone());
        }
        if overrides.no_redact {
            self.redact = false;
        }
    }

    /// Resolves the CA directory.
    pub fn ca_dir(&self) -> Result<PathBuf> {
        match &self.ca_dir {
            Some(dir) => Ok(dir.clone()),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().join("ca"))
                .ok_or(ConfigError::NoHomeDir),
        }
    }

    /// Bundled apps, plus a generic profile for `extra_domains`.
    ///
    /// Bundled profiles come first, so they win for overlapping domains.
    pub fn registry(&self) -> AppRegistry {
        let registry = AppRegistry::with_defaults();
        if self.extra_domains.is_empty() {
            return registry;
        }
        let domains: Vec<&str> = self.extra_domains.iter().map(String::as_str).collect();
        registry.with_app(AppProfile::new(CUSTOM_APP, &domains, FieldTable::generic()))
    }

    /// Every domain of [`registry`](Self::registry).
    pub fn allow_list(&self) -> DomainAllowList {
        DomainAllowList::from_registry(&self.registry())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Origin verification mode. Accept-any wins over extra roots.
    pub fn upstream_trust(&self) -> Result<UpstreamTrust> {
        if self.accept_invalid_upstream_certs {
            return Ok(UpstreamTrust::AcceptAny);
        }
        match &self.upstream_roots {
            Some(path) => Ok(UpstreamTrust::with_pem_file(path)?),
            None => Ok(UpstreamTrust::WebPki),
        }
    }
}

/// Flags of `ordertap run` that override the config file.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunOverrides {
    /// Listen port on 127.0.0.1
    #[arg(long)]
    pub port: Option<u16>,

    /// Extra domain to intercept (repeatable)
    #[arg(long = "domain", value_name = "DOMAIN")]
    pub domains: Vec<String>,

    /// Idle timeout per connection, in seconds
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Largest response body kept for parsing, in bytes
    #[arg(long, value_name = "BYTES")]
    pub capture_limit: Option<usize>,

    /// PEM file of extra roots trusted for origins
    #[arg(long, value_name = "FILE")]
    pub upstream_roots: Option<PathBuf>,

    /// Do not verify origin certificates
    #[arg(long)]
    pub insecure_upstream: bool,

    /// Order ingestion server URL
    #[arg(long, value_name = "URL")]
    pub server_url: Option<String>,

    /// Submit raw bodies without redaction
    #[arg(long)]
    pub no_redact: bool,
}
