//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.orgcheck/config.toml` (user)
//! 3. `/etc/orgcheck/config.toml` (system)
//!
//! Secrets are loaded separately with mandatory permission checks:
//! 1. `~/.orgcheck/secrets.toml` (user, must be 0600)
//! 2. `/etc/orgcheck/secrets.toml` (system, must be 0600)
//!
//! with `SF_ACCESS_TOKEN` as the last resort.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheConfig, DataCache, FileStorage};
use crate::gateway::{DEFAULT_API_VERSION, GatewayBuilder, QuerySettings, SalesforceGateway};
use crate::gateway::rate_guard::RateGuardConfig;
use crate::{OrgCheckError, Result};

/// Environment variable holding the access token when no secrets file has one.
pub const ACCESS_TOKEN_ENV_VAR: &str = "SF_ACCESS_TOKEN";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub salesforce: SalesforceConfig,
    #[serde(default)]
    pub rate_guard: RateGuardConfig,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub cache: CacheSection,
}

/// Org connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SalesforceConfig {
    /// Instance URL, e.g. `https://example.my.salesforce.com`.
    #[serde(default)]
    pub instance_url: Option<String>,
    /// REST API version (default: 61.0).
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for SalesforceConfig {
    fn default() -> Self {
        Self {
            instance_url: None,
            api_version: default_api_version(),
        }
    }
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

/// Persistent cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Key namespace (default: OrgCheck).
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Entry time-to-live in seconds (default: 86400).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Storage directory (default: `~/.cache/orgcheck`).
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            ttl_secs: default_ttl_secs(),
            directory: None,
        }
    }
}

fn default_namespace() -> String {
    "OrgCheck".to_string()
}

fn default_ttl_secs() -> u64 {
    24 * 3600
}

impl CacheSection {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .namespace(self.namespace.clone())
            .ttl(Duration::from_secs(self.ttl_secs))
    }

    /// Open a file-backed cache in the configured directory.
    pub fn open(&self) -> Result<DataCache> {
        let dir = self
            .directory
            .clone()
            .unwrap_or_else(FileStorage::default_dir);
        let storage = FileStorage::open(dir)?;
        Ok(DataCache::new(Arc::new(storage), self.cache_config()))
    }
}

/// Secrets (access token).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.orgcheck/config.toml`
    /// 3. `/etc/orgcheck/config.toml`
    ///
    /// Without an explicit path and with no file present, every section
    /// takes its defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Config::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            OrgCheckError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            OrgCheckError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(OrgCheckError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".orgcheck").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        let system_config = PathBuf::from("/etc/orgcheck/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Builder preloaded with these settings and an HTTP connection.
    pub fn gateway_builder(&self, secrets: &Secrets) -> Result<GatewayBuilder> {
        let instance_url = self.salesforce.instance_url.clone().ok_or_else(|| {
            OrgCheckError::Configuration("salesforce.instance_url is not set".to_string())
        })?;
        let token = secrets.access_token().ok_or_else(|| {
            OrgCheckError::Configuration(format!(
                "no access token: set access_token in secrets.toml or {ACCESS_TOKEN_ENV_VAR}"
            ))
        })?;
        Ok(SalesforceGateway::builder()
            .http(instance_url, token)
            .api_version(self.salesforce.api_version.clone())
            .rate_guard(self.rate_guard.clone())
            .query_settings(self.query))
    }
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Returns empty secrets if no file exists.
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".orgcheck").join("secrets.toml");
            if user_secrets.exists() {
                Self::check_permissions(&user_secrets)?;
                return Self::load_from_file(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/orgcheck/secrets.toml");
        if system_secrets.exists() {
            Self::check_permissions(&system_secrets)?;
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            OrgCheckError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            OrgCheckError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            OrgCheckError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(OrgCheckError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// Access token from the secrets file, falling back to `SF_ACCESS_TOKEN`.
    pub fn access_token(&self) -> Option<String> {
        self.access_token
            .clone()
            .filter(|token| !token.is_empty())
            .or_else(|| std::env::var(ACCESS_TOKEN_ENV_VAR).ok())
    }
}
