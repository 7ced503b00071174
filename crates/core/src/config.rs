//! TOML-based configuration for the sync client.
//!
//! The bearer token for the remote is never stored in the file itself; the
//! file names an environment variable (`remote.token_env`) that is resolved
//! at runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::remote::Endpoint;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Polling and logging settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Remote sync server.
    pub remote: RemoteConfig,

    /// Local storage backend and location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-entity sync endpoints.
    #[serde(default)]
    pub endpoints: EndpointsConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between sync passes in watch mode (default 60).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the sync server (e.g. `https://meldestelle.example.com`).
    pub base_url: String,

    /// Environment variable holding a bearer token, if the server needs one.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Whole-request timeout in seconds (default 15).
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_remote_timeout() -> u64 {
    15
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Which storage driver to use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Database opened in-process.
    #[default]
    Native,
    /// Database hosted on a dedicated worker thread, reached over RPC.
    Worker,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory holding the database file. Defaults to the per-user data
    /// directory (`~/.local/share/meldestelle` on Linux).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database file name (default `app.db`).
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// Upper bound on a single worker RPC call, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meldestelle")
}
fn default_file_name() -> String {
    "app.db".into()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
            file_name: default_file_name(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl StorageConfig {
    /// The fixed database location: `data_dir/file_name`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Path appended to `remote.base_url`.
    pub path: String,

    /// Query parameter that carries the cursor.
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
}

fn default_cursor_param() -> String {
    "since".into()
}

impl EndpointConfig {
    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint::new(self.path.clone(), self.cursor_param.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_ping_endpoint")]
    pub ping: EndpointConfig,
}

fn default_ping_endpoint() -> EndpointConfig {
    EndpointConfig {
        path: "/api/ping/sync".into(),
        cursor_param: default_cursor_param(),
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            ping: default_ping_endpoint(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `remote.token_env` into `remote.token`.
    ///
    /// A missing variable logs a warning but does not fail; the remote may
    /// not require authentication.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.remote.token_env {
            self.remote.token = resolve_optional_env(env_name, "remote.token_env");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "remote.base_url".into(),
                detail: "base URL must not be empty".into(),
            });
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if self.storage.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.request_timeout_ms".into(),
                detail: "request timeout must be > 0".into(),
            });
        }
        if self.storage.file_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.file_name".into(),
                detail: "database file name must not be empty".into(),
            });
        }

        let ping = &self.endpoints.ping;
        if ping.path.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "endpoints.ping.path".into(),
                detail: "endpoint path must not be empty".into(),
            });
        }
        if ping.cursor_param.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "endpoints.ping.cursor_param".into(),
                detail: "cursor parameter name must not be empty".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
poll_interval_secs = 30
log_level = "debug"

[remote]
base_url = "https://meldestelle.example.com"
token_env = "MELDESTELLE_TOKEN"
timeout_secs = 5

[storage]
backend = "worker"
data_dir = "/tmp/meldestelle"
file_name = "client.db"
request_timeout_ms = 2500

[endpoints.ping]
path = "/sync"
cursor_param = "after"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.daemon.poll_interval_secs, 30);
        assert_eq!(config.remote.base_url, "https://meldestelle.example.com");
        assert_eq!(config.remote.timeout(), Duration::from_secs(5));
        assert_eq!(config.storage.backend, StorageBackend::Worker);
        assert_eq!(config.storage.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.endpoints.ping.cursor_param, "after");
    }

    #[test]
    fn test_database_path_is_data_dir_plus_file_name() {
        let config: AppConfig = toml::from_str(sample_toml()).unwrap();
        assert_eq!(
            config.storage.database_path(),
            PathBuf::from("/tmp/meldestelle/client.db")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/sync.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[remote\nbase_url = ").unwrap();
        let result = AppConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_empty_base_url() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.remote.base_url = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "remote.base_url"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.daemon.poll_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "daemon.poll_interval_secs"
        ));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.storage.request_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "storage.request_timeout_ms"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.endpoints.ping.cursor_param = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "endpoints.ping.cursor_param"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_MELDESTELLE_TOKEN", "tok_abc");

        let toml_str = r#"
[remote]
base_url = "http://localhost:8080"
token_env = "TEST_MELDESTELLE_TOKEN"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.remote.token.as_deref(), Some("tok_abc"));

        std::env::remove_var("TEST_MELDESTELLE_TOKEN");
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[remote]
base_url = "http://localhost:8080"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.daemon.poll_interval_secs, 60);
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.remote.timeout_secs, 15);
        assert!(config.remote.token_env.is_none());
        assert_eq!(config.storage.backend, StorageBackend::Native);
        assert_eq!(config.storage.file_name, "app.db");
        assert!(config.storage.data_dir.ends_with("meldestelle"));
        assert_eq!(config.storage.request_timeout_ms, 10_000);
        assert_eq!(config.endpoints.ping.path, "/api/ping/sync");
        assert_eq!(config.endpoints.ping.cursor_param, "since");
        config.validate().unwrap();
    }
}
