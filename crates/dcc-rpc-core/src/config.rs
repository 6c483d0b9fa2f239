//! Process-wide configuration.
//!
//! Two layers:
//! - [`RpcConfig`]: compile-time constants (timeouts, size limits, file
//!   names) that every component shares.
//! - [`Settings`]: the persisted config document (JSON, sections `server` /
//!   `security` / `serialization`). Every mutation through [`ConfigStore`]
//!   writes the whole document back to disk.
//!
//! [`settings()`] returns the lazily-constructed process-wide settings,
//! built once from the config file with environment-variable overrides
//! applied on top.

use crate::error::{Result, RpcError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Compile-time constants shared across the fabric.
pub struct RpcConfig;

impl RpcConfig {
    pub const APP_CONFIG_DIR_NAME: &'static str = "tp-dcc-rpc";
    pub const CONFIG_FILENAME: &'static str = "config.json";
    pub const REGISTRY_FILENAME: &'static str = "instances.json";

    /// Scheme prefix of instance addresses (`RPC:rpc.service@host:port`).
    pub const ADDRESS_SCHEME: &'static str = "RPC";
    pub const SERVICE_NAME: &'static str = "rpc.service";

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB
    pub const MAX_CONNECTIONS: usize = 32;

    /// Payloads above this many bytes are gzip-compressed on the wire.
    pub const COMPRESSION_THRESHOLD: usize = 8 * 1024;

    /// Fuel budget for one sandboxed script invocation.
    pub const SCRIPT_FUEL: u64 = 50_000_000;
}

/// `server` section of the config document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub default_port: u16,
    pub connection_timeout_secs: u64,
}

impl ServerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            default_port: 0,
            connection_timeout_secs: RpcConfig::CONNECT_TIMEOUT.as_secs(),
        }
    }
}

/// `security` section of the config document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecuritySettings {
    pub allow_env_control: bool,
    pub allow_remote_control: bool,
    pub enable_encryption: bool,
    pub require_auth: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            allow_env_control: true,
            allow_remote_control: true,
            enable_encryption: false,
            require_auth: false,
        }
    }
}

/// `serialization` section of the config document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializationSettings {
    pub format: String,
    pub compression_threshold: usize,
}

impl Default for SerializationSettings {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            compression_threshold: RpcConfig::COMPRESSION_THRESHOLD,
        }
    }
}

/// The persisted config document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub serialization: SerializationSettings,
}

impl Settings {
    /// Load settings from a JSON file, or defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| RpcError::io_with_path(e, path))?;
        serde_json::from_str(&raw).map_err(|e| RpcError::Config {
            message: format!("Invalid config document {}: {}", path.display(), e),
        })
    }

    /// Apply environment-variable overrides on top of file values.
    ///
    /// Only consulted when env control is allowed (the
    /// `TP_DCC_RPC_ALLOW_ENV_CONTROL` gate itself is always read, so a
    /// locked-down deployment can hard-disable the rest).
    pub fn apply_env_overrides(mut self) -> Self {
        self.security.allow_env_control =
            env_flag("TP_DCC_RPC_ALLOW_ENV_CONTROL", self.security.allow_env_control);
        if !self.security.allow_env_control {
            return self;
        }
        self.security.allow_remote_control = env_flag(
            "TP_DCC_RPC_ALLOW_REMOTE_CONTROL",
            self.security.allow_remote_control,
        );
        self.security.enable_encryption =
            env_flag("TP_DCC_RPC_ENABLE_ENCRYPTION", self.security.enable_encryption);
        self.security.require_auth = env_flag("TP_DCC_RPC_REQUIRE_AUTH", self.security.require_auth);
        if let Ok(format) = std::env::var("TP_DCC_RPC_SERIALIZATION_FORMAT") {
            if !format.is_empty() {
                self.serialization.format = format;
            }
        }
        self
    }
}

/// Parse a boolean environment flag; unset or unrecognized keeps `default`.
fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!("Ignoring unrecognized value for {}: {:?}", name, other);
                default
            }
        },
        Err(_) => default,
    }
}

/// Handle to the on-disk config document.
///
/// Every mutation persists the whole document back, matching the original
/// behavior (the file is small; partial updates are not worth the torn-read
/// risk).
pub struct ConfigStore {
    path: PathBuf,
    settings: Settings,
}

impl ConfigStore {
    /// Open the config document at a specific path, creating defaults in
    /// memory if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = Settings::load_or_default(&path)?;
        Ok(Self { path, settings })
    }

    /// Open the config document at the default platform location.
    pub fn open_default() -> Result<Self> {
        Self::open(paths::config_file_path()?)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mutate the settings and persist the whole document.
    pub fn update<F: FnOnce(&mut Settings)>(&mut self, f: F) -> Result<()> {
        f(&mut self.settings);
        self.save()
    }

    /// Persist the current document to disk.
    pub fn save(&self) -> Result<()> {
        let raw = serde_json::to_vec_pretty(&self.settings)?;
        paths::write_atomic(&self.path, &raw)
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Process-wide settings, constructed once on first access.
///
/// Reads the default config file (missing file means defaults) and applies
/// environment overrides. Components that need a mutable view should open a
/// [`ConfigStore`] explicitly instead.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        let loaded = paths::config_file_path()
            .and_then(|path| Settings::load_or_default(&path))
            .unwrap_or_else(|e| {
                warn!("Falling back to default settings: {}", e);
                Settings::default()
            });
        loaded.apply_env_overrides()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.default_port, 0);
        assert_eq!(settings.server.connect_timeout(), RpcConfig::CONNECT_TIMEOUT);
        assert!(settings.security.allow_remote_control);
        assert!(!settings.security.require_auth);
        assert!(!settings.security.enable_encryption);
        assert_eq!(settings.serialization.format, "json");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        let settings = Settings::load_or_default(&path).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"server": {"host": "0.0.0.0", "default_port": 9090, "connection_timeout_secs": 3}}"#,
        )
        .unwrap();

        let settings = Settings::load_or_default(&path).unwrap();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.default_port, 9090);
        // Missing sections come from Default
        assert!(settings.security.allow_remote_control);
    }

    #[test]
    fn test_invalid_document_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        let result = Settings::load_or_default(&path);
        assert!(matches!(result, Err(RpcError::Config { .. })));
    }

    #[test]
    fn test_store_update_persists_whole_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        let mut store = ConfigStore::open(&path).unwrap();
        store
            .update(|s| {
                s.server.default_port = 4000;
                s.security.require_auth = true;
            })
            .unwrap();

        let reloaded = Settings::load_or_default(&path).unwrap();
        assert_eq!(reloaded.server.default_port, 4000);
        assert!(reloaded.security.require_auth);
        // Untouched sections persisted too
        assert_eq!(reloaded.serialization.format, "json");
    }

    #[test]
    fn test_env_flag_parsing() {
        assert!(env_flag("TP_DCC_RPC_TEST_UNSET_FLAG", true));
        assert!(!env_flag("TP_DCC_RPC_TEST_UNSET_FLAG", false));
    }
}
