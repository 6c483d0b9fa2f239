//! Well-known file locations and atomic file replacement.
//!
//! Cross-process shared state (the config document and the instance
//! registry) lives under a platform-standard config directory:
//! - **Linux**: `~/.config/tp-dcc-rpc`
//! - **Windows**: `%APPDATA%\tp-dcc-rpc`
//! - **macOS**: `~/Library/Application Support/tp-dcc-rpc`

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Get the shared configuration directory for the RPC fabric.
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| RpcError::Config {
        message: "Could not determine platform config directory".to_string(),
    })?;
    Ok(config_dir.join(RpcConfig::APP_CONFIG_DIR_NAME))
}

/// Get the path to the config document.
///
/// Returns `{config_dir}/config.json`.
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(RpcConfig::CONFIG_FILENAME))
}

/// Get the path to the shared instance registry file.
///
/// Returns `{config_dir}/instances.json`.
pub fn registry_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(RpcConfig::REGISTRY_FILENAME))
}

/// Replace a file's contents atomically.
///
/// Writes to a temp file in the target's directory and renames it over the
/// target, so concurrent readers never observe a torn document. This does
/// NOT serialize concurrent writers; last rename wins.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| RpcError::Config {
        message: format!("Path has no parent directory: {}", path.display()),
    })?;
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| RpcError::io_with_path(e, dir))?;
    }

    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| RpcError::io_with_path(e, dir))?;
    tmp.write_all(bytes)
        .map_err(|e| RpcError::io_with_path(e, path))?;
    tmp.persist(path).map_err(|e| RpcError::Io {
        message: format!("Failed to replace {}: {}", path.display(), e),
        path: Some(path.to_path_buf()),
        source: Some(e.error),
    })?;
    Ok(())
}
