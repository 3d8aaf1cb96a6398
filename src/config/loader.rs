use std::path::{Path, PathBuf};

use crate::config::types::RunletConfig;
use crate::error::{Result, RunletError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runlet", "runlet") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".runlet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// An explicitly requested file must exist; the default location may be absent.
pub fn load_config(config_path: Option<&Path>) -> Result<RunletConfig> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(RunletError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            path.to_path_buf()
        }
        None => get_config_path(),
    };

    if !path.exists() {
        return Ok(RunletConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: RunletConfig =
        toml::from_str(&content).map_err(|e| RunletError::TomlParse(e.to_string()))?;

    Ok(config)
}

/// Get the data directory; sandbox roots live below it unless configured
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runlet", "runlet") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("runlet")
    }
}

/// Resolve the directory holding per-execution sandbox roots
pub fn sandbox_root(config: &RunletConfig) -> PathBuf {
    config
        .sandbox
        .root_dir
        .clone()
        .unwrap_or_else(|| get_data_dir().join("sandboxes"))
}
