//! Configuration loaded from `~/.groupscope/config.json`.
//!
//! Every field is optional; a missing file means all defaults. The data
//! directory can be overridden with `GROUPSCOPE_DATA_DIR`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding `dataDir`.
pub const DATA_DIR_ENV: &str = "GROUPSCOPE_DATA_DIR";

/// Rows buffered before a member batch is written.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root holding one directory per account.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Shell executables tried, in order, by the fallback decrypt backend.
    #[serde(default = "crate::cipher::shell::default_candidates")]
    pub sqlcipher_candidates: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".groupscope")
        .join("data")
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sqlcipher_candidates: crate::cipher::shell::default_candidates(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Config {
    /// Config with everything defaulted except the data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

/// Path of the default config file.
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".groupscope").join("config.json"))
}

/// Load configuration from ~/.groupscope/config.json
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;
    let mut config = load_config_from(&path)?;
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            config.data_dir = PathBuf::from(dir);
        }
    }
    Ok(config)
}

/// Load configuration from an explicit path; a missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
    let config: Config =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;

    if config.batch_size == 0 {
        return Err("batchSize must be at least 1".to_string());
    }
    if config.sqlcipher_candidates.is_empty() {
        log::warn!("sqlcipherCandidates is empty; the shell decrypt backend is disabled");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.sqlcipher_candidates.len(), 3);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "dataDir": "/srv/groupscope", "batchSize": 100 }"#).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/groupscope"));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.sqlcipher_candidates[0].trim_end_matches(".exe"), "sqlcipher");
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "batchSize": 0 }"#).unwrap();
        assert!(load_config_from(&path).is_err());
    }
}
