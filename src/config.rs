use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_LOG: &str = "CHATVIEW_LOG";
pub const ENV_STORAGE_PATH: &str = "CHATVIEW_STORAGE_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// `tracing` filter directive; `RUST_LOG` applies when unset
    pub log_filter: Option<String>,
    /// Conversation storage directory; defaults under the user data dir
    pub storage_path: Option<PathBuf>,
    /// Push task lifecycle and output frames to the webview
    pub forward_task_events: bool,
    /// Pause between words of the loopback backend
    pub stream_chunk_delay_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            storage_path: None,
            forward_task_events: true,
            stream_chunk_delay_ms: 40,
        }
    }
}

impl BridgeConfig {
    /// Environment wins over the file. `.env` is read first.
    pub fn apply_env_overrides(&mut self) {
        dotenvy::dotenv().ok();
        if let Ok(filter) = std::env::var(ENV_LOG) {
            if !filter.trim().is_empty() {
                self.log_filter = Some(filter);
            }
        }
        if let Ok(path) = std::env::var(ENV_STORAGE_PATH) {
            if !path.trim().is_empty() {
                self.storage_path = Some(PathBuf::from(path));
            }
        }
    }

    pub fn resolved_storage_path(&self) -> PathBuf {
        self.storage_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chatview")
                .join("conversations")
        })
    }
}

pub fn default_config_path() -> PathBuf {
    let Some(dirs) = ProjectDirs::from("dev", "chatview", "chatview-bridge") else {
        return Path::new("chatview-bridge.json").to_path_buf();
    };
    dirs.config_dir().join("config.json")
}

/// A missing file is not an error; a malformed one is.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BridgeConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_config(path: &Path, cfg: &BridgeConfig) -> Result<(), ConfigError> {
    let json = serde_json::to_vec_pretty(cfg).map_err(|e| ConfigError::Write(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
    }
    fs::write(path, json).map_err(|e| ConfigError::Write(e.to_string()))
}
