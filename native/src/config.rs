use crate::ipc::{DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL_NAME};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Vendor server location relative to the running executable.
pub const DEFAULT_SERVER_PATH: &str = "CSServer/TLBP2PipeConnection.exe";

/// Keeps the vendor server quiet when launched in the background.
pub const SUPPRESS_OUTPUT_ARG: &str = "--suppress-output";

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config directory not accessible")]
    ConfigDirError,
}

/// Everything a `Session` needs to reach the vendor server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Must match the name compiled into the vendor server.
    pub channel_name: String,
    pub buffer_size: usize,
    pub server_path: PathBuf,
    pub server_args: Vec<String>,
    pub connect_timeout_secs: u64,
    /// Pause between `stop` and closing the channel.
    pub settle_delay_ms: u64,
    /// Skip spawning and killing the server; one is assumed to be running already.
    pub debug_mode: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            server_path: PathBuf::from(DEFAULT_SERVER_PATH),
            server_args: vec![SUPPRESS_OUTPUT_ARG.to_string()],
            connect_timeout_secs: 20,
            settle_delay_ms: 250,
            debug_mode: false,
        }
    }
}

impl SessionConfig {
    /// Load from the user config directory, or defaults when no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = get_config_directory()?.join(CONFIG_FILE_NAME);
        if !path.exists() {
            debug!("[CONFIG] No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        info!("[CONFIG] Loaded {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Server path, with relative paths taken from the executable's directory.
    pub fn resolved_server_path(&self) -> PathBuf {
        if self.server_path.is_absolute() {
            return self.server_path.clone();
        }

        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .map(|exe_dir| exe_dir.join(&self.server_path))
            .unwrap_or_else(|| self.server_path.clone())
    }
}

fn get_config_directory() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("TLBP2Control"))
        .ok_or(ConfigError::ConfigDirError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tlbp2-config-{}", uuid::Uuid::new_v4()))
            .join(CONFIG_FILE_NAME)
    }

    #[test]
    fn defaults_match_vendor_server() {
        let config = SessionConfig::default();
        assert_eq!(config.channel_name, "TLBP2PyConnection");
        assert_eq!(config.buffer_size, 65536);
        assert_eq!(config.server_args, vec!["--suppress-output".to_string()]);
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
        assert_eq!(config.settle_delay(), Duration::from_millis(250));
        assert!(!config.debug_mode);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let path = temp_config_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{ "debug_mode": true, "connect_timeout_secs": 5 }"#).unwrap();

        let config = SessionConfig::load_from(&path).unwrap();
        assert!(config.debug_mode);
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.channel_name, DEFAULT_CHANNEL_NAME);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn save_and_reload() {
        let path = temp_config_path();
        let config = SessionConfig {
            channel_name: "BenchProfiler".to_string(),
            settle_delay_ms: 100,
            ..SessionConfig::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(SessionConfig::load_from(&path).unwrap(), config);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn invalid_json_is_reported() {
        let path = temp_config_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            SessionConfig::load_from(&path),
            Err(ConfigError::JsonError(_))
        ));

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn absolute_server_path_is_kept() {
        let absolute = std::env::temp_dir().join("TLBP2PipeConnection.exe");
        let config = SessionConfig {
            server_path: absolute.clone(),
            ..SessionConfig::default()
        };
        assert_eq!(config.resolved_server_path(), absolute);

        let relative = SessionConfig::default().resolved_server_path();
        assert!(relative.ends_with(DEFAULT_SERVER_PATH));
    }
}
