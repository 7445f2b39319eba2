//! Configuration persistence
//!
//! TOML configuration stored in the platform-specific config directory:
//! - Linux: ~/.config/peercall/config.toml
//! - Windows: %APPDATA%\peercall\config.toml
//! - macOS: ~/Library/Application Support/peercall/config.toml

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::SessionOptions;
use crate::protocol::{FrameFormat, Participant, DEFAULT_CHUNK_SIZE};

/// Application name used for the configuration directory
const APP_NAME: &str = "peercall";

const CONFIG_FILE: &str = "config.toml";

/// Largest chunk that still fits a single SCTP message on every stack
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Call configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallConfig {
    /// Relay server URL (ws:// or wss://)
    #[serde(default)]
    pub relay_url: Option<String>,

    #[serde(default)]
    pub tenant: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    /// Bytes per media frame
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub frame_format: FrameFormat,

    /// STUN/TURN urls; empty means the public default
    #[serde(default)]
    pub ice_servers: Vec<String>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            tenant: None,
            user_id: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            frame_format: FrameFormat::default(),
            ice_servers: Vec::new(),
        }
    }
}

impl CallConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load and validate the config at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CallConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config at `path`, or defaults when the file does not exist
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Validate and write the config to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} must be between 1 and {}",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }

        if let Some(ref url) = self.relay_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigError::Invalid(format!(
                    "Invalid relay URL: {}. Must start with ws:// or wss://",
                    url
                )));
            }
        }

        for id in [&self.tenant, &self.user_id].into_iter().flatten() {
            if id.is_empty() || id.contains("-usr-") {
                return Err(ConfigError::Invalid(format!(
                    "Invalid identity '{}': must be non-empty and not contain '-usr-'",
                    id
                )));
            }
        }

        for server in &self.ice_servers {
            if !["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| server.starts_with(scheme))
            {
                return Err(ConfigError::Invalid(format!(
                    "Invalid ICE server: {}",
                    server
                )));
            }
        }

        Ok(())
    }

    /// Local identity, when both tenant and user id are set
    pub fn participant(&self) -> Option<Participant> {
        match (&self.tenant, &self.user_id) {
            (Some(tenant), Some(user_id)) => Some(Participant::new(tenant, user_id)),
            _ => None,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            chunk_size: self.chunk_size,
            frame_format: self.frame_format,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CallConfig::default();
        assert_eq!(config.relay_url, None);
        assert_eq!(config.chunk_size, 16384);
        assert_eq!(config.frame_format, FrameFormat::Indexed);
        assert!(config.ice_servers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_chunk() {
        let config = CallConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_config_validation_invalid_url() {
        let config = CallConfig {
            relay_url: Some("http://example.com".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_identity() {
        let config = CallConfig {
            user_id: Some("a-usr-b".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_ice_servers() {
        let config = CallConfig {
            ice_servers: vec!["stun:stun.example.com:3478".into(), "turn:t.example.com".into()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = CallConfig {
            ice_servers: vec!["example.com".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization_with_defaults() {
        let toml_str = r#"
            relay_url = "wss://relay.example.com"
            tenant = "acme"
            frame_format = "raw"
        "#;

        let config: CallConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.relay_url.as_deref(), Some("wss://relay.example.com"));
        assert_eq!(config.frame_format, FrameFormat::Raw);
        assert_eq!(config.chunk_size, 16384);
        assert!(config.participant().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = CallConfig {
            relay_url: Some("ws://localhost:8080".into()),
            tenant: Some("acme".into()),
            user_id: Some("7".into()),
            chunk_size: 4096,
            ..Default::default()
        };

        config.save(&path).unwrap();
        let loaded = CallConfig::load(&path).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded.participant(), Some(Participant::new("acme", "7")));
        assert_eq!(loaded.session_options().chunk_size, 4096);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = CallConfig::load_or_default(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, CallConfig::default());
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "chunk_size = 0\n").unwrap();
        assert!(matches!(
            CallConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
