// ABOUTME: Configuration loading and management for berth
// ABOUTME: Supports TOML config files with sensible defaults

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::options::SpawnOptions;

/// Errors from loading or initializing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Spawn server (helper process) settings
    pub spawn_server: SpawnServerConfig,
    /// Per-session I/O settings
    pub session: SessionConfig,
    /// Template for spawn options; the application root is supplied per call
    pub defaults: SpawnOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnServerConfig {
    /// Interpreter that runs the spawn server script (defaults to "ruby")
    pub interpreter: String,
    /// Path of the spawn server script passed to the interpreter
    pub server_script: PathBuf,
    /// Helper stdout/stderr go here when set; otherwise they are inherited
    pub log_file: Option<PathBuf>,
    /// Run the helper as this user (only effective when running as root)
    pub user: Option<String>,
    /// How long to wait for the helper to exit after closing its channel
    pub shutdown_grace_ms: u64,
    /// How long to wait for the helper to exit after SIGTERM
    pub kill_grace_ms: u64,
}

impl Default for SpawnServerConfig {
    fn default() -> Self {
        Self {
            interpreter: "ruby".to_string(),
            server_script: PathBuf::from("passenger-spawn-server"),
            log_file: None,
            user: None,
            shutdown_grace_ms: 5000,
            kill_grace_ms: 5000,
        }
    }
}

impl SpawnServerConfig {
    pub fn new(interpreter: impl Into<String>, server_script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            server_script: server_script.into(),
            ..Self::default()
        }
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set both grace windows of the stop sequence.
    pub fn with_grace(mut self, shutdown: Duration, kill: Duration) -> Self {
        self.shutdown_grace_ms = shutdown.as_millis() as u64;
        self.kill_grace_ms = kill.as_millis() as u64;
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reader timeout in milliseconds; 0 disables it
    pub reader_timeout_ms: u64,
    /// Writer timeout in milliseconds; 0 disables it
    pub writer_timeout_ms: u64,
}

impl Config {
    /// Get the XDG config directory for berth (~/.config/berth)
    pub fn config_dir() -> PathBuf {
        // Respect XDG_CONFIG_HOME if set, otherwise use ~/.config
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("berth")
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from XDG config directory
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            // No config found, use defaults
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        r#"# berth configuration
# Location: ~/.config/berth/config.toml

[spawn_server]
interpreter = "ruby"
server_script = "passenger-spawn-server"
# log_file = "/var/log/berth/spawn-server.log"
# user = "nobody"  # Only effective when running as root
shutdown_grace_ms = 5000
kill_grace_ms = 5000

[session]
reader_timeout_ms = 0  # 0 disables the timeout
writer_timeout_ms = 0

[defaults]
# lower_privilege = true
# lowest_user = "nobody"
environment = "production"
spawn_method = "smart-lv2"
app_type = "rails"
"#
        .to_string()
    }

    /// Initialize config directory and create default config if needed
    pub fn init() -> Result<PathBuf, ConfigError> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_path();

        std::fs::create_dir_all(&config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.clone(),
            source,
        })?;

        // Write default config if it doesn't exist
        if !config_path.exists() {
            std::fs::write(&config_path, Self::default_toml()).map_err(|source| {
                ConfigError::Write {
                    path: config_path.clone(),
                    source,
                }
            })?;
        }

        Ok(config_path)
    }
}
