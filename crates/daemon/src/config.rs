//! Configuration management for the termbridge session host.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termbridge/config.toml`.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address like 127.0.0.1:3001, got {0}")]
    InvalidListenAddr(String),

    #[error("default geometry must be at least 1x1, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("reconnect_grace_secs must be between 0 and 3600, got {0}")]
    InvalidReconnectGrace(u64),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Longest allowed reconnect grace window, in seconds.
const MAX_RECONNECT_GRACE_SECS: u64 = 3600;

/// Main configuration structure for the session host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the channel listener binds to.
    pub listen_addr: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr only when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell override. When unset the shell is detected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_shell: Option<String>,

    /// Start POSIX shells as login shells.
    pub login_shell: bool,

    /// Columns used when a channel requests none.
    pub default_cols: u16,

    /// Rows used when a channel requests none.
    pub default_rows: u16,

    /// Seconds a detached session stays alive (0 = kill on disconnect).
    pub reconnect_grace_secs: u64,

    /// Output kept per detached session for replay, in bytes.
    pub backlog_bytes: usize,

    /// Extra environment variables for every shell.
    pub env: HashMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3001".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            login_shell: true,
            default_cols: protocol::messages::DEFAULT_COLS,
            default_rows: protocol::messages::DEFAULT_ROWS,
            reconnect_grace_secs: 0,
            backlog_bytes: 64 * 1024,
            env: HashMap::new(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termbridge")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMBRIDGE_LISTEN_ADDR: Override the listen address
    /// - TERMBRIDGE_SHELL: Override the shell
    /// - TERMBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_env("TERMBRIDGE_LISTEN_ADDR") {
            tracing::info!(listen_addr = %addr, "Overriding listen_addr from environment");
            self.daemon.listen_addr = addr;
        }

        if let Some(shell) = non_empty_env("TERMBRIDGE_SHELL") {
            tracing::info!(shell = %shell, "Overriding default_shell from environment");
            self.session.default_shell = Some(shell);
        }

        if let Some(level) = non_empty_env("TERMBRIDGE_LOG_LEVEL") {
            tracing::info!(log_level = %level, "Overriding log_level from environment");
            self.daemon.log_level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        let (cols, rows) = (self.session.default_cols, self.session.default_rows);
        if cols == 0 || rows == 0 {
            return Err(ConfigError::InvalidGeometry { cols, rows });
        }

        if self.session.reconnect_grace_secs > MAX_RECONNECT_GRACE_SECS {
            return Err(ConfigError::InvalidReconnectGrace(
                self.session.reconnect_grace_secs,
            ));
        }

        if let Some(ref shell) = self.session.default_shell {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Parses the configured listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.daemon
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.daemon.listen_addr.clone()))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
