//! Configuration management for gatewayctl.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/gatewayctl/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ConnectionDetails;
use crate::session::DEFAULT_TIMEOUT_MS;

/// Default gateway URL.
pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("gateway url must start with ws:// or wss://, got {0}")]
    InvalidGatewayUrl(String),

    #[error("timeout_ms must be greater than 0, got {0}")]
    InvalidTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Where the gateway is and how to authenticate with it.
    pub gateway: GatewayConfig,

    /// Local client settings.
    pub client: ClientConfig,
}

/// Gateway connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway.
    pub url: String,

    /// Shared token. Empty means none.
    pub token: String,

    /// Shared password. Empty means none.
    pub password: String,
}

/// Local client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory for the device identity and token cache.
    pub state_dir: PathBuf,

    /// Default call deadline in milliseconds.
    pub timeout_ms: u64,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token: String::new(),
            password: String::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gatewayctl")
        .join("config.toml")
}

/// Returns the default state directory path.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gatewayctl")
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values; empty
    /// values are ignored. Supported variables:
    /// - GATEWAY_URL: Override gateway URL
    /// - GATEWAY_TOKEN: Override shared token
    /// - GATEWAY_PASSWORD: Override shared password
    /// - GATEWAY_STATE_DIR: Override state directory
    /// - GATEWAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("GATEWAY_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding gateway url from environment: {}", url);
                self.gateway.url = url;
            }
        }

        if let Ok(token) = std::env::var("GATEWAY_TOKEN") {
            if !token.is_empty() {
                tracing::info!("Overriding gateway token from environment");
                self.gateway.token = token;
            }
        }

        if let Ok(password) = std::env::var("GATEWAY_PASSWORD") {
            if !password.is_empty() {
                tracing::info!("Overriding gateway password from environment");
                self.gateway.password = password;
            }
        }

        if let Ok(state_dir) = std::env::var("GATEWAY_STATE_DIR") {
            if !state_dir.is_empty() {
                tracing::info!("Overriding state_dir from environment: {}", state_dir);
                self.client.state_dir = PathBuf::from(state_dir);
            }
        }

        if let Ok(level) = std::env::var("GATEWAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.client.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.gateway.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidGatewayUrl(url.clone()));
        }

        if self.client.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(self.client.timeout_ms));
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        Ok(())
    }

    /// Connection details for a call; empty token and password become `None`.
    pub fn connection_details(&self) -> ConnectionDetails {
        ConnectionDetails {
            url: self.gateway.url.clone(),
            token: non_empty(&self.gateway.token),
            password: non_empty(&self.gateway.password),
            state_dir: self.client.state_dir.clone(),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
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
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
