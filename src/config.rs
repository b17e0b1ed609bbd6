//! Layered configuration: built-in defaults, then an optional TOML file, then
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SyncError};

pub const ENV_API_URL: &str = "KLIENTEL_API_URL";
pub const ENV_SOCKET_URL: &str = "KLIENTEL_SOCKET_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// GraphQL endpoint.
    pub api_url: String,
    /// Socket.IO room server. A bare host is served under `/socket.io/`.
    pub socket_url: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Inbound frame buffer per session.
    pub event_buffer: usize,
    /// How many rejected payloads the reconciler keeps.
    pub quarantine_capacity: usize,
    /// Relay confirmed comments to the room after `add_comment` succeeds.
    pub broadcast_own_comments: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "https://klientel-backend.onrender.com/graphql".to_string(),
            socket_url: "wss://klientel-backend.onrender.com".to_string(),
            connect_timeout_secs: 3,
            request_timeout_secs: 10,
            event_buffer: 256,
            quarantine_capacity: 32,
            broadcast_own_comments: true,
        }
    }
}

impl SyncConfig {
    /// Defaults, overlaid by `path` (if given), overlaid by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Override fields from `lookup` (normally the process environment).
    /// Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_url = url;
        }
        if let Some(url) = lookup(ENV_SOCKET_URL).filter(|v| !v.trim().is_empty()) {
            self.socket_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(SyncError::Config("api_url must not be empty".into()));
        }
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "api_url must be http(s), got '{}'",
                self.api_url
            )));
        }
        if !(self.socket_url.starts_with("ws://") || self.socket_url.starts_with("wss://")) {
            return Err(SyncError::Config(format!(
                "socket_url must be ws(s), got '{}'",
                self.socket_url
            )));
        }
        crate::transport::socketio::endpoint(&self.socket_url)?;
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event_buffer must be at least 1".into()));
        }
        if self.quarantine_capacity == 0 {
            return Err(SyncError::Config("quarantine_capacity must be at least 1".into()));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(SyncError::Config("timeouts must be at least one second".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
