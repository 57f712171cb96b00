//! Configuration loading and persistence.
//!
//! Settings live in `config.json` under the platform config directory
//! (`synchub/`), or under `SYNCHUB_CONFIG_DIR` when set. The auth token is
//! never written to disk; it comes from `SYNCHUB_TOKEN` or the command line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::Path, path::PathBuf};

const CONFIG_FILE: &str = "config.json";

/// Configuration for the synchub client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// WebSocket (or http/https) URL of the hub.
    pub server_url: String,
    /// Auth token - NOT serialized to disk.
    #[serde(skip)]
    pub token: String,
    /// Link keepalive ping interval. Zero disables keepalive.
    pub keepalive_interval_ms: u64,
    /// How long to wait for a pong before dropping the link.
    pub keepalive_timeout_ms: u64,
    /// Page size for list replicas. `None` loads lists with a full dump.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preload_count: Option<usize>,
    /// Reconnect with backoff after the link is lost.
    pub reconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            token: String::new(),
            keepalive_interval_ms: 30_000,
            keepalive_timeout_ms: 1_000,
            preload_count: None,
            reconnect: true,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `SYNCHUB_CONFIG_DIR` wins over the platform config directory
    /// (e.g. `~/.config/synchub` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SYNCHUB_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("synchub")
        };
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory with environment
    /// variable overrides applied.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir`. A missing file yields defaults.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            log::debug!("[Config] No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Applies `SYNCHUB_*` overrides looked up through `lookup`.
    /// Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("SYNCHUB_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Some(token) = lookup("SYNCHUB_TOKEN") {
            self.token = token;
        }

        if let Some(interval) = lookup("SYNCHUB_KEEPALIVE_INTERVAL_MS") {
            if let Ok(interval) = interval.parse::<u64>() {
                self.keepalive_interval_ms = interval;
            }
        }

        if let Some(timeout) = lookup("SYNCHUB_KEEPALIVE_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                self.keepalive_timeout_ms = timeout;
            }
        }

        if let Some(preload) = lookup("SYNCHUB_PRELOAD_COUNT") {
            if let Ok(preload) = preload.parse::<usize>() {
                self.preload_count = Some(preload);
            }
        }

        if let Some(reconnect) = lookup("SYNCHUB_RECONNECT") {
            match reconnect.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.reconnect = true,
                "0" | "false" | "no" => self.reconnect = false,
                _ => {}
            }
        }
    }

    /// Persists the configuration to the config directory.
    /// Note: the token is NOT saved.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir/config.json`.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?).with_context(|| format!("writing {}", path.display()))?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Whether a token is available for authentication.
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }
}
