//! Configuration loading and persistence.
//!
//! Settings come from `<config_dir>/trajcast/config.json`, then from
//! `TRAJCAST_*` environment variables, then from command-line flags (applied
//! by the binary). The API key is never written to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{Generalization, RealtimeMode};
use crate::channel::ClientOptions;
use crate::constants::{
    DEFAULT_PROJECTION, DEFAULT_REALTIME_URL, PING_INTERVAL, RECONNECT_TIMEOUT,
    STYLE_CACHE_CAPACITY, TRAJECTORY_TTL,
};
use crate::engine::EngineOptions;
use crate::ws::with_api_key;

const CONFIG_FILE: &str = "config.json";

/// Configuration of the trajcast client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Realtime WebSocket endpoint.
    pub url: String,
    /// API key - NOT serialized to disk.
    #[serde(skip)]
    pub api_key: String,
    /// Projection code sent with `PROJECTION`.
    pub projection: String,
    /// Topographic or schematic channels.
    pub mode: RealtimeMode,
    /// Keepalive interval in milliseconds. Zero disables `PING`.
    pub ping_interval_ms: u64,
    /// Delay before reconnecting after a server close, in milliseconds.
    pub reconnect_timeout_ms: u64,
    /// Seconds before a silent vehicle is dropped.
    pub trajectory_ttl_secs: u64,
    /// Sprites kept by the style cache.
    pub style_cache_size: usize,
    /// Restrict vehicles to one tenant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Generalization level (5, 10, 30 or 100) of the selected vehicle's
    /// full trajectory. Unset requests the server default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generalization: Option<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            api_key: String::new(),
            projection: DEFAULT_PROJECTION.to_string(),
            mode: RealtimeMode::default(),
            ping_interval_ms: PING_INTERVAL.as_millis() as u64,
            reconnect_timeout_ms: RECONNECT_TIMEOUT.as_millis() as u64,
            trajectory_ttl_secs: TRAJECTORY_TTL.as_secs(),
            style_cache_size: STYLE_CACHE_CAPACITY,
            tenant: None,
            generalization: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `TRAJCAST_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("TRAJCAST_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("trajcast")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides. An unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from(&dir).unwrap_or_else(|e| {
            log::warn!("Ignoring config file: {:#}", e);
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `config.json` in `dir`. A missing file yields the defaults.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Malformed {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `TRAJCAST_*` overrides looked up through `var`.
    ///
    /// Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("TRAJCAST_URL") {
            self.url = url;
        }

        if let Some(api_key) = var("TRAJCAST_API_KEY") {
            self.api_key = api_key;
        }

        if let Some(projection) = var("TRAJCAST_PROJECTION") {
            self.projection = projection;
        }

        if let Some(ms) = var("TRAJCAST_PING_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.ping_interval_ms = ms;
        }

        if let Some(ms) = var("TRAJCAST_RECONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_timeout_ms = ms;
        }

        if let Some(secs) = var("TRAJCAST_TRAJECTORY_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.trajectory_ttl_secs = secs;
        }

        if let Some(size) = var("TRAJCAST_STYLE_CACHE_SIZE").and_then(|v| v.parse().ok()) {
            self.style_cache_size = size;
        }
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Writes `config.json` into `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Endpoint with the API key appended.
    #[must_use]
    pub fn endpoint(&self) -> String {
        with_api_key(&self.url, &self.api_key)
    }

    /// Channel client timing.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
        }
    }

    /// Engine tuning.
    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        let generalization = self.generalization.and_then(|level| {
            let generalization = Generalization::from_level(level);
            if generalization.is_none() {
                log::warn!("Ignoring unknown generalization level {}", level);
            }
            generalization
        });
        EngineOptions {
            trajectory_ttl: Duration::from_secs(self.trajectory_ttl_secs),
            style_cache_capacity: self.style_cache_size,
            tenant: self.tenant.clone(),
            full_trajectory_generalization: generalization,
            ..EngineOptions::default()
        }
    }
}
