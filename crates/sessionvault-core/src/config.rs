//! Application configuration management.
//!
//! This module handles loading and saving the configuration of the
//! privileged process: identity provider endpoint and public key, data
//! directory, timeouts and the active key id.
//!
//! Configuration is stored at `~/.config/sessionvault/config.json`;
//! `SESSIONVAULT_*` environment variables override file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::DEFAULT_REFRESH_MARGIN_SECS;
use crate::store::STORE_FILE;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "sessionvault";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Remote call timeout bounds in seconds
const MIN_TIMEOUT_SECS: u64 = 10;
const MAX_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TIMEOUT_SECS: u64 = 20;

const DEFAULT_KEY_ID: &str = "v1";

pub const PROVIDER_URL_ENV: &str = "SESSIONVAULT_PROVIDER_URL";
pub const PROVIDER_KEY_ENV: &str = "SESSIONVAULT_PROVIDER_KEY";
pub const DATA_DIR_ENV: &str = "SESSIONVAULT_DATA_DIR";
pub const TIMEOUT_ENV: &str = "SESSIONVAULT_TIMEOUT_SECS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub refresh_margin_secs: i64,
    pub key_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_url: None,
            provider_api_key: None,
            data_dir: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            key_id: DEFAULT_KEY_ID.to_string(),
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(PROVIDER_URL_ENV) {
            self.provider_url = Some(url);
        }
        if let Some(key) = lookup(PROVIDER_KEY_ENV) {
            self.provider_api_key = Some(key);
        }
        if let Some(dir) = lookup(DATA_DIR_ENV) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = lookup(TIMEOUT_ENV).and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = secs;
        }
    }

    /// Fail fast when the provider endpoint is not configured.
    pub fn validate(&self) -> Result<()> {
        if self.provider_url.as_deref().map_or(true, |s| s.trim().is_empty()) {
            bail!("Identity provider URL missing: set {} or provider_url", PROVIDER_URL_ENV);
        }
        if self
            .provider_api_key
            .as_deref()
            .map_or(true, |s| s.trim().is_empty())
        {
            bail!("Identity provider API key missing: set {} or provider_api_key", PROVIDER_KEY_ENV);
        }
        if self.key_id.trim().is_empty() {
            bail!("key_id must not be empty");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        )
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(STORE_FILE))
    }
}
