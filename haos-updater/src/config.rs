//! Runtime configuration
//!
//! Handles:
//! - Add-on options file (`/data/options.json`, JSON or TOML)
//! - Poll interval bounds and port validation
//! - Hub endpoint and token from the environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const MIN_CHECK_INTERVAL_SECS: u64 = 300;
pub const MAX_CHECK_INTERVAL_SECS: u64 = 86_400;
pub const DEFAULT_OPTIONS_PATH: &str = "/data/options.json";
pub const DEFAULT_HUB_URL: &str = "http://supervisor";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub check_interval: u64,
    pub auto_update: bool,
    pub notifications: bool,
    pub debug: bool,
    pub mqtt: MqttConfig,
    pub device_model: String,
    pub manifest_url: String,
    pub release_base_url: String,
    pub cache_dir: PathBuf,
    pub agent_root: String,
    pub host_root: String,
    pub download_attempts: u32,
    pub download_backoff_secs: u64,
    pub reboot_delay_secs: u64,
    #[serde(skip)]
    pub hub: HubConfig,
}

/// Message bus options; every connection field is optional and resolved
/// later against the environment and the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: Option<String>,
    pub port: Option<PortValue>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub tls: Option<bool>,
}

/// Ports arrive from a user-edited file, so strings are accepted and
/// validated instead of failing the whole document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            check_interval: MAX_CHECK_INTERVAL_SECS,
            auto_update: false,
            notifications: true,
            debug: false,
            mqtt: MqttConfig::default(),
            device_model: "umdu-k1".to_string(),
            manifest_url:
                "https://raw.githubusercontent.com/umduru/umdu-haos-updater/main/versions.json"
                    .to_string(),
            release_base_url: "https://github.com/umduru/umdu-haos-updater/releases/download"
                .to_string(),
            cache_dir: PathBuf::from("/share/umdu-haos-updater"),
            agent_root: "/share/".to_string(),
            host_root: "/mnt/data/supervisor/share/".to_string(),
            download_attempts: 3,
            download_backoff_secs: 5,
            reboot_delay_secs: 5,
            hub: HubConfig::from_env(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: None,
            port: None,
            username: None,
            password: None,
            tls: None,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let base_url = std::env::var("SUPERVISOR_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HUB_URL.to_string());
        let token = std::env::var("SUPERVISOR_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self { base_url, token }
    }
}

impl MqttConfig {
    /// Configured port, if present and within 1..=65535
    pub fn valid_port(&self) -> Option<u16> {
        let port = match self.port.as_ref()? {
            PortValue::Number(n) => *n,
            PortValue::Text(s) => s.trim().parse::<i64>().ok()?,
        };
        u16::try_from(port).ok().filter(|p| *p != 0)
    }
}

impl RuntimeConfig {
    /// Load options from `UPDATER_CONFIG` or the add-on default location.
    /// A missing or unreadable file falls back to defaults.
    pub async fn load() -> Self {
        let path = Self::config_file_path();
        match Self::load_from(&path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Using default configuration: {:#}", e);
                Self::default().normalized()
            }
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let config: RuntimeConfig = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?
        } else if content.trim().is_empty() {
            RuntimeConfig::default()
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?
        };

        debug!("Loaded configuration from {}", path.display());
        Ok(config.normalized())
    }

    pub fn config_file_path() -> PathBuf {
        std::env::var("UPDATER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_OPTIONS_PATH))
    }

    /// Clamp bounded values and drop invalid ones
    pub fn normalized(mut self) -> Self {
        let clamped = self
            .check_interval
            .clamp(MIN_CHECK_INTERVAL_SECS, MAX_CHECK_INTERVAL_SECS);
        if clamped != self.check_interval {
            warn!(
                "check_interval {}s out of range, using {}s",
                self.check_interval, clamped
            );
            self.check_interval = clamped;
        }

        if self.mqtt.port.is_some() && self.mqtt.valid_port().is_none() {
            warn!("Invalid MQTT port {:?}, ignoring", self.mqtt.port);
            self.mqtt.port = None;
        }

        if self.download_attempts == 0 {
            self.download_attempts = 1;
        }

        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn download_backoff(&self) -> Duration {
        Duration::from_secs(self.download_backoff_secs)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_secs(self.reboot_delay_secs)
    }
}
