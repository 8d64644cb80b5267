use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConfigurationError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

// Hand-written so the key never reaches a log line.
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Validated base URL and key, ready for the executor.
#[derive(Clone)]
pub struct GatewayCredentials {
    pub base_url: String,
    pub api_key: String,
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn base_url_value(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn api_key_value(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Check that both the base URL and the key are present.
    pub fn credentials(&self) -> Result<GatewayCredentials, ConfigurationError> {
        match (self.base_url_value(), self.api_key_value()) {
            (Some(url), Some(key)) => Ok(GatewayCredentials {
                base_url: url.trim_end_matches('/').to_string(),
                api_key: key.to_string(),
            }),
            (None, Some(_)) => Err(ConfigurationError::MissingBaseUrl),
            (Some(_), None) => Err(ConfigurationError::MissingApiKey),
            (None, None) => Err(ConfigurationError::MissingBoth),
        }
    }

    /// Summary for the info endpoint. Never contains the values themselves.
    pub fn summary(&self) -> GatewaySummary {
        let url_set = self.base_url_value().is_some();
        let key_set = self.api_key_value().is_some();
        let warning = self
            .base_url_value()
            .filter(|url| url.contains("cloudworkstations.dev"))
            .map(|_| {
                "The configured URL is a Cloud Workstations preview address. Server-to-server \
                 calls from here are often rejected (e.g. 401) by its network restrictions; use \
                 a stable internal address or service name instead."
                    .to_string()
            });

        GatewaySummary {
            configured: url_set && key_set,
            url_set,
            key_set,
            key_length: self.api_key_value().map(str::len).unwrap_or(0),
            warning,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySummary {
    pub configured: bool,
    pub url_set: bool,
    pub key_set: bool,
    pub key_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Attempts at listing chats while a fresh session is still syncing (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl SyncConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_bind() -> String {
    "127.0.0.1:9002".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    4
}

impl Config {
    /// Load from a TOML file (missing file means defaults), then apply
    /// `WAHA_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            info!(
                "Config file {} not found, using defaults and environment",
                path.display()
            );
            Config::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML")
    }

    /// Environment lookups go through `lookup` so tests don't touch the process env.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("WAHA_INTERNAL_URL") {
            self.gateway.base_url = Some(url);
        }
        if let Some(key) = lookup("WAHA_API_KEY") {
            self.gateway.api_key = Some(key);
        }
        if let Some(raw) = lookup("WAHA_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.gateway.timeout_ms = ms,
                _ => warn!("Ignoring invalid WAHA_TIMEOUT_MS value: {:?}", raw),
            }
        }
    }
}
