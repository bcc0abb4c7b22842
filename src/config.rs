//! Application configuration.
//!
//! Layered with figment: built-in defaults, then the TOML file, then
//! `DUPMON_`-prefixed environment variables (`__` separates nesting, so
//! `DUPMON_MONITORING__SCAN_INTERVAL_SECS=60`), then command-line overrides.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::api::{host_key, normalize_base_url};
use crate::auth::AuthKind;

pub const DEFAULT_CONFIG_PATH: &str = "duplicati-monitor.toml";
const ENV_PREFIX: &str = "DUPMON_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_bind: Option<SocketAddr>,
    pub verbose: bool,
    pub json_logs: bool,
    pub servers: Vec<ServerConfig>,
    pub monitoring: MonitorSettings,
    pub notifications: NotificationConfig,
}

/// One Duplicati server and the jobs to monitor on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub auth: AuthKind,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(default)]
    pub jobs: Vec<String>,
}

fn default_verify_ssl() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_redirects() -> u32 {
    10
}

impl ServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            auth: AuthKind::default(),
            verify_ssl: default_verify_ssl(),
            timeout_secs: default_timeout_secs(),
            max_redirects: default_max_redirects(),
            jobs: Vec::new(),
        }
    }

    /// `host:port` used to address this server in the registry and the status API.
    pub fn host(&self) -> Result<String> {
        let url = normalize_base_url(&self.url)
            .with_context(|| format!("Invalid server URL '{}'", self.url))?;
        Ok(host_key(&url))
    }
}

/// Timing knobs for the per-job coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub scan_interval_secs: u64,
    pub active_interval_secs: u64,
    pub grace_period_secs: u64,
    pub detection_retries: u32,
    pub schedule_buffer_ms: u64,
    pub wait_timeout_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 300,
            active_interval_secs: 5,
            grace_period_secs: 5,
            detection_retries: 5,
            schedule_buffer_ms: 500,
            wait_timeout_secs: 86_400,
        }
    }
}

impl MonitorSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn schedule_buffer(&self) -> Duration {
        Duration::from_millis(self.schedule_buffer_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Delay before detection retry `attempt + 1`: 1, 2, 4, 8, ... seconds.
    pub fn detection_backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(2u64.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    None,
    #[default]
    Log,
    Slack,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_webhook: Option<String>,
}

impl AppConfig {
    /// Load configuration from `path` (a missing file is fine), the
    /// environment and `overrides`, in increasing order of precedence.
    pub fn load<T: Serialize>(path: &Path, overrides: &T) -> Result<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for server in &self.servers {
            server.host()?;
        }
        if self.monitoring.scan_interval_secs == 0 || self.monitoring.active_interval_secs == 0 {
            bail!("Polling intervals must be at least one second");
        }
        Ok(())
    }

    /// Pick a server by `host:port` or URL. Without a selector the only
    /// configured server is used.
    pub fn server(&self, selector: Option<&str>) -> Result<&ServerConfig> {
        match selector {
            Some(wanted) => self
                .servers
                .iter()
                .find(|s| s.url.trim_end_matches('/') == wanted.trim_end_matches('/'))
                .or_else(|| {
                    self.servers
                        .iter()
                        .find(|s| s.host().is_ok_and(|host| host == wanted))
                })
                .with_context(|| format!("No configured server matches '{wanted}'")),
            None => match self.servers.as_slice() {
                [only] => Ok(only),
                [] => bail!("No servers configured"),
                _ => bail!("Several servers configured, pick one with --server"),
            },
        }
    }

    /// Default configuration with one example server.
    pub fn example() -> Self {
        let mut server = ServerConfig::new("http://localhost:8200");
        server.password = Some("change-me".to_string());
        server.jobs = vec!["1".to_string()];
        Self {
            servers: vec![server],
            ..Default::default()
        }
    }

    /// Write the example configuration. Refuses to replace an existing file.
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        let content =
            toml::to_string_pretty(&Self::example()).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}
