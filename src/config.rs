use crate::alerts::AlertThreshold;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_record_interval_secs")]
    pub record_interval_secs: u64,
    #[serde(default = "default_public_ip_url")]
    pub public_ip_url: String,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub transmission: TransmissionConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub command_ms: u64,
    #[serde(default = "default_public_ip_timeout_ms")]
    pub public_ip_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransmissionConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub memory: AlertThreshold,
    #[serde(default)]
    pub storage: AlertThreshold,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_limit")]
    pub default_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_path: default_database_path(),
            record_interval_secs: default_record_interval_secs(),
            public_ip_url: default_public_ip_url(),
            timeouts: TimeoutsConfig::default(),
            transmission: TransmissionConfig::default(),
            alerts: AlertsConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            command_ms: default_command_timeout_ms(),
            public_ip_ms: default_public_ip_timeout_ms(),
            rpc_ms: default_rpc_timeout_ms(),
        }
    }
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            password_env: default_password_env(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            memory: AlertThreshold::default(),
            storage: AlertThreshold::default(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_history_limit(),
        }
    }
}

impl TimeoutsConfig {
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn public_ip(&self) -> Duration {
        Duration::from_millis(self.public_ip_ms)
    }

    pub fn rpc(&self) -> Duration {
        Duration::from_millis(self.rpc_ms)
    }
}

impl TransmissionConfig {
    /// Password from the environment variable named by `password_env`, falling back to the file.
    pub fn resolve_password(&self) -> Option<String> {
        if let Ok(v) = std::env::var(&self.password_env) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
        self.password
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "database_path must not be empty".to_string(),
            ));
        }
        if self.record_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "record_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.history.default_limit < 1 {
            return Err(ConfigError::Validation(
                "history.default_limit must be >= 1".to_string(),
            ));
        }

        validate_timeouts(&self.timeouts)?;
        validate_transmission(&self.transmission)?;
        validate_alerts(&self.alerts)?;

        Ok(())
    }

    pub fn record_interval(&self) -> Duration {
        Duration::from_secs(self.record_interval_secs)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_timeouts(cfg: &TimeoutsConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("command_ms", cfg.command_ms),
        ("public_ip_ms", cfg.public_ip_ms),
        ("rpc_ms", cfg.rpc_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "timeouts.{name} must be > 0"
            )));
        }
    }
    Ok(())
}

fn validate_transmission(cfg: &TransmissionConfig) -> Result<(), ConfigError> {
    let Some(url) = cfg.url.as_deref() else {
        return Ok(());
    };
    let url = url.trim();
    if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::Validation(format!(
            "transmission.url '{url}' must start with http:// or https://"
        )));
    }
    Ok(())
}

fn validate_alerts(cfg: &AlertsConfig) -> Result<(), ConfigError> {
    for (name, threshold) in [("memory", &cfg.memory), ("storage", &cfg.storage)] {
        if !threshold.is_valid() {
            return Err(ConfigError::Validation(format!(
                "alerts.{name}: percentages must be within 0..100 and warn_percent < crit_percent"
            )));
        }
    }
    Ok(())
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_path() -> String {
    "./metrics.db".to_string()
}

const fn default_record_interval_secs() -> u64 {
    10
}

fn default_public_ip_url() -> String {
    "https://api.ipify.org/?format=json".to_string()
}

const fn default_command_timeout_ms() -> u64 {
    2000
}

const fn default_public_ip_timeout_ms() -> u64 {
    3000
}

const fn default_rpc_timeout_ms() -> u64 {
    3000
}

fn default_password_env() -> String {
    "TRANSMISSION_PASSWORD".to_string()
}

const fn default_history_limit() -> usize {
    360
}
