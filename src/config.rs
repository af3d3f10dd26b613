use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::registry::RegistryConfig;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database URL. Without one, files live in memory.
    pub db_url: Option<String>,

    /// How long a presence entry survives without any frame from its client
    #[serde(default = "default_awareness_timeout_ms")]
    pub awareness_timeout_ms: u64,

    #[serde(default = "default_awareness_sweep_ms")]
    pub awareness_sweep_ms: u64,

    /// How long a document with no sessions stays in memory
    #[serde(default = "default_doc_grace_period_ms")]
    pub doc_grace_period_ms: u64,

    #[serde(default = "default_update_channel_capacity")]
    pub update_channel_capacity: usize,

    #[serde(default = "default_awareness_channel_capacity")]
    pub awareness_channel_capacity: usize,

    /// WebSocket ping interval
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Save dirty documents periodically. Disabled when unset.
    pub autosave_interval_secs: Option<u64>,

    /// Mount the plain broadcast relay for clients without CRDT support
    #[serde(default)]
    pub legacy_relay: bool,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            grace_period: Duration::from_millis(self.doc_grace_period_ms),
            update_capacity: self.update_channel_capacity,
            awareness_timeout: Duration::from_millis(self.awareness_timeout_ms),
            awareness_sweep: Duration::from_millis(self.awareness_sweep_ms.max(1)),
            awareness_capacity: self.awareness_channel_capacity,
            ..RegistryConfig::default()
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        self.autosave_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Allowed CORS origins; empty means any.
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            db_url: None,
            awareness_timeout_ms: default_awareness_timeout_ms(),
            awareness_sweep_ms: default_awareness_sweep_ms(),
            doc_grace_period_ms: default_doc_grace_period_ms(),
            update_channel_capacity: default_update_channel_capacity(),
            awareness_channel_capacity: default_awareness_channel_capacity(),
            ping_interval_ms: default_ping_interval_ms(),
            autosave_interval_secs: None,
            legacy_relay: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_awareness_timeout_ms() -> u64 {
    30_000
}

fn default_awareness_sweep_ms() -> u64 {
    5_000
}

fn default_doc_grace_period_ms() -> u64 {
    10_000
}

fn default_update_channel_capacity() -> usize {
    256
}

fn default_awareness_channel_capacity() -> usize {
    64
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.server_address(), "0.0.0.0:5000");
        assert!(config.is_development());
        assert!(config.autosave_interval().is_none());
        let registry = config.registry_config();
        assert_eq!(registry.awareness_timeout, Duration::from_secs(30));
        assert_eq!(registry.grace_period, Duration::from_secs(10));
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = Config {
            awareness_sweep_ms: 0,
            ping_interval_ms: 0,
            autosave_interval_secs: Some(0),
            ..Config::default()
        };
        assert_eq!(config.registry_config().awareness_sweep, Duration::from_millis(1));
        assert_eq!(config.ping_interval(), Duration::from_millis(1));
        assert!(config.autosave_interval().is_none());
    }

    #[test]
    fn cors_origins_are_split() {
        let config = Config {
            cors_origins: Some("http://a.test, http://b.test,".into()),
            ..Config::default()
        };
        assert_eq!(config.cors_origin_list(), vec!["http://a.test", "http://b.test"]);
    }
}
