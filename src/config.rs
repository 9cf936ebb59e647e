//! Broker configuration (TOML-loadable, env-tolerant defaults).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::StoreLimits;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster_id: String,
    pub logging: LoggingConfig,
    pub limits: StoreLimits,
    pub broker: BrokerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_id: "relaymq".to_string(),
            logging: LoggingConfig::default(),
            limits: StoreLimits::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn load_or_default(path: &Path) -> Config {
        if !path.exists() {
            return Config::default();
        }
        match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                Config::default()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            filter: None,
        }
    }
}

/// Timing and concurrency knobs for the delivery engine. Durations are in
/// milliseconds in the file; accessors convert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub hb_interval_ms: u64,
    pub hb_timeout_ms: u64,
    pub max_failed_hb: u32,
    pub dup_cid_timeout_ms: u64,
    pub dup_max_cid_probes: usize,
    pub default_ack_wait_ms: u64,
    pub default_max_in_flight: u32,
    pub grace_shutdown_ms: u64,
    pub expiration_error_backoff_ms: u64,
    pub file_segment_max_bytes: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hb_interval_ms: 30_000,
            hb_timeout_ms: 10_000,
            max_failed_hb: 3,
            dup_cid_timeout_ms: 1_000,
            dup_max_cid_probes: 100,
            default_ack_wait_ms: 30_000,
            default_max_in_flight: 1024,
            grace_shutdown_ms: 1_000,
            expiration_error_backoff_ms: 5_000,
            file_segment_max_bytes: 8 * 1024 * 1024,
        }
    }
}

impl BrokerConfig {
    pub fn hb_interval(&self) -> Duration {
        Duration::from_millis(self.hb_interval_ms)
    }

    pub fn hb_timeout(&self) -> Duration {
        Duration::from_millis(self.hb_timeout_ms)
    }

    pub fn dup_cid_timeout(&self) -> Duration {
        Duration::from_millis(self.dup_cid_timeout_ms)
    }

    pub fn default_ack_wait(&self) -> Duration {
        Duration::from_millis(self.default_ack_wait_ms)
    }

    pub fn grace_shutdown(&self) -> Duration {
        Duration::from_millis(self.grace_shutdown_ms)
    }

    pub fn expiration_error_backoff(&self) -> Duration {
        Duration::from_millis(self.expiration_error_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.cluster_id, config.cluster_id);
        assert_eq!(back.broker.hb_interval_ms, config.broker.hb_interval_ms);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            cluster_id = "test"

            [broker]
            hb_interval_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster_id, "test");
        assert_eq!(config.broker.hb_interval_ms, 50);
        assert_eq!(config.broker.max_failed_hb, 3);
    }
}
