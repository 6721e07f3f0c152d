use rapidsms_relay::backbone::{DEFAULT_TAG, SendToConfig};
use rapidsms_relay::config::Config as RelayConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;

#[derive(Clone, Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "rapidsms_relay".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub relay: RelayConfig,
    pub send_to: HashMap<String, SendToConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;

        if !config.send_to.contains_key(DEFAULT_TAG) {
            return Err(ConfigError::MissingSendTo(DEFAULT_TAG));
        }

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("send_to must configure the {0:?} tag")]
    MissingSendTo(&'static str),
}
