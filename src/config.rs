//! Application configuration loading.
//!
//! The console reads a single TOML file. The `[mqtt]` table is optional:
//! when it is absent or lists no hosts the service stays inert and the
//! dashboard runs on the REST API alone.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::mqtt::config::{BrokerConfig, WsProtocol};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct AppConfig {
    pub mqtt: Option<MqttSettings>,
}

/// The `[mqtt]` table. `broker_address` carries the fallback candidates as a
/// semicolon-delimited list, in the order they should be tried.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttSettings {
    pub broker_address: String,
    #[serde(default)]
    pub ws_protocol: WsProtocol,
    #[serde(default = "default_ws_port")]
    pub broker_ws_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topics the monitor binary subscribes to on startup.
    #[serde(default)]
    pub watch_topics: Vec<String>,
}

fn default_ws_port() -> u16 {
    8083
}

impl MqttSettings {
    /// Splits the address list into a connection config, or `None` when no
    /// usable host remains (meaning: do not attempt to connect).
    pub fn broker_config(&self) -> Option<BrokerConfig> {
        let hosts: Vec<String> = self
            .broker_address
            .split(';')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return None;
        }
        Some(BrokerConfig {
            hosts,
            protocol: self.ws_protocol,
            port: self.broker_ws_port,
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

impl AppConfig {
    /// Loads configuration from `path`. A missing file is not an error; the
    /// console then runs without MQTT connectivity.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "no config file found, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bioconsole")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_mqtt_table() {
        let config: AppConfig = toml::from_str(
            r#"
            [mqtt]
            broker_address = "unit1.lab;unit2.lab"
            ws_protocol = "wss"
            broker_ws_port = 9001
            username = "console"
            password = "secret"
            watch_topics = ["sensors/#"]
            "#,
        )
        .unwrap();

        let settings = config.mqtt.unwrap();
        let broker = settings.broker_config().unwrap();
        assert_eq!(broker.hosts, vec!["unit1.lab", "unit2.lab"]);
        assert_eq!(broker.protocol, WsProtocol::Wss);
        assert_eq!(broker.port, 9001);
        assert_eq!(broker.uri_for("unit1.lab"), "wss://unit1.lab:9001/mqtt");
        assert_eq!(settings.watch_topics, vec!["sensors/#"]);
    }

    #[test]
    fn missing_mqtt_table_means_inert() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn defaults_apply_to_sparse_table() {
        let config: AppConfig = toml::from_str(
            r#"
            [mqtt]
            broker_address = "unit1.lab"
            "#,
        )
        .unwrap();

        let settings = config.mqtt.unwrap();
        let broker = settings.broker_config().unwrap();
        assert_eq!(broker.protocol, WsProtocol::Ws);
        assert_eq!(broker.port, 8083);
        assert!(broker.username.is_none());
    }

    #[test]
    fn empty_address_list_means_do_not_connect() {
        let settings = MqttSettings {
            broker_address: " ; ;".to_string(),
            ws_protocol: WsProtocol::Ws,
            broker_ws_port: 8083,
            username: None,
            password: None,
            watch_topics: Vec::new(),
        };
        assert!(settings.broker_config().is_none());
    }
}
