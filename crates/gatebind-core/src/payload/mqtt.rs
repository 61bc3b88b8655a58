//! MQTT broker configuration payloads.
//!
//! The configuration does not fit one write, so it travels as two
//! space-separated parts:
//!
//! ```text
//! part 1: host port username password
//! part 2: client_id sub_topic pub_topic
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::PayloadError;

/// Broker credentials and topics for the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub sub_topic: String,
    pub pub_topic: String,
}

impl MqttConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MqttConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Every field must be non-empty.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let fields = [
            ("host", self.host.as_str()),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("client_id", self.client_id.as_str()),
            ("sub_topic", self.sub_topic.as_str()),
            ("pub_topic", self.pub_topic.as_str()),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| v.is_empty()) {
            return Err(PayloadError::EmptyField(*name));
        }
        if self.port == 0 {
            return Err(PayloadError::EmptyField("port"));
        }
        Ok(())
    }

    /// `host port username password`
    pub fn encode_part1(&self) -> Result<Vec<u8>, PayloadError> {
        self.validate()?;
        Ok(format!(
            "{} {} {} {}",
            self.host, self.port, self.username, self.password
        )
        .into_bytes())
    }

    /// `client_id sub_topic pub_topic`
    pub fn encode_part2(&self) -> Result<Vec<u8>, PayloadError> {
        self.validate()?;
        Ok(format!("{} {} {}", self.client_id, self.sub_topic, self.pub_topic).into_bytes())
    }
}
