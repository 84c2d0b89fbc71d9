use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::session::SessionPolicy;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ice: IceConfig,
    pub session: SessionConfig,
    pub signaling: SignalingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigErrors> {
        let config: Self = toml::from_str(text)?;
        config.signaling.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcePolicy {
    #[default]
    All,
    /// Only relayed (TURN) candidates
    Relay,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_owned()],
            username: None,
            credential: None,
        }
    }

    fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_owned()],
            username: Some(username.to_owned()),
            credential: Some(credential.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServerConfig>,
    pub transport_policy: IcePolicy,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
                IceServerConfig::stun("stun:stun2.l.google.com:19302"),
                IceServerConfig::stun("stun:stun3.l.google.com:19302"),
                IceServerConfig::stun("stun:stun4.l.google.com:19302"),
                IceServerConfig::turn(
                    "turn:openrelay.metered.ca:80",
                    "openrelayproject",
                    "openrelayproject",
                ),
                IceServerConfig::turn(
                    "turn:openrelay.metered.ca:443",
                    "openrelayproject",
                    "openrelayproject",
                ),
                IceServerConfig::turn(
                    "turn:openrelay.metered.ca:443?transport=tcp",
                    "openrelayproject",
                    "openrelayproject",
                ),
            ],
            transport_policy: IcePolicy::All,
            candidate_pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_checking_timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    pub reannounce_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_checking_timeout_secs: 15,
            retry_delay_secs: 2,
            max_retries: 1,
            reannounce_delay_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            ice_checking_timeout: Duration::from_secs(self.ice_checking_timeout_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            max_retries: self.max_retries,
            reannounce_delay: Duration::from_millis(self.reannounce_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub liveness_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 20,
            ping_interval_secs: 25,
            liveness_timeout_secs: 60,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 5000,
        }
    }
}

impl SignalingConfig {
    fn validate(&self) -> Result<(), ConfigErrors> {
        let periods = [
            ("signaling.connect_timeout_secs", self.connect_timeout_secs),
            ("signaling.ping_interval_secs", self.ping_interval_secs),
            ("signaling.liveness_timeout_secs", self.liveness_timeout_secs),
        ];
        match periods.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigErrors::Zero(key)),
            None => Ok(()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }
}
