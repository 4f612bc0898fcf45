//! Agent configuration
//!
//! Values are resolved in three layers, later ones winning:
//!
//! ```text
//! built-in defaults ──► optional TOML file ──► environment variables
//! ```
//!
//! The TOML file is looked up at `$FIREPLACECTL_CONFIG`, falling back to
//! `~/.config/fireplacectl/config.toml`. A missing file is not an error; the
//! broker credentials, however, must come from somewhere or startup fails.
//! Every value is validated here so nothing downstream has to guess.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_DIR: &str = ".config/fireplacectl";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "FIREPLACECTL_CONFIG";

const DEFAULT_HOST: &str = "mosquitto.data";
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_CLIENT_ID: &str = "fireplacectl";
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
// rumqttc rejects anything shorter
const MIN_KEEP_ALIVE_SECS: u64 = 5;
const DEFAULT_RELAY_PIN: u8 = 17;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("'{0}' not set")]
    Missing(&'static str),

    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Which relay driver backs the actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayDriver {
    /// Raspberry Pi GPIO through rppal
    #[default]
    Gpio,
    /// In-memory relay, for running off-device
    Simulated,
}

impl FromStr for RelayDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpio" => Ok(RelayDriver::Gpio),
            "simulated" => Ok(RelayDriver::Simulated),
            other => Err(format!("unknown relay driver '{}'", other)),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive: Duration,
}

// Hand-written so the password never ends up in a log line
impl fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// BCM pin number
    pub pin: u8,
    pub active_high: bool,
    pub driver: RelayDriver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Upper bound for the first CONNACK
    pub connect_timeout: Duration,
    /// Upper bound for each acknowledgement awaited during shutdown
    pub flush_timeout: Duration,
    /// Pause between reconnect attempts after the link dropped
    pub reconnect_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            flush_timeout: Duration::from_secs(DEFAULT_FLUSH_TIMEOUT_SECS),
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
        }
    }
}

/// Fully resolved and validated configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub mqtt: MqttSettings,
    pub relay: RelaySettings,
    pub session: SessionSettings,
}

/// Raw shape of the optional TOML file; every field may be left out.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub mqtt: FileMqtt,
    pub relay: FileRelay,
    pub session: FileSession,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileMqtt {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_secs: Option<u64>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileRelay {
    pub pin: Option<u8>,
    pub active_high: Option<bool>,
    pub driver: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileSession {
    pub connect_timeout_secs: Option<u64>,
    pub flush_timeout_secs: Option<u64>,
    pub reconnect_delay_secs: Option<u64>,
}

impl FileConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads the file at `path`, treating a missing file as empty.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                info!("Loading configuration from {}", path.display());
                Self::from_toml_str(&content, path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl AgentConfig {
    /// Loads the configuration from the process environment and the optional file.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let path = config_path(&env);
        let file = FileConfig::load(&path)?;
        Self::resolve(file, env)
    }

    /// Layers `env` over `file` over the defaults and validates the result.
    pub fn resolve<F>(file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = env("MQTT_HOST")
            .or(file.mqtt.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        if host.trim().is_empty() {
            return Err(invalid("MQTT_HOST", "must not be empty"));
        }

        let port = match env("MQTT_PORT") {
            Some(raw) => parse_port(&raw)?,
            None => file.mqtt.port.unwrap_or(DEFAULT_PORT),
        };
        if port == 0 {
            return Err(invalid("MQTT_PORT", "must not be 0"));
        }

        let username = required("MQTT_USERNAME", env("MQTT_USERNAME").or(file.mqtt.username))?;
        let password = required("MQTT_PASSWORD", env("MQTT_PASSWORD").or(file.mqtt.password))?;

        let client_id = env("MQTT_CLIENT_ID")
            .or(file.mqtt.client_id)
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
        if client_id.trim().is_empty() {
            return Err(invalid("MQTT_CLIENT_ID", "must not be empty"));
        }

        let keep_alive_secs = file.mqtt.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS);
        if keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(invalid(
                "mqtt.keep_alive_secs",
                format!("must be at least {} seconds", MIN_KEEP_ALIVE_SECS),
            ));
        }

        let pin = match env("RELAY_PIN") {
            Some(raw) => raw
                .trim()
                .parse::<u8>()
                .map_err(|e| invalid("RELAY_PIN", format!("'{}': {}", raw, e)))?,
            None => file.relay.pin.unwrap_or(DEFAULT_RELAY_PIN),
        };

        let driver = match env("RELAY_DRIVER").or(file.relay.driver) {
            Some(raw) => raw
                .parse::<RelayDriver>()
                .map_err(|e| invalid("RELAY_DRIVER", e))?,
            None => RelayDriver::default(),
        };

        let defaults = SessionSettings::default();
        let session = SessionSettings {
            connect_timeout: positive_secs(
                "session.connect_timeout_secs",
                file.session.connect_timeout_secs,
                defaults.connect_timeout,
            )?,
            flush_timeout: positive_secs(
                "session.flush_timeout_secs",
                file.session.flush_timeout_secs,
                defaults.flush_timeout,
            )?,
            reconnect_delay: file
                .session
                .reconnect_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_delay),
        };

        Ok(Self {
            mqtt: MqttSettings {
                host,
                port,
                username,
                password,
                client_id,
                keep_alive: Duration::from_secs(keep_alive_secs),
            },
            relay: RelaySettings {
                pin,
                active_high: file.relay.active_high.unwrap_or(true),
                driver,
            },
            session,
        })
    }
}

fn config_path<F>(env: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = env(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|e| invalid("MQTT_PORT", format!("'{}': {}", raw, e)))
}

fn required(key: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn positive_secs(
    key: &'static str,
    value: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(invalid(key, "must be greater than 0")),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}
