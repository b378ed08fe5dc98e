//! Configuration file parsing and structures.
//!
//! glowd uses TOML for declarative configuration. Each `[cards.<name>]`
//! section binds one target entity and enables the optional timer and motion
//! automations for it. Static file values can later be overridden by the
//! per-entity settings overlay kept in the persistence store.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::LevelFilter;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub api: Option<ApiConfig>,

    #[serde(default)]
    pub gateways: GatewaysConfig,

    /// Card definitions, keyed by card name
    #[serde(default)]
    pub cards: HashMap<String, CardConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-module level overrides, e.g. `"glowd::gateway" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

/// Persistence store configuration
///
/// Without a path the store is memory-only and countdowns do not survive a
/// restart.
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// HTTP status API configuration
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,

    #[serde(default = "default_api_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8465
}

/// Gateway configuration container
#[derive(Debug, Default, Deserialize)]
pub struct GatewaysConfig {
    /// MQTT statestream gateway
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

/// Configuration for the MQTT gateway
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address
    pub broker: String,

    /// MQTT broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// MQTT client ID
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Base topic of the Home Assistant MQTT statestream (default: "statestream")
    #[serde(default = "default_statestream_prefix")]
    pub statestream_prefix: String,

    /// Base topic service calls are published under (default: "glowd/call")
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,

    /// Optional username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for authentication
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "glowd".to_string()
}

fn default_statestream_prefix() -> String {
    "statestream".to_string()
}

fn default_command_prefix() -> String {
    "glowd/call".to_string()
}

/// A single card definition
///
/// The target entity is required; everything else has the documented
/// defaults (timer 300 s, off-delay 60 s).
#[derive(Debug, Clone, Deserialize)]
pub struct CardConfig {
    /// Target entity controlled by this card (e.g. "light.bedroom")
    pub entity: String,

    /// Display name; falls back to the entity id
    #[serde(default)]
    pub name: Option<String>,

    /// Auto-off countdown after the target activates
    #[serde(default)]
    pub timer_enabled: bool,

    /// Countdown length in seconds
    #[serde(default = "default_timer_duration")]
    pub timer_duration: u64,

    /// Motion-sensor driven on/off control
    #[serde(default)]
    pub motion_enabled: bool,

    /// Binary sensor watched for motion
    #[serde(default)]
    pub motion_sensor: Option<String>,

    /// Delay in seconds before acting on a motion-cleared signal
    #[serde(default = "default_motion_off_delay")]
    pub motion_off_delay: u64,

    /// Brightness percentage (0-100) applied on motion turn-on, when the
    /// target supports brightness
    #[serde(default)]
    pub default_brightness: Option<u8>,
}

fn default_timer_duration() -> u64 {
    300
}

fn default_motion_off_delay() -> u64 {
    60
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    ///
    /// All card problems are collected and reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let mut targets: HashMap<&str, &str> = HashMap::new();

        for (name, card) in &self.cards {
            if card.entity.is_empty() {
                problems.push(format!("card '{}': entity is required", name));
                continue;
            }
            if !card.entity.contains('.') {
                problems.push(format!(
                    "card '{}': entity '{}' is not a <domain>.<object> id",
                    name, card.entity
                ));
            }
            if let Some(other) = targets.insert(card.entity.as_str(), name.as_str()) {
                problems.push(format!(
                    "cards '{}' and '{}' both control entity '{}'",
                    other, name, card.entity
                ));
            }
            if card.motion_enabled {
                match &card.motion_sensor {
                    Some(sensor) if !sensor.is_empty() => {}
                    _ => problems.push(format!(
                        "card '{}': motion_enabled requires motion_sensor",
                        name
                    )),
                }
            }
            if let Some(pct) = card.default_brightness {
                if pct > 100 {
                    problems.push(format!(
                        "card '{}': default_brightness {} exceeds 100 percent",
                        name, pct
                    ));
                }
            }
        }

        // A gateway section isn't strictly required (tests drive the engine
        // directly), but cards without one can never see an event.
        if !self.cards.is_empty() && self.gateways.mqtt.is_none() {
            problems.push("cards are configured but no gateway is".to_string());
        }

        let sensors: HashSet<&str> = self
            .cards
            .values()
            .filter_map(|c| c.motion_sensor.as_deref())
            .collect();
        for sensor in sensors {
            if !sensor.is_empty() && !sensor.starts_with("binary_sensor.") {
                tracing::warn!("motion sensor '{}' is not a binary_sensor entity", sensor);
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems.join("; ")))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [logging]
            level = "debug"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.cards.is_empty());
        assert!(config.store.path.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_card_defaults() {
        let toml = r#"
            [gateways.mqtt]
            broker = "localhost"

            [cards.bedroom]
            entity = "light.bedroom"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let card = config.cards.get("bedroom").unwrap();
        assert_eq!(card.entity, "light.bedroom");
        assert!(!card.timer_enabled);
        assert_eq!(card.timer_duration, 300);
        assert!(!card.motion_enabled);
        assert_eq!(card.motion_off_delay, 60);
        assert_eq!(card.default_brightness, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_card() {
        let toml = r#"
            [store]
            path = "/var/lib/glowd/store.json"

            [gateways.mqtt]
            broker = "broker.local"
            port = 8883
            username = "glowd"
            password = "secret"

            [cards.hallway]
            entity = "light.hallway"
            name = "Hallway"
            timer_enabled = true
            timer_duration = 120
            motion_enabled = true
            motion_sensor = "binary_sensor.hallway_motion"
            motion_off_delay = 30
            default_brightness = 80
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        let card = config.cards.get("hallway").unwrap();
        assert!(card.timer_enabled);
        assert_eq!(card.timer_duration, 120);
        assert_eq!(
            card.motion_sensor.as_deref(),
            Some("binary_sensor.hallway_motion")
        );
        assert_eq!(card.default_brightness, Some(80));

        let mqtt = config.gateways.mqtt.unwrap();
        assert_eq!(mqtt.broker, "broker.local");
        assert_eq!(mqtt.port, 8883);
        assert_eq!(mqtt.statestream_prefix, "statestream");
        assert_eq!(mqtt.command_prefix, "glowd/call");
    }

    #[test]
    fn test_missing_entity_rejected() {
        let toml = r#"
            [gateways.mqtt]
            broker = "localhost"

            [cards.broken]
            entity = ""
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("entity is required"));
    }

    #[test]
    fn test_motion_requires_sensor() {
        let toml = r#"
            [gateways.mqtt]
            broker = "localhost"

            [cards.hallway]
            entity = "light.hallway"
            motion_enabled = true
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("requires motion_sensor"));
    }

    #[test]
    fn test_duplicate_targets_rejected() {
        let toml = r#"
            [gateways.mqtt]
            broker = "localhost"

            [cards.a]
            entity = "light.shared"

            [cards.b]
            entity = "light.shared"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("both control"));
    }
}
