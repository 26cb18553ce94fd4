// src/config.rs
//
// Configuration model for the bridge: serial line parameters, MQTT broker
// settings, polling cadence, admin web endpoint, and the device table.
//
// Device ingress is deliberately tolerant: older config files carry a
// single `channel` key instead of `channel_start`/`channel_end`, and kind
// names in the installed base are Italian. Both shapes are accepted; the
// store writes the current shape back.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Device Kinds
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Lights,
    Shutters,
    Dimmer,
    Thermostat,
}

impl DeviceKind {
    /// Parse a kind name, accepting the legacy Italian values.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "lights" | "luci" => Some(Self::Lights),
            "shutters" | "tapparelle" => Some(Self::Shutters),
            "dimmer" => Some(Self::Dimmer),
            "thermostat" | "termostato" => Some(Self::Thermostat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lights => "lights",
            Self::Shutters => "shutters",
            Self::Dimmer => "dimmer",
            Self::Thermostat => "thermostat",
        }
    }
}

// ============================================================================
// Slugs
// ============================================================================

/// Derive an MQTT-safe identifier: lowercase, runs of non-alphanumerics
/// collapsed to `_`, leading/trailing `_` trimmed. Empty input falls back
/// to `"board"`.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_separator = false;

    for ch in value.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(ch);
        } else {
            pending_separator = true;
        }
    }

    if slug.is_empty() {
        "board".to_string()
    } else {
        slug
    }
}

// ============================================================================
// Device Records
// ============================================================================

/// One controller (or one logical device on a shared controller) on the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawDeviceConfig")]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub address: u8,
    pub channel_start: u8,
    pub channel_end: u8,
    pub topic: String,
    pub enabled: bool,
    pub publish_enabled: bool,
}

impl DeviceConfig {
    pub fn topic_slug(&self) -> String {
        if self.topic.trim().is_empty() {
            slugify(&self.name)
        } else {
            slugify(&self.topic)
        }
    }

    pub fn primary_channel(&self) -> u8 {
        self.channel_start
    }

    /// Channels addressed by this device. Only Lights span a range.
    pub fn channels(&self) -> Vec<u8> {
        if self.kind == DeviceKind::Lights {
            (self.channel_start..=self.channel_end).collect()
        } else {
            vec![self.channel_start]
        }
    }
}

/// Ingress shape for a device record. Accepts both the legacy `channel`
/// key and the `channel_start`/`channel_end` range.
#[derive(Deserialize)]
struct RawDeviceConfig {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "default_device_name")]
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default = "default_address")]
    address: i64,
    #[serde(default)]
    channel: Option<i64>,
    #[serde(default)]
    channel_start: Option<i64>,
    #[serde(default)]
    channel_end: Option<i64>,
    #[serde(default)]
    topic: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_true")]
    publish_enabled: bool,
}

impl From<RawDeviceConfig> for DeviceConfig {
    fn from(raw: RawDeviceConfig) -> Self {
        let kind = raw
            .kind
            .as_deref()
            .and_then(DeviceKind::parse)
            .unwrap_or(DeviceKind::Lights);

        let legacy_channel = raw.channel.unwrap_or(1);
        let channel_start = raw.channel_start.unwrap_or(legacy_channel);
        let mut channel_end = raw.channel_end.unwrap_or(channel_start);
        if kind != DeviceKind::Lights {
            channel_end = channel_start;
        }

        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            id,
            name: raw.name.trim().to_string(),
            kind,
            address: clamp_byte(raw.address),
            channel_start: clamp_byte(channel_start),
            channel_end: clamp_byte(channel_end),
            topic: raw.topic.trim().to_string(),
            enabled: raw.enabled,
            publish_enabled: raw.publish_enabled,
        }
    }
}

fn clamp_byte(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

fn default_device_name() -> String {
    "Board".to_string()
}

fn default_address() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    #[serde(default = "default_serial_timeout")]
    pub timeout_sec: f64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baudrate: default_baudrate(),
            bytesize: default_bytesize(),
            parity: default_parity(),
            stopbits: default_stopbits(),
            timeout_sec: default_serial_timeout(),
        }
    }
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baudrate() -> u32 {
    9600
}
fn default_bytesize() -> u8 {
    8
}
fn default_parity() -> String {
    "N".to_string()
}
fn default_stopbits() -> u8 {
    1
}
fn default_serial_timeout() -> f64 {
    0.25
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: String::new(),
            password: String::new(),
            client_id: default_client_id(),
            base_topic: default_base_topic(),
            discovery_prefix: default_discovery_prefix(),
            keepalive: default_keepalive(),
        }
    }
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "cerebro2mqtt".to_string()
}
fn default_base_topic() -> String {
    "cerebro2mqtt".to_string()
}
fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}
fn default_keepalive() -> u64 {
    60
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_poll_interval")]
    pub interval_sec: u64,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_sec: default_poll_interval(),
            auto_start: true,
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebSettings {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}
fn default_web_port() -> u16 {
    80
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub restart_command: String,
}

// ============================================================================
// Top Level
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub web: WebSettings,
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub boards: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Clean up fields whose raw form tolerates junk: the base topic must
    /// not carry surrounding slashes, and empty strings fall back to
    /// defaults.
    pub fn normalize(&mut self) {
        let base = self.mqtt.base_topic.trim().trim_matches('/').to_string();
        self.mqtt.base_topic = if base.is_empty() {
            default_base_topic()
        } else {
            base
        };
        if self.mqtt.host.trim().is_empty() {
            self.mqtt.host = default_mqtt_host();
        }
        if self.mqtt.client_id.trim().is_empty() {
            self.mqtt.client_id = default_client_id();
        }
        if self.mqtt.discovery_prefix.trim().is_empty() {
            self.mqtt.discovery_prefix = default_discovery_prefix();
        }
        if self.serial.port.trim().is_empty() {
            self.serial.port = default_serial_port();
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid serial baudrate: {0}")]
    InvalidBaudrate(u32),
    #[error("invalid MQTT port: {0}")]
    InvalidMqttPort(u16),
    #[error("polling interval must be >= 1")]
    InvalidPollingInterval(u64),
    #[error("invalid web port: {0}")]
    InvalidWebPort(u16),
    #[error("every device needs a name")]
    EmptyDeviceName,
    #[error("invalid address for {name}: {address}")]
    InvalidAddress { name: String, address: u8 },
    #[error("invalid channel range for {name}: {start}..{end}")]
    InvalidChannelRange { name: String, start: u8, end: u8 },
    #[error("duplicate topic: {0}")]
    DuplicateTopic(String),
    #[error("failed to read config file: {0}")]
    Read(String),
    #[error("failed to write config file: {0}")]
    Write(String),
    #[error("invalid config payload: {0}")]
    Parse(String),
}

/// Validate a configuration before it is committed or acted on.
pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.serial.baudrate == 0 {
        return Err(ConfigError::InvalidBaudrate(config.serial.baudrate));
    }
    if config.mqtt.port == 0 {
        return Err(ConfigError::InvalidMqttPort(config.mqtt.port));
    }
    if config.polling.interval_sec < 1 {
        return Err(ConfigError::InvalidPollingInterval(
            config.polling.interval_sec,
        ));
    }
    if config.web.port == 0 {
        return Err(ConfigError::InvalidWebPort(config.web.port));
    }

    let mut seen_topics = std::collections::HashSet::new();

    for device in &config.boards {
        if device.name.is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        if device.address < 1 || device.address > 254 {
            return Err(ConfigError::InvalidAddress {
                name: device.name.clone(),
                address: device.address,
            });
        }

        let (start, end) = (device.channel_start, device.channel_end);
        let range_ok = match device.kind {
            DeviceKind::Lights => (1..=8).contains(&start) && (1..=8).contains(&end) && start <= end,
            DeviceKind::Shutters => (1..=8).contains(&start),
            DeviceKind::Dimmer | DeviceKind::Thermostat => start >= 1,
        };
        if !range_ok {
            return Err(ConfigError::InvalidChannelRange {
                name: device.name.clone(),
                start,
                end,
            });
        }

        // Slug uniqueness only matters for devices that take part in the
        // topic namespace.
        if device.enabled {
            let slug = device.topic_slug();
            if !seen_topics.insert(slug.clone()) {
                return Err(ConfigError::DuplicateTopic(slug));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, kind: DeviceKind, address: u8) -> DeviceConfig {
        DeviceConfig {
            id: "test-id".to_string(),
            name: name.to_string(),
            kind,
            address,
            channel_start: 1,
            channel_end: 1,
            topic: String::new(),
            enabled: true,
            publish_enabled: true,
        }
    }

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Soggiorno Luci"), "soggiorno_luci");
        assert_eq!(slugify("  Bagno -- piano 2 "), "bagno_piano_2");
        assert_eq!(slugify("UPPER"), "upper");
    }

    #[test]
    fn test_slugify_fallback_and_idempotence() {
        assert_eq!(slugify(""), "board");
        assert_eq!(slugify("!!!"), "board");
        assert_eq!(slugify(&slugify("Sala / TV")), slugify("Sala / TV"));
        assert_eq!(slugify("sala tv"), slugify("SALA TV"));
    }

    #[test]
    fn test_device_kind_parse_accepts_legacy_names() {
        assert_eq!(DeviceKind::parse("luci"), Some(DeviceKind::Lights));
        assert_eq!(DeviceKind::parse("tapparelle"), Some(DeviceKind::Shutters));
        assert_eq!(DeviceKind::parse("termostato"), Some(DeviceKind::Thermostat));
        assert_eq!(DeviceKind::parse("Dimmer"), Some(DeviceKind::Dimmer));
        assert_eq!(DeviceKind::parse("toaster"), None);
    }

    #[test]
    fn test_device_ingress_legacy_channel_key() {
        let device: DeviceConfig = serde_json::from_value(serde_json::json!({
            "name": "Sala",
            "type": "luci",
            "address": 10,
            "channel": 3
        }))
        .unwrap();

        assert_eq!(device.kind, DeviceKind::Lights);
        assert_eq!(device.channel_start, 3);
        assert_eq!(device.channel_end, 3);
        assert!(device.enabled);
        assert!(device.publish_enabled);
        assert!(!device.id.is_empty());
    }

    #[test]
    fn test_device_ingress_range_shape() {
        let device: DeviceConfig = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "name": "Quadro",
            "type": "lights",
            "address": 12,
            "channel_start": 2,
            "channel_end": 6
        }))
        .unwrap();

        assert_eq!(device.id, "abc");
        assert_eq!(device.channels(), vec![2, 3, 4, 5, 6]);
        assert_eq!(device.primary_channel(), 2);
    }

    #[test]
    fn test_device_ingress_forces_single_channel_for_non_lights() {
        let device: DeviceConfig = serde_json::from_value(serde_json::json!({
            "name": "Tapparella",
            "type": "shutters",
            "address": 5,
            "channel_start": 2,
            "channel_end": 4
        }))
        .unwrap();

        assert_eq!(device.channel_end, 2);
        assert_eq!(device.channels(), vec![2]);
    }

    #[test]
    fn test_device_ingress_unknown_kind_falls_back_to_lights() {
        let device: DeviceConfig = serde_json::from_value(serde_json::json!({
            "name": "X",
            "type": "unknown",
            "address": 3
        }))
        .unwrap();
        assert_eq!(device.kind, DeviceKind::Lights);
    }

    #[test]
    fn test_topic_slug_prefers_topic_override() {
        let mut d = device("Luce Sala", DeviceKind::Lights, 1);
        assert_eq!(d.topic_slug(), "luce_sala");
        d.topic = "Custom Topic".to_string();
        assert_eq!(d.topic_slug(), "custom_topic");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let mut config = AppConfig::default();
        config.serial.baudrate = 0;
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidBaudrate(0))
        ));

        let mut config = AppConfig::default();
        config.mqtt.port = 0;
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidMqttPort(0))
        ));

        let mut config = AppConfig::default();
        config.polling.interval_sec = 0;
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidPollingInterval(0))
        ));

        let mut config = AppConfig::default();
        config.web.port = 0;
        assert!(matches!(validate(&config), Err(ConfigError::InvalidWebPort(0))));
    }

    #[test]
    fn test_validate_rejects_bad_devices() {
        let mut config = AppConfig::default();
        config.boards.push(device("", DeviceKind::Lights, 1));
        assert!(matches!(validate(&config), Err(ConfigError::EmptyDeviceName)));

        let mut config = AppConfig::default();
        config.boards.push(device("A", DeviceKind::Lights, 0));
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidAddress { .. })
        ));

        let mut config = AppConfig::default();
        let mut d = device("A", DeviceKind::Lights, 1);
        d.channel_start = 3;
        d.channel_end = 2;
        config.boards.push(d);
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidChannelRange { .. })
        ));

        let mut config = AppConfig::default();
        let mut d = device("A", DeviceKind::Shutters, 1);
        d.channel_start = 9;
        d.channel_end = 9;
        config.boards.push(d);
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidChannelRange { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_enabled_slugs() {
        let mut config = AppConfig::default();
        config.boards.push(device("Sala", DeviceKind::Lights, 1));
        config
            .boards
            .push(device("Sala", DeviceKind::Thermostat, 2));
        assert!(matches!(
            validate(&config),
            Err(ConfigError::DuplicateTopic(slug)) if slug == "sala"
        ));

        // A disabled duplicate is fine
        let mut config = AppConfig::default();
        config.boards.push(device("Sala", DeviceKind::Lights, 1));
        let mut d = device("Sala", DeviceKind::Thermostat, 2);
        d.enabled = false;
        config.boards.push(d);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_normalize_trims_base_topic() {
        let mut config = AppConfig::default();
        config.mqtt.base_topic = "/casa/bus/".to_string();
        config.normalize();
        assert_eq!(config.mqtt.base_topic, "casa/bus");

        config.mqtt.base_topic = "  ".to_string();
        config.normalize();
        assert_eq!(config.mqtt.base_topic, "cerebro2mqtt");
    }
}
