// src/discovery.rs
//
// Home Assistant MQTT discovery.
//
// Every enabled, published device gets retained config messages under the
// discovery prefix; devices that leave the published set get an empty
// retained payload at the same topics so the hub forgets them.

use serde_json::{json, Value};

use crate::config::{AppConfig, DeviceConfig, DeviceKind};
use crate::projector::OutboundMessage;

/// The complete retained discovery set for a configuration.
pub fn discovery_messages(config: &AppConfig) -> Vec<OutboundMessage> {
    let base = &config.mqtt.base_topic;
    let prefix = &config.mqtt.discovery_prefix;
    let mut messages = Vec::new();

    messages.push(OutboundMessage::retained(
        format!("{prefix}/button/cerebro2mqtt_poll_all/config"),
        json!({
            "name": "Cerebro Polling",
            "unique_id": "cerebro2mqtt_poll_all",
            "command_topic": format!("{base}/poll_all/set"),
            "payload_press": "PRESS",
            "icon": "mdi:refresh",
            "device": {
                "identifiers": ["cerebro2mqtt_bridge"],
                "name": "Cerebro2MQTT Bridge",
                "manufacturer": "Custom",
                "model": "BUS-MQTT",
            },
        }),
    ));

    for device in &config.boards {
        if device.enabled && device.publish_enabled {
            messages.extend(device_messages(device, base, prefix));
        } else {
            messages.extend(clear_messages(device, prefix));
        }
    }

    messages
}

fn hub_device(device: &DeviceConfig) -> Value {
    json!({
        "identifiers": [format!("cerebro2mqtt_{}", device.id)],
        "name": device.name,
        "manufacturer": "AlgoDomo",
        "model": device.kind.as_str(),
    })
}

fn device_messages(device: &DeviceConfig, base: &str, prefix: &str) -> Vec<OutboundMessage> {
    let slug = device.topic_slug();
    let topic_prefix = format!("{base}/{slug}");
    let id = &device.id;
    let hub_device = hub_device(device);
    let mut messages = Vec::new();

    messages.push(OutboundMessage::retained(
        format!("{prefix}/button/cerebro2mqtt_{id}_poll/config"),
        json!({
            "name": format!("{} Polling", device.name),
            "unique_id": format!("cerebro2mqtt_{id}_poll"),
            "command_topic": format!("{topic_prefix}/poll/set"),
            "payload_press": "PRESS",
            "icon": "mdi:refresh",
            "device": hub_device.clone(),
        }),
    ));

    match device.kind {
        DeviceKind::Lights => {
            for channel in device.channels() {
                messages.push(OutboundMessage::retained(
                    format!("{prefix}/switch/cerebro2mqtt_{id}_ch{channel}/config"),
                    json!({
                        "name": format!("{} CH{channel}", device.name),
                        "unique_id": format!("cerebro2mqtt_{id}_ch{channel}"),
                        "command_topic": format!("{topic_prefix}/ch/{channel}/set"),
                        "state_topic": format!("{topic_prefix}/ch/{channel}/state"),
                        "payload_on": "ON",
                        "payload_off": "OFF",
                        "device": hub_device.clone(),
                    }),
                ));
            }
        }
        DeviceKind::Shutters => {
            messages.push(OutboundMessage::retained(
                format!("{prefix}/cover/cerebro2mqtt_{id}/config"),
                json!({
                    "name": device.name,
                    "unique_id": format!("cerebro2mqtt_{id}"),
                    "command_topic": format!("{topic_prefix}/set"),
                    "state_topic": format!("{topic_prefix}/state"),
                    "payload_open": "OPEN",
                    "payload_close": "CLOSE",
                    "payload_stop": "STOP",
                    "state_open": "open",
                    "state_opening": "opening",
                    "state_closed": "closed",
                    "state_closing": "closing",
                    "device": hub_device.clone(),
                }),
            ));
        }
        DeviceKind::Dimmer => {
            messages.push(OutboundMessage::retained(
                format!("{prefix}/light/cerebro2mqtt_{id}/config"),
                json!({
                    "name": device.name,
                    "unique_id": format!("cerebro2mqtt_{id}"),
                    "command_topic": format!("{topic_prefix}/set"),
                    "state_topic": format!("{topic_prefix}/state"),
                    "brightness_command_topic": format!("{topic_prefix}/brightness/set"),
                    "brightness_state_topic": format!("{topic_prefix}/brightness/state"),
                    "payload_on": "ON",
                    "payload_off": "OFF",
                    "device": hub_device.clone(),
                }),
            ));
        }
        DeviceKind::Thermostat => {
            messages.push(OutboundMessage::retained(
                format!("{prefix}/sensor/cerebro2mqtt_{id}_temperature/config"),
                json!({
                    "name": format!("{} Temperature", device.name),
                    "unique_id": format!("cerebro2mqtt_{id}_temperature"),
                    "state_topic": format!("{topic_prefix}/temperature/state"),
                    "unit_of_measurement": "C",
                    "device_class": "temperature",
                    "device": hub_device.clone(),
                }),
            ));
            messages.push(OutboundMessage::retained(
                format!("{prefix}/number/cerebro2mqtt_{id}_setpoint/config"),
                json!({
                    "name": format!("{} Setpoint", device.name),
                    "unique_id": format!("cerebro2mqtt_{id}_setpoint"),
                    "command_topic": format!("{topic_prefix}/setpoint/set"),
                    "state_topic": format!("{topic_prefix}/setpoint/state"),
                    "mode": "box",
                    "min": 5,
                    "max": 35,
                    "step": 0.5,
                    "unit_of_measurement": "C",
                    "device": hub_device.clone(),
                }),
            ));
            messages.push(OutboundMessage::retained(
                format!("{prefix}/select/cerebro2mqtt_{id}_season/config"),
                json!({
                    "name": format!("{} Season", device.name),
                    "unique_id": format!("cerebro2mqtt_{id}_season"),
                    "command_topic": format!("{topic_prefix}/season/set"),
                    "state_topic": format!("{topic_prefix}/season/state"),
                    "options": ["WINTER", "SUMMER"],
                    "device": hub_device.clone(),
                }),
            ));
        }
    }

    messages
}

/// Empty retained payloads that remove a device from the hub registry.
fn clear_messages(device: &DeviceConfig, prefix: &str) -> Vec<OutboundMessage> {
    let id = &device.id;
    let mut messages = vec![OutboundMessage::retained(
        format!("{prefix}/button/cerebro2mqtt_{id}_poll/config"),
        "",
    )];

    match device.kind {
        DeviceKind::Lights => {
            for channel in device.channels() {
                messages.push(OutboundMessage::retained(
                    format!("{prefix}/switch/cerebro2mqtt_{id}_ch{channel}/config"),
                    "",
                ));
            }
        }
        DeviceKind::Shutters => {
            messages.push(OutboundMessage::retained(
                format!("{prefix}/cover/cerebro2mqtt_{id}/config"),
                "",
            ));
        }
        DeviceKind::Dimmer => {
            messages.push(OutboundMessage::retained(
                format!("{prefix}/light/cerebro2mqtt_{id}/config"),
                "",
            ));
        }
        DeviceKind::Thermostat => {
            messages.push(OutboundMessage::retained(
                format!("{prefix}/sensor/cerebro2mqtt_{id}_temperature/config"),
                "",
            ));
            messages.push(OutboundMessage::retained(
                format!("{prefix}/number/cerebro2mqtt_{id}_setpoint/config"),
                "",
            ));
            messages.push(OutboundMessage::retained(
                format!("{prefix}/select/cerebro2mqtt_{id}_season/config"),
                "",
            ));
        }
    }

    messages
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Payload;

    fn device(kind: DeviceKind) -> DeviceConfig {
        DeviceConfig {
            id: "b1".to_string(),
            name: "Sala".to_string(),
            kind,
            address: 7,
            channel_start: 1,
            channel_end: if kind == DeviceKind::Lights { 2 } else { 1 },
            topic: String::new(),
            enabled: true,
            publish_enabled: true,
        }
    }

    #[test]
    fn test_global_poll_button_always_present() {
        let config = AppConfig::default();
        let messages = discovery_messages(&config);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].topic,
            "homeassistant/button/cerebro2mqtt_poll_all/config"
        );
        assert!(messages[0].retain);
    }

    #[test]
    fn test_lights_discovery_one_switch_per_channel() {
        let mut config = AppConfig::default();
        config.boards.push(device(DeviceKind::Lights));

        let messages = discovery_messages(&config);
        let switches: Vec<_> = messages
            .iter()
            .filter(|m| m.topic.contains("/switch/"))
            .collect();
        assert_eq!(switches.len(), 2);
        assert_eq!(
            switches[0].topic,
            "homeassistant/switch/cerebro2mqtt_b1_ch1/config"
        );
        match &switches[0].payload {
            Payload::Json(value) => {
                assert_eq!(value["command_topic"], "cerebro2mqtt/sala/ch/1/set");
                assert_eq!(value["state_topic"], "cerebro2mqtt/sala/ch/1/state");
            }
            other => panic!("expected json payload, got {other:?}"),
        }
    }

    #[test]
    fn test_thermostat_discovery_components() {
        let mut config = AppConfig::default();
        config.boards.push(device(DeviceKind::Thermostat));

        let messages = discovery_messages(&config);
        let topics: Vec<_> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert!(topics.contains(&"homeassistant/sensor/cerebro2mqtt_b1_temperature/config"));
        assert!(topics.contains(&"homeassistant/number/cerebro2mqtt_b1_setpoint/config"));
        assert!(topics.contains(&"homeassistant/select/cerebro2mqtt_b1_season/config"));
        assert!(topics.contains(&"homeassistant/button/cerebro2mqtt_b1_poll/config"));
    }

    #[test]
    fn test_disabled_device_gets_cleared() {
        let mut config = AppConfig::default();
        let mut d = device(DeviceKind::Dimmer);
        d.publish_enabled = false;
        config.boards.push(d);

        let messages = discovery_messages(&config);
        let light = messages
            .iter()
            .find(|m| m.topic == "homeassistant/light/cerebro2mqtt_b1/config")
            .expect("clear message present");
        assert_eq!(light.payload, Payload::Text(String::new()));
        assert!(light.retain);
    }
}
