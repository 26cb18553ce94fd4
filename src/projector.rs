// src/projector.rs
//
// Projection of a polling snapshot into the published state topics of one
// device. Pure data-in data-out so every kind's mapping is testable
// without a broker.

use serde_json::json;

use crate::broker::Payload;
use crate::config::{DeviceConfig, DeviceKind};
use crate::protocol::{bus_dimmer_to_percent, PollingStatus};

/// One message bound for the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Payload,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn retained(topic: String, payload: impl Into<Payload>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: true,
        }
    }

    pub fn transient(topic: String, payload: impl Into<Payload>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Result of projecting one snapshot for one device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Projection {
    pub messages: Vec<OutboundMessage>,
    /// Non-zero dimmer percent to remember for the next bare `ON`
    pub dimmer_percent: Option<u8>,
}

pub fn relay_bit_set(outputs: u8, channel: u8) -> bool {
    outputs & (1u8 << (channel - 1)) != 0
}

pub fn percent_to_brightness(percent: u8) -> i64 {
    ((f64::from(percent) / 100.0) * 255.0).round() as i64
}

/// Map a polling snapshot onto the retained state topics of `device`.
/// Devices with publishing disabled project nothing.
pub fn project_polling(
    device: &DeviceConfig,
    polling: &PollingStatus,
    base_topic: &str,
) -> Projection {
    if !device.publish_enabled {
        return Projection::default();
    }

    let prefix = format!("{base_topic}/{}", device.topic_slug());
    let mut projection = Projection::default();

    projection.messages.push(OutboundMessage::transient(
        format!("{prefix}/polling/raw"),
        json!({
            "device_type": polling.device_type,
            "outputs": polling.outputs,
            "inputs": polling.inputs,
            "dimmer_0_10": polling.dimmer_0_10,
            "temperature": polling.temperature,
            "temperature_setpoint": polling.temperature_setpoint,
            "season": polling.season,
            "address": device.address,
        }),
    ));

    match device.kind {
        DeviceKind::Lights => {
            let channels = device.channels();
            let mut last_state = "OFF";
            for &channel in &channels {
                last_state = if relay_bit_set(polling.outputs, channel) {
                    "ON"
                } else {
                    "OFF"
                };
                projection.messages.push(OutboundMessage::retained(
                    format!("{prefix}/ch/{channel}/state"),
                    last_state,
                ));
            }
            if channels.len() == 1 {
                projection
                    .messages
                    .push(OutboundMessage::retained(format!("{prefix}/state"), last_state));
            }
        }
        DeviceKind::Shutters => {
            let state = if relay_bit_set(polling.outputs, device.primary_channel()) {
                "open"
            } else {
                "closed"
            };
            projection
                .messages
                .push(OutboundMessage::retained(format!("{prefix}/state"), state));
        }
        DeviceKind::Dimmer => {
            let percent = bus_dimmer_to_percent(polling.dimmer_0_10);
            projection.messages.push(OutboundMessage::retained(
                format!("{prefix}/state"),
                if percent > 0 { "ON" } else { "OFF" },
            ));
            projection.messages.push(OutboundMessage::retained(
                format!("{prefix}/brightness/state"),
                percent_to_brightness(percent),
            ));
            if percent > 0 {
                projection.dimmer_percent = Some(percent);
            }
        }
        DeviceKind::Thermostat => {
            projection.messages.push(OutboundMessage::retained(
                format!("{prefix}/temperature/state"),
                format!("{:.1}", polling.temperature),
            ));
            projection.messages.push(OutboundMessage::retained(
                format!("{prefix}/setpoint/state"),
                format!("{:.1}", polling.temperature_setpoint),
            ));
            projection.messages.push(OutboundMessage::retained(
                format!("{prefix}/season/state"),
                if polling.season == 1 { "SUMMER" } else { "WINTER" },
            ));
        }
    }

    projection
}

// ============================================================================
// Tests
// ============================================================================
