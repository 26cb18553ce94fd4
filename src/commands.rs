// src/commands.rs
//
// Broker command routing and the per-kind handlers.
//
// Every state-changing command follows the same confirmation discipline:
// send the frame and match its echo, then immediately poll the same
// address and compare the decoded snapshot against the desired state.
// When the readback fails, the echo outcome decides; published state then
// falls back to the locally desired value.

use tracing::{debug, warn};

use crate::config::{DeviceConfig, DeviceKind};
use crate::projector::{percent_to_brightness, relay_bit_set};
use crate::protocol::{
    build_dimmer_control, build_light_control, build_set_point_temperature, build_set_season,
    build_shutter_control, percent_to_bus_dimmer, ParsedFrame, CMD_DIMMER_CONTROL,
    CMD_LIGHT_CONTROL_FIFTH_ONWARD, CMD_LIGHT_CONTROL_FIRST_FOUR, CMD_SET_POINT_TEMPERATURE,
    CMD_SET_SEASON, DIMMER_DATA, LIGHT_DATA_RELAY_OFF, LIGHT_DATA_RELAY_ON,
};
use crate::service::BridgeCore;
use crate::transaction::{FrameMatcher, COMMAND_ACK_TIMEOUT};

// ============================================================================
// Payload Vocabulary
// ============================================================================

/// Shared ON/OFF vocabulary for switch-like commands.
pub(crate) fn parse_on_off(payload: &str) -> Option<bool> {
    match payload.trim().to_uppercase().as_str() {
        "ON" | "1" | "TRUE" | "OPEN" | "UP" => Some(true),
        "OFF" | "0" | "FALSE" | "CLOSE" | "DOWN" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_int(payload: &str) -> Option<i64> {
    payload.trim().parse::<f64>().ok().map(|v| v as i64)
}

/// Float with the comma accepted as decimal separator.
pub(crate) fn parse_float(payload: &str) -> Option<f64> {
    payload.trim().replace(',', ".").parse::<f64>().ok()
}

pub(crate) fn parse_season(payload: &str) -> Option<u8> {
    match payload.trim().to_uppercase().as_str() {
        "0" | "WINTER" | "INVERNO" => Some(0),
        "1" | "SUMMER" | "ESTATE" => Some(1),
        _ => None,
    }
}

/// Brightness payloads are a percent up to 100, a 0-255 scale above it.
pub(crate) fn brightness_to_percent(raw: i64) -> u8 {
    if raw <= 100 {
        raw.clamp(0, 100) as u8
    } else {
        (((raw as f64) / 255.0 * 100.0).round() as i64).clamp(0, 100) as u8
    }
}

/// Channel addressed by a `ch/{n}/set` command path.
pub(crate) fn parse_channel_path(command_path: &str) -> Option<u8> {
    command_path
        .strip_prefix("ch/")?
        .strip_suffix("/set")?
        .parse()
        .ok()
}

// ============================================================================
// Routing
// ============================================================================

impl BridgeCore {
    /// Route one inbound broker message. Everything that is not a
    /// recognized command topic is silently ignored, including our own
    /// state publications echoed back by the base subscription.
    pub(crate) async fn handle_command(&self, topic: &str, payload: &str) {
        let base = &self.config.mqtt.base_topic;

        if topic == format!("{base}/poll_all/set") {
            self.trigger_poll_all();
            return;
        }

        let Some(tail) = topic.strip_prefix(&format!("{base}/")) else {
            return;
        };
        let Some((slug, command_path)) = tail.split_once('/') else {
            return;
        };

        let Some(device) = self.index.by_slug(slug) else {
            return;
        };
        if !device.publish_enabled {
            return;
        }
        let device = device.clone();

        if command_path == "poll/set" {
            self.send_poll(device.address).await;
            return;
        }

        debug!(slug, command_path, payload, "device command");
        match device.kind {
            DeviceKind::Lights => self.handle_light_command(&device, command_path, payload).await,
            DeviceKind::Shutters => {
                self.handle_shutter_command(&device, command_path, payload).await
            }
            DeviceKind::Dimmer => self.handle_dimmer_command(&device, command_path, payload).await,
            DeviceKind::Thermostat => {
                self.handle_thermostat_command(&device, command_path, payload).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Lights
    // ------------------------------------------------------------------

    async fn handle_light_command(&self, device: &DeviceConfig, command_path: &str, payload: &str) {
        let (channel, publish_legacy_state) = if command_path == "set" {
            (device.primary_channel(), true)
        } else if let Some(channel) = parse_channel_path(command_path) {
            (channel, false)
        } else {
            return;
        };

        if !device.channels().contains(&channel) {
            warn!(device = %device.name, channel, "channel outside the configured range");
            return;
        }

        let Some(desired) = parse_on_off(payload) else {
            return;
        };

        let frame = match build_light_control(device.address, channel, desired) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device = %device.name, error = %e, "light frame rejected");
                return;
            }
        };

        let ack_ok = self
            .engine
            .send_with_ack(
                &frame,
                device.address,
                FrameMatcher::echo_of(&frame, 1),
                COMMAND_ACK_TIMEOUT,
            )
            .await
            .is_ok();

        let readback = self.request_polling_status(device.address).await;
        let (ok, poll_ok) = match &readback {
            Some(polling) => {
                self.apply_projection(device, polling).await;
                (relay_bit_set(polling.outputs, channel) == desired, true)
            }
            None => (ack_ok, false),
        };

        let channel_state = if desired { "ON" } else { "OFF" };
        if !ok {
            self.publish_action_result(
                device,
                "light_set",
                false,
                format!("timeout channel={channel} desired={channel_state}"),
            )
            .await;
            return;
        }

        if !poll_ok {
            self.publish_light_channel_state(device, channel, desired).await;
            if publish_legacy_state {
                let prefix = self.topic_prefix(device);
                self.publish(&format!("{prefix}/state"), channel_state, true).await;
            }
        }
        self.publish_action_result(
            device,
            "light_set",
            true,
            format!("channel={channel} state={channel_state}"),
        )
        .await;
    }

    // ------------------------------------------------------------------
    // Shutters
    // ------------------------------------------------------------------

    async fn handle_shutter_command(
        &self,
        device: &DeviceConfig,
        command_path: &str,
        payload: &str,
    ) {
        if command_path != "set" {
            return;
        }

        let (up, state) = match payload.trim().to_uppercase().as_str() {
            "OPEN" | "UP" | "ON" | "1" => (true, "opening"),
            "CLOSE" | "DOWN" | "OFF" | "0" => (false, "closing"),
            "STOP" => {
                warn!(device = %device.name, "shutter protocol has no STOP action");
                return;
            }
            _ => return,
        };

        let frame = match build_shutter_control(device.address, device.primary_channel(), up) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device = %device.name, error = %e, "shutter frame rejected");
                return;
            }
        };

        let ack_ok = self
            .engine
            .send_with_ack(
                &frame,
                device.address,
                FrameMatcher::echo_of(&frame, 2),
                COMMAND_ACK_TIMEOUT,
            )
            .await
            .is_ok();

        let readback = self.request_polling_status(device.address).await;
        let (ok, poll_ok) = match &readback {
            Some(polling) => {
                self.apply_projection(device, polling).await;
                (
                    relay_bit_set(polling.outputs, device.primary_channel()) == up,
                    true,
                )
            }
            None => (ack_ok, false),
        };

        if !ok {
            self.publish_action_result(
                device,
                "shutter_set",
                false,
                format!(
                    "timeout channel={} desired={state}",
                    device.primary_channel()
                ),
            )
            .await;
            return;
        }

        if !poll_ok {
            let prefix = self.topic_prefix(device);
            self.publish(&format!("{prefix}/state"), state, true).await;
        }
        self.publish_action_result(device, "shutter_set", true, state.to_string())
            .await;
    }

    // ------------------------------------------------------------------
    // Dimmer
    // ------------------------------------------------------------------

    async fn handle_dimmer_command(
        &self,
        device: &DeviceConfig,
        command_path: &str,
        payload: &str,
    ) {
        let percent: u8 = if command_path == "set" {
            let Some(on) = parse_on_off(payload) else {
                return;
            };
            if on {
                // Bare ON restores the last remembered level
                self.recall_dimmer_percent(device).unwrap_or(100)
            } else {
                0
            }
        } else if command_path == "brightness/set" {
            let Some(raw) = parse_int(payload) else {
                return;
            };
            brightness_to_percent(raw)
        } else {
            return;
        };

        let frame = match build_dimmer_control(device.address, percent) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device = %device.name, error = %e, "dimmer frame rejected");
                return;
            }
        };

        let ack_ok = self
            .engine
            .send_with_ack(
                &frame,
                device.address,
                FrameMatcher::echo_of(&frame, 2),
                COMMAND_ACK_TIMEOUT,
            )
            .await
            .is_ok();

        let readback = self.request_polling_status(device.address).await;
        let (ok, poll_ok) = match &readback {
            Some(polling) => {
                self.apply_projection(device, polling).await;
                // Both sides go through the write quantization; 9 reads
                // back as full scale.
                let wanted = dimmer_confirm_level(percent_to_bus_dimmer(percent));
                let observed = dimmer_confirm_level(polling.dimmer_0_10);
                (observed == wanted, true)
            }
            None => (ack_ok, false),
        };

        if percent > 0 {
            self.remember_dimmer_percent(device, percent);
        }

        if !ok {
            self.publish_action_result(
                device,
                "dimmer_set",
                false,
                format!("timeout desired_percent={percent}"),
            )
            .await;
            return;
        }

        if !poll_ok {
            let prefix = self.topic_prefix(device);
            self.publish(
                &format!("{prefix}/state"),
                if percent > 0 { "ON" } else { "OFF" },
                true,
            )
            .await;
            self.publish(
                &format!("{prefix}/brightness/state"),
                percent_to_brightness(percent),
                true,
            )
            .await;
        }
        self.publish_action_result(device, "dimmer_set", true, format!("percent={percent}"))
            .await;
    }

    // ------------------------------------------------------------------
    // Thermostat
    // ------------------------------------------------------------------

    async fn handle_thermostat_command(
        &self,
        device: &DeviceConfig,
        command_path: &str,
        payload: &str,
    ) {
        match command_path {
            "setpoint/set" => {
                let Some(setpoint) = parse_float(payload) else {
                    return;
                };
                self.handle_setpoint_command(device, setpoint).await;
            }
            "season/set" => {
                let Some(season) = parse_season(payload) else {
                    return;
                };
                self.handle_season_command(device, season).await;
            }
            _ => {}
        }
    }

    async fn handle_setpoint_command(&self, device: &DeviceConfig, setpoint: f64) {
        let frame = match build_set_point_temperature(device.address, setpoint) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device = %device.name, error = %e, "setpoint frame rejected");
                return;
            }
        };

        let ack_ok = self
            .engine
            .send_with_ack(
                &frame,
                device.address,
                FrameMatcher::echo_of(&frame, 2),
                COMMAND_ACK_TIMEOUT,
            )
            .await
            .is_ok();

        let readback = self.request_polling_status(device.address).await;
        let (ok, poll_ok) = match &readback {
            Some(polling) => {
                self.apply_projection(device, polling).await;
                // Controllers may round the decimal in the readback
                ((polling.temperature_setpoint - setpoint).abs() <= 0.6, true)
            }
            None => (ack_ok, false),
        };

        if !ok {
            self.publish_action_result(
                device,
                "setpoint_set",
                false,
                format!("timeout desired={setpoint:.1}"),
            )
            .await;
            return;
        }

        if !poll_ok {
            let prefix = self.topic_prefix(device);
            self.publish(
                &format!("{prefix}/setpoint/state"),
                format!("{setpoint:.1}"),
                true,
            )
            .await;
        }
        self.publish_action_result(
            device,
            "setpoint_set",
            true,
            format!("setpoint={setpoint:.1}"),
        )
        .await;
    }

    async fn handle_season_command(&self, device: &DeviceConfig, season: u8) {
        let frame = match build_set_season(device.address, season) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device = %device.name, error = %e, "season frame rejected");
                return;
            }
        };

        let ack_ok = self
            .engine
            .send_with_ack(
                &frame,
                device.address,
                FrameMatcher::echo_of(&frame, 1),
                COMMAND_ACK_TIMEOUT,
            )
            .await
            .is_ok();

        let readback = self.request_polling_status(device.address).await;
        let (ok, poll_ok) = match &readback {
            Some(polling) => {
                self.apply_projection(device, polling).await;
                (polling.season == season, true)
            }
            None => (ack_ok, false),
        };

        if !ok {
            self.publish_action_result(
                device,
                "season_set",
                false,
                format!("timeout desired={season}"),
            )
            .await;
            return;
        }

        if !poll_ok {
            let prefix = self.topic_prefix(device);
            let label = if season == 1 { "SUMMER" } else { "WINTER" };
            self.publish(&format!("{prefix}/season/state"), label, true).await;
        }
        self.publish_action_result(device, "season_set", true, format!("season={season}"))
            .await;
    }

    // ------------------------------------------------------------------
    // Spontaneous Frames
    // ------------------------------------------------------------------

    /// Interpret command echoes that arrive outside any transaction and
    /// publish the state they imply. Unknown commands are ignored.
    pub(crate) async fn handle_non_polling_frame(&self, frame: &ParsedFrame) {
        let devices = self.index.at_address(frame.address);
        if devices.is_empty() {
            return;
        }

        let command = frame.command;

        if let Some(channel) = light_echo_channel(command) {
            let is_on = match frame.data[0] {
                LIGHT_DATA_RELAY_ON => true,
                LIGHT_DATA_RELAY_OFF => false,
                _ => return,
            };
            for device in devices {
                if device.kind == DeviceKind::Lights {
                    self.publish_light_channel_state(device, channel, is_on).await;
                }
            }
            return;
        }

        if command == CMD_DIMMER_CONTROL {
            if frame.data[0] != DIMMER_DATA {
                return;
            }
            let raw = if frame.data[1] > 8 { 10 } else { frame.data[1] };
            let percent = crate::protocol::bus_dimmer_to_percent(raw);
            for device in devices {
                if device.kind != DeviceKind::Dimmer || !device.publish_enabled {
                    continue;
                }
                self.remember_dimmer_percent(device, percent);
                let prefix = self.topic_prefix(device);
                self.publish(
                    &format!("{prefix}/state"),
                    if percent > 0 { "ON" } else { "OFF" },
                    true,
                )
                .await;
                self.publish(
                    &format!("{prefix}/brightness/state"),
                    percent_to_brightness(percent),
                    true,
                )
                .await;
            }
            return;
        }

        if command == CMD_SET_POINT_TEMPERATURE {
            let setpoint = f64::from(frame.data[0]) + f64::from(frame.data[1]) / 10.0;
            for device in devices {
                if device.kind != DeviceKind::Thermostat || !device.publish_enabled {
                    continue;
                }
                let prefix = self.topic_prefix(device);
                self.publish(
                    &format!("{prefix}/setpoint/state"),
                    format!("{setpoint:.1}"),
                    true,
                )
                .await;
            }
            return;
        }

        if command == CMD_SET_SEASON {
            let label = if frame.data[0] == 1 { "SUMMER" } else { "WINTER" };
            for device in devices {
                if device.kind != DeviceKind::Thermostat || !device.publish_enabled {
                    continue;
                }
                let prefix = self.topic_prefix(device);
                self.publish(&format!("{prefix}/season/state"), label, true).await;
            }
        }
    }
}

/// Channel implied by a light relay opcode, if it is one.
fn light_echo_channel(command: u8) -> Option<u8> {
    if (CMD_LIGHT_CONTROL_FIRST_FOUR..=CMD_LIGHT_CONTROL_FIRST_FOUR + 3).contains(&command) {
        Some(command - CMD_LIGHT_CONTROL_FIRST_FOUR + 1)
    } else if (CMD_LIGHT_CONTROL_FIFTH_ONWARD..=CMD_LIGHT_CONTROL_FIFTH_ONWARD + 3)
        .contains(&command)
    {
        Some(command - CMD_LIGHT_CONTROL_FIFTH_ONWARD + 5)
    } else {
        None
    }
}

/// Readback comparison scale: level 9 reads back as full scale.
fn dimmer_confirm_level(bus: u8) -> u8 {
    if bus >= 9 {
        10
    } else {
        bus
    }
}

// ============================================================================
// Tests
// ============================================================================
