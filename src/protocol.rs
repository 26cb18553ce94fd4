// src/protocol.rs
//
// AlgoDomo RS-485 bus frame codec.
//
// Frame format (both directions):
//   [0x49][address:1][command:1][data:10][0x46]
//
// Frames are 14 bytes on the wire; some controller firmwares append one
// extra byte before the terminator, so 15-byte frames are accepted on
// receive and the extra byte is surfaced as `extra`. Transmitted frames
// are always 14 bytes.

use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

pub const FRAME_START_BYTE: u8 = 0x49;
pub const FRAME_END_BYTE: u8 = 0x46;
pub const FRAME_LENGTH: usize = 14;
pub const FRAME_MIN_LENGTH: usize = 14;
pub const FRAME_MAX_LENGTH: usize = 15;
pub const DATA_LENGTH: usize = 10;

/// Polling request opcode
pub const CMD_POLLING_EXTENDED: u8 = 0x40;
/// Polling response opcode (some controllers echo 0x40 instead)
pub const CMD_POLLING_RESPONSE: u8 = 0x50;
pub const CMD_SET_POINT_TEMPERATURE: u8 = 0x5A;
pub const CMD_SET_SEASON: u8 = 0x6B;
/// Relay 1 opcode; relays 1..4 map to 0x51..0x54
pub const CMD_LIGHT_CONTROL_FIRST_FOUR: u8 = 0x51;
/// Relay 5 opcode; relays 5..8 map to 0x65..0x68
pub const CMD_LIGHT_CONTROL_FIFTH_ONWARD: u8 = 0x65;
pub const CMD_SHUTTER_CONTROL: u8 = 0x5C;
pub const CMD_DIMMER_CONTROL: u8 = 0x5B;

pub const LIGHT_DATA_RELAY_ON: u8 = 0x41;
pub const LIGHT_DATA_RELAY_OFF: u8 = 0x53;

pub const SHUTTER_DATA_UP: u8 = 0x55;
pub const SHUTTER_DATA_DOWN: u8 = 0x44;
pub const DIMMER_DATA: u8 = 0x53;

// ============================================================================
// Types
// ============================================================================

/// A frame received from the bus, split into its fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFrame {
    pub address: u8,
    pub command: u8,
    pub data: [u8; DATA_LENGTH],
    /// Trailing byte of a 15-byte frame, if present
    pub extra: Option<u8>,
    pub raw: Vec<u8>,
}

/// Decoded payload of a polling response.
#[derive(Clone, Debug, PartialEq)]
pub struct PollingStatus {
    pub device_type: u8,
    /// Output relay bitmask; bit i corresponds to channel i+1
    pub outputs: u8,
    /// Input bitmask
    pub inputs: u8,
    /// Dimmer level on the 0..10 bus scale
    pub dimmer_0_10: u8,
    pub temperature: f64,
    pub temperature_setpoint: f64,
    /// 0 = winter, 1 = summer
    pub season: u8,
}

/// Codec-level rejection of an outbound or inbound frame.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ProtocolError {
    #[error("address out of range: {0}")]
    AddressOutOfRange(u8),
    #[error("data payload too long: {0} bytes (max 10)")]
    DataTooLong(usize),
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(usize),
    #[error("invalid start byte: 0x{0:02X}")]
    InvalidStartByte(u8),
    #[error("invalid end byte: 0x{0:02X}")]
    InvalidEndByte(u8),
    #[error("relay index must be 1..=8, got {0}")]
    RelayIndexOutOfRange(u8),
    #[error("shutter index must be 1..=4, got {0}")]
    ShutterIndexOutOfRange(u8),
    #[error("negative setpoint not supported: {0}")]
    NegativeSetpoint(f64),
    #[error("season must be 0 (winter) or 1 (summer), got {0}")]
    InvalidSeason(u8),
    #[error("unexpected command in polling response: 0x{0:02X}")]
    UnexpectedPollingCommand(u8),
}

fn check_address(address: u8) -> Result<(), ProtocolError> {
    if address < 1 || address > 254 {
        return Err(ProtocolError::AddressOutOfRange(address));
    }
    Ok(())
}

// ============================================================================
// Frame Building
// ============================================================================

/// Build a 14-byte frame. Data shorter than 10 bytes is right-padded
/// with zeros.
pub fn build_frame(address: u8, command: u8, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_address(address)?;

    if data.len() > DATA_LENGTH {
        return Err(ProtocolError::DataTooLong(data.len()));
    }

    let mut frame = Vec::with_capacity(FRAME_LENGTH);
    frame.push(FRAME_START_BYTE);
    frame.push(address);
    frame.push(command);
    frame.extend_from_slice(data);
    frame.resize(FRAME_LENGTH - 1, 0);
    frame.push(FRAME_END_BYTE);
    Ok(frame)
}

pub fn build_polling_extended(address: u8) -> Result<Vec<u8>, ProtocolError> {
    build_frame(address, CMD_POLLING_EXTENDED, &[])
}

pub fn build_set_point_temperature(
    address: u8,
    temperature_set: f64,
) -> Result<Vec<u8>, ProtocolError> {
    if temperature_set < 0.0 {
        return Err(ProtocolError::NegativeSetpoint(temperature_set));
    }

    let integer = temperature_set.trunc() as u8;
    let decimal = ((temperature_set - temperature_set.trunc()) * 10.0).round() as u8;
    build_frame(address, CMD_SET_POINT_TEMPERATURE, &[integer, decimal])
}

pub fn build_set_season(address: u8, season: u8) -> Result<Vec<u8>, ProtocolError> {
    if season > 1 {
        return Err(ProtocolError::InvalidSeason(season));
    }
    build_frame(address, CMD_SET_SEASON, &[season])
}

/// Relay opcodes are split across two banks: 1..4 start at 0x51 and
/// 5..8 start at 0x65.
pub fn light_control_command(relay_index: u8) -> Result<u8, ProtocolError> {
    if relay_index < 1 || relay_index > 8 {
        return Err(ProtocolError::RelayIndexOutOfRange(relay_index));
    }
    if relay_index >= 5 {
        Ok(CMD_LIGHT_CONTROL_FIFTH_ONWARD + (relay_index - 5))
    } else {
        Ok(CMD_LIGHT_CONTROL_FIRST_FOUR + (relay_index - 1))
    }
}

pub fn build_light_control(
    address: u8,
    relay_index: u8,
    enabled: bool,
) -> Result<Vec<u8>, ProtocolError> {
    let command = light_control_command(relay_index)?;
    let state = if enabled {
        LIGHT_DATA_RELAY_ON
    } else {
        LIGHT_DATA_RELAY_OFF
    };
    build_frame(address, command, &[state])
}

pub fn build_shutter_control(
    address: u8,
    shutter_index: u8,
    up: bool,
) -> Result<Vec<u8>, ProtocolError> {
    if shutter_index < 1 || shutter_index > 4 {
        return Err(ProtocolError::ShutterIndexOutOfRange(shutter_index));
    }
    let action = if up { SHUTTER_DATA_UP } else { SHUTTER_DATA_DOWN };
    build_frame(address, CMD_SHUTTER_CONTROL, &[shutter_index, action])
}

pub fn build_dimmer_control(address: u8, percent: u8) -> Result<Vec<u8>, ProtocolError> {
    build_frame(
        address,
        CMD_DIMMER_CONTROL,
        &[DIMMER_DATA, percent_to_bus_dimmer(percent)],
    )
}

// ============================================================================
// Dimmer Conversions
// ============================================================================

/// Map a 0..100 percent to the bus 0..9 write scale.
pub fn percent_to_bus_dimmer(percent: u8) -> u8 {
    let bounded = percent.min(100) as u16;
    let value = (bounded * 10 / 100) as u8;
    value.min(9)
}

/// Map a bus 0..10 read scale back to 0..100 percent.
pub fn bus_dimmer_to_percent(value: u8) -> u8 {
    value.min(10) * 10
}

// ============================================================================
// Frame Parsing
// ============================================================================

/// Parse a raw 14- or 15-byte frame.
pub fn parse_frame(raw: &[u8]) -> Result<ParsedFrame, ProtocolError> {
    let frame_len = raw.len();
    if frame_len < FRAME_MIN_LENGTH || frame_len > FRAME_MAX_LENGTH {
        return Err(ProtocolError::InvalidFrameLength(frame_len));
    }
    if raw[0] != FRAME_START_BYTE {
        return Err(ProtocolError::InvalidStartByte(raw[0]));
    }
    if raw[frame_len - 1] != FRAME_END_BYTE {
        return Err(ProtocolError::InvalidEndByte(raw[frame_len - 1]));
    }

    let mut data = [0u8; DATA_LENGTH];
    data.copy_from_slice(&raw[3..3 + DATA_LENGTH]);

    let extra = if frame_len > FRAME_LENGTH {
        Some(raw[13])
    } else {
        None
    };

    Ok(ParsedFrame {
        address: raw[1],
        command: raw[2],
        data,
        extra,
        raw: raw.to_vec(),
    })
}

/// Decode the 10-byte data payload of a polling response.
pub fn parse_polling_status(frame: &ParsedFrame) -> Result<PollingStatus, ProtocolError> {
    if frame.command != CMD_POLLING_EXTENDED && frame.command != CMD_POLLING_RESPONSE {
        return Err(ProtocolError::UnexpectedPollingCommand(frame.command));
    }

    // Some firmwares report 9 and above as full scale.
    let raw_dimmer = frame.data[3];
    let dimmer = if raw_dimmer > 8 { 10 } else { raw_dimmer };

    let mut temperature = f64::from(frame.data[4]) + f64::from(frame.data[5]) / 10.0;
    if frame.data[6] == 0x2D {
        temperature = -temperature;
    }

    let temperature_setpoint = f64::from(frame.data[8]) + f64::from(frame.data[7]) / 10.0;

    Ok(PollingStatus {
        device_type: frame.data[0],
        outputs: frame.data[1],
        inputs: frame.data[2],
        dimmer_0_10: dimmer,
        temperature,
        temperature_setpoint,
        season: frame.data[9],
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_polling_frame() {
        let frame = build_polling_extended(2).unwrap();
        assert_eq!(
            frame,
            vec![0x49, 0x02, 0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x46]
        );
    }

    #[test]
    fn test_build_frame_pads_data() {
        let frame = build_frame(7, 0x5A, &[0x15, 0x05]).unwrap();
        assert_eq!(frame.len(), FRAME_LENGTH);
        assert_eq!(frame[3], 0x15);
        assert_eq!(frame[4], 0x05);
        assert_eq!(&frame[5..13], &[0u8; 8]);
    }

    #[test]
    fn test_build_frame_rejects_bad_address() {
        assert!(matches!(
            build_frame(0, 0x40, &[]),
            Err(ProtocolError::AddressOutOfRange(0))
        ));
        assert!(matches!(
            build_frame(255, 0x40, &[]),
            Err(ProtocolError::AddressOutOfRange(255))
        ));
    }

    #[test]
    fn test_build_frame_rejects_long_data() {
        let data = [0u8; 11];
        assert!(matches!(
            build_frame(1, 0x40, &data),
            Err(ProtocolError::DataTooLong(11))
        ));
    }

    #[test]
    fn test_parse_roundtrip() {
        let frame = build_frame(42, 0x5B, &[0x53, 0x07]).unwrap();
        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.address, 42);
        assert_eq!(parsed.command, 0x5B);
        assert_eq!(&parsed.data[..2], &[0x53, 0x07]);
        assert_eq!(&parsed.data[2..], &[0u8; 8]);
        assert_eq!(parsed.extra, None);
    }

    #[test]
    fn test_light_command_mapping() {
        // Relay 1 on -> first-bank opcode, ON marker
        let frame1 = build_light_control(10, 1, true).unwrap();
        assert_eq!(frame1[2], 0x51);
        assert_eq!(frame1[3], 0x41);

        // Relay 5 off -> second-bank opcode, OFF marker
        let frame5 = build_light_control(10, 5, false).unwrap();
        assert_eq!(frame5[2], 0x65);
        assert_eq!(frame5[3], 0x53);

        assert_eq!(light_control_command(4).unwrap(), 0x54);
        assert_eq!(light_control_command(8).unwrap(), 0x68);
    }

    #[test]
    fn test_light_control_rejects_relay_out_of_range() {
        assert!(build_light_control(10, 0, true).is_err());
        assert!(build_light_control(10, 9, true).is_err());
    }

    #[test]
    fn test_build_shutter_control() {
        let up = build_shutter_control(7, 3, true).unwrap();
        assert_eq!(up[2], CMD_SHUTTER_CONTROL);
        assert_eq!(up[3], 3);
        assert_eq!(up[4], SHUTTER_DATA_UP);

        let down = build_shutter_control(7, 1, false).unwrap();
        assert_eq!(down[4], SHUTTER_DATA_DOWN);
    }

    #[test]
    fn test_shutter_rejects_index_out_of_range() {
        assert!(matches!(
            build_shutter_control(7, 5, true),
            Err(ProtocolError::ShutterIndexOutOfRange(5))
        ));
        assert!(build_shutter_control(7, 0, true).is_err());
    }

    #[test]
    fn test_build_dimmer_control() {
        let frame = build_dimmer_control(3, 80).unwrap();
        assert_eq!(frame[2], CMD_DIMMER_CONTROL);
        assert_eq!(frame[3], DIMMER_DATA);
        assert_eq!(frame[4], 8);
    }

    #[test]
    fn test_setpoint_encoding() {
        let frame = build_set_point_temperature(5, 21.5).unwrap();
        assert_eq!(frame[2], CMD_SET_POINT_TEMPERATURE);
        assert_eq!(frame[3], 21);
        assert_eq!(frame[4], 5);
    }

    #[test]
    fn test_setpoint_rejects_negative() {
        assert!(matches!(
            build_set_point_temperature(5, -0.5),
            Err(ProtocolError::NegativeSetpoint(_))
        ));
    }

    #[test]
    fn test_season_encoding() {
        let frame = build_set_season(5, 1).unwrap();
        assert_eq!(frame[2], CMD_SET_SEASON);
        assert_eq!(frame[3], 1);
        assert!(matches!(
            build_set_season(5, 2),
            Err(ProtocolError::InvalidSeason(2))
        ));
    }

    #[test]
    fn test_dimmer_percent_conversions() {
        assert_eq!(percent_to_bus_dimmer(0), 0);
        assert_eq!(percent_to_bus_dimmer(100), 9);
        assert_eq!(percent_to_bus_dimmer(255), 9); // clamped
        assert_eq!(bus_dimmer_to_percent(0), 0);
        assert_eq!(bus_dimmer_to_percent(10), 100);
        assert_eq!(bus_dimmer_to_percent(14), 100); // clamped

        // Round trip through the wire and back is monotonic non-decreasing
        // across the percent range. A written 9 reads back as 10, which is
        // what carries full scale back to 100.
        let through_device = |percent: u8| {
            let written = percent_to_bus_dimmer(percent);
            let read_back = if written > 8 { 10 } else { written };
            bus_dimmer_to_percent(read_back)
        };

        let mut last = 0;
        for percent in 0..=100u8 {
            let round = through_device(percent);
            assert!(round >= last, "not monotonic at {}", percent);
            last = round;
        }
        assert_eq!(through_device(0), 0);
        assert_eq!(through_device(100), 100);
    }

    #[test]
    fn test_parse_polling_status() {
        let raw = [
            0x49, 0x02, CMD_POLLING_EXTENDED, 0x11, 0b0000_0101, 0x00, 0x04, 0x16, 0x00, 0x00,
            0x02, 0x02, 0x01, 0x46,
        ];

        let parsed = parse_frame(&raw).unwrap();
        let polling = parse_polling_status(&parsed).unwrap();

        assert_eq!(polling.device_type, 0x11);
        assert_eq!(polling.outputs, 0b0000_0101);
        assert_eq!(polling.dimmer_0_10, 4);
        assert!((polling.temperature - 22.0).abs() < f64::EPSILON);
        assert!((polling.temperature_setpoint - 2.2).abs() < 1e-9);
        assert_eq!(polling.season, 1);
    }

    #[test]
    fn test_parse_polling_status_accepts_response_opcode() {
        let raw = [
            0x49, 0x02, CMD_POLLING_RESPONSE, 0x11, 0b0000_0001, 0x00, 0x04, 0x16, 0x00, 0x00,
            0x02, 0x02, 0x01, 0x46,
        ];

        let parsed = parse_frame(&raw).unwrap();
        let polling = parse_polling_status(&parsed).unwrap();
        assert_eq!(polling.outputs, 0b0000_0001);
    }

    #[test]
    fn test_parse_polling_status_negative_temperature() {
        let raw = [
            0x49, 0x02, CMD_POLLING_RESPONSE, 0x11, 0x00, 0x00, 0x00, 0x03, 0x05, 0x2D, 0x00,
            0x00, 0x00, 0x46,
        ];

        let parsed = parse_frame(&raw).unwrap();
        let polling = parse_polling_status(&parsed).unwrap();
        assert!((polling.temperature + 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_polling_status_rejects_other_commands() {
        let raw = build_frame(2, CMD_SET_SEASON, &[1]).unwrap();
        let parsed = parse_frame(&raw).unwrap();
        assert!(matches!(
            parse_polling_status(&parsed),
            Err(ProtocolError::UnexpectedPollingCommand(CMD_SET_SEASON))
        ));
    }

    #[test]
    fn test_parse_frame_accepts_15_bytes() {
        let raw = [
            0x49, 0x02, CMD_POLLING_RESPONSE, 0x11, 0b0000_0001, 0x00, 0x04, 0x16, 0x00, 0x00,
            0x02, 0x02, 0x01, 0xF8, 0x46,
        ];

        let parsed = parse_frame(&raw).unwrap();
        assert_eq!(parsed.address, 0x02);
        assert_eq!(parsed.command, CMD_POLLING_RESPONSE);
        assert_eq!(parsed.extra, Some(0xF8));
        assert_eq!(parsed.data[9], 0x01);
    }

    #[test]
    fn test_parse_frame_rejects_bad_markers() {
        assert!(matches!(
            parse_frame(&[0x00; 14]),
            Err(ProtocolError::InvalidStartByte(0))
        ));

        let mut raw = build_polling_extended(2).unwrap();
        raw[13] = 0x00;
        assert!(matches!(
            parse_frame(&raw),
            Err(ProtocolError::InvalidEndByte(0))
        ));

        assert!(matches!(
            parse_frame(&[0x49; 13]),
            Err(ProtocolError::InvalidFrameLength(13))
        ));
        assert!(matches!(
            parse_frame(&[0x49; 16]),
            Err(ProtocolError::InvalidFrameLength(16))
        ));
    }
}
