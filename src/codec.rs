//! Bit-exact encoding and decoding of instrument frames.
//!
//! Every frame exchanged with the instrument is wrapped in the same markers:
//!
//! ```text
//! AA 55 AA | key | payload ... | [padding] | 0D 0A
//! ```
//!
//! - Setpoint frames carry one little-endian `u16` per channel. 12-channel
//!   devices expect 8 extra zero bytes before the end marker.
//! - Response frames carry 6 bytes per channel: a `u16` heater resistance,
//!   a 24-bit sensor voltage and one reserved byte.
//! - Range frames pack 2 bits per channel into `N / 4` bytes.
//!
//! All decoding is length-exact: a frame whose size does not match the
//! channel count is rejected instead of truncated.

use crate::errors::{DeviceError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Marker that opens every frame.
pub const BEGIN_MARKER: [u8; 3] = [0xAA, 0x55, 0xAA];
/// Marker that closes every frame.
pub const END_MARKER: [u8; 2] = [0x0D, 0x0A];

/// Base command: heater voltage setpoints.
pub const CMD_SEND_U: u8 = 0x08;
/// Base command: heater resistance setpoints.
pub const CMD_SEND_R: u8 = 0x88;
/// Command: measurement range selection.
pub const CMD_SEND_RANGE: u8 = 0x20;

/// Historical resistance scale (0.01 Ohm per LSB).
pub const DEFAULT_RESISTANCE_CONVERTER: u16 = 100;

/// Length of the acknowledgement sent back for a range frame.
pub const RANGE_ACK_LEN: usize = 6;

const FULL_SCALE_VOLTS: f64 = 5.0;
const SETPOINT_STEPS: f64 = 65535.0;
const RESPONSE_VOLTAGE_STEPS: f64 = 16_777_216.0; // 2^24
const RESPONSE_BYTES_PER_CHANNEL: usize = 6;
const TWELVE_CHANNEL_PADDING: usize = 8;
const FRAME_OVERHEAD: usize = BEGIN_MARKER.len() + END_MARKER.len();

// ============================================================================
// Data Types
// ============================================================================

/// Number of channels a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelCount {
    Four = 4,
    Twelve = 12,
}

impl ChannelCount {
    pub fn from_usize(n: usize) -> Result<Self> {
        match n {
            4 => Ok(ChannelCount::Four),
            12 => Ok(ChannelCount::Twelve),
            other => Err(DeviceError::ChannelCount(other)),
        }
    }

    #[inline]
    pub fn get(self) -> usize {
        self as usize
    }

    /// Zero bytes appended to setpoint frames before the end marker.
    fn setpoint_padding(self) -> usize {
        match self {
            ChannelCount::Four => 0,
            ChannelCount::Twelve => TWELVE_CHANNEL_PADDING,
        }
    }
}

/// Set of active channel groups (`1-4`, `5-8`, `9-12`), OR'd into the command key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelGroups(u8);

impl ChannelGroups {
    pub const GROUP_1_4: ChannelGroups = ChannelGroups(0x01);
    pub const GROUP_5_8: ChannelGroups = ChannelGroups(0x02);
    pub const GROUP_9_12: ChannelGroups = ChannelGroups(0x04);

    pub const fn empty() -> Self {
        ChannelGroups(0)
    }

    /// Every group present on a device with `channels` channels.
    pub fn all(channels: ChannelCount) -> Self {
        match channels {
            ChannelCount::Four => Self::GROUP_1_4,
            ChannelCount::Twelve => Self::GROUP_1_4 | Self::GROUP_5_8 | Self::GROUP_9_12,
        }
    }

    /// Build from 1-based group numbers (1 → channels 1-4, 2 → 5-8, 3 → 9-12).
    pub fn from_numbers<I: IntoIterator<Item = u8>>(numbers: I) -> Result<Self> {
        let mut groups = Self::empty();
        for n in numbers {
            groups = groups
                | match n {
                    1 => Self::GROUP_1_4,
                    2 => Self::GROUP_5_8,
                    3 => Self::GROUP_9_12,
                    other => {
                        return Err(DeviceError::Domain(format!(
                            "channel group {other} does not exist (expected 1..=3)"
                        )))
                    }
                };
        }
        Ok(groups)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: ChannelGroups) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ChannelGroups {
    type Output = ChannelGroups;

    fn bitor(self, rhs: Self) -> Self::Output {
        ChannelGroups(self.0 | rhs.0)
    }
}

/// How the setpoint values of a frame are interpreted by the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetpointMode {
    /// Heater voltage in volts, `[0, 5]`.
    #[default]
    Voltage,
    /// Heater resistance in ohms, scaled by the device converter.
    Resistance,
}

impl SetpointMode {
    pub fn command(self) -> u8 {
        match self {
            SetpointMode::Voltage => CMD_SEND_U,
            SetpointMode::Resistance => CMD_SEND_R,
        }
    }

    pub fn from_command(base: u8) -> Option<Self> {
        match base {
            CMD_SEND_U => Some(SetpointMode::Voltage),
            CMD_SEND_R => Some(SetpointMode::Resistance),
            _ => None,
        }
    }
}

/// Hardware measurement range of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Range {
    #[default]
    R1 = 1,
    R2 = 2,
    R3 = 3,
}

impl Range {
    pub const ALL: [Range; 3] = [Range::R1, Range::R2, Range::R3];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Range::R1),
            2 => Some(Range::R2),
            3 => Some(Range::R3),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Index into per-range tables (`0..3`).
    #[inline]
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn up(self) -> Self {
        match self {
            Range::R1 => Range::R2,
            Range::R2 | Range::R3 => Range::R3,
        }
    }

    pub fn down(self) -> Self {
        match self {
            Range::R1 | Range::R2 => Range::R1,
            Range::R3 => Range::R2,
        }
    }

    /// Two-bit code used in range frames.
    pub fn to_bits(self) -> u8 {
        match self {
            Range::R1 => 0b11,
            Range::R2 => 0b10,
            Range::R3 => 0b00,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            0b11 => Some(Range::R1),
            0b10 => Some(Range::R2),
            0b00 => Some(Range::R3),
            _ => None,
        }
    }
}

/// Measurements decoded from one response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Sensor voltages in volts.
    pub voltages: Vec<f64>,
    /// Heater resistances in ohms.
    pub resistances: Vec<f64>,
}

// ============================================================================
// Codec
// ============================================================================

/// Frame encoder/decoder bound to a channel count and resistance converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    channels: ChannelCount,
    converter: u16,
}

impl FrameCodec {
    pub fn new(channels: ChannelCount, converter: u16) -> Result<Self> {
        if converter == 0 {
            return Err(DeviceError::Domain(
                "resistance converter must be positive".into(),
            ));
        }
        Ok(Self {
            channels,
            converter,
        })
    }

    pub fn channels(&self) -> ChannelCount {
        self.channels
    }

    pub fn converter(&self) -> u16 {
        self.converter
    }

    pub fn setpoint_frame_len(&self) -> usize {
        FRAME_OVERHEAD + 1 + 2 * self.channels.get() + self.channels.setpoint_padding()
    }

    pub fn response_frame_len(&self) -> usize {
        FRAME_OVERHEAD + RESPONSE_BYTES_PER_CHANNEL * self.channels.get()
    }

    pub fn range_frame_len(&self) -> usize {
        FRAME_OVERHEAD + 1 + self.channels.get() / 4
    }

    /// Encode one setpoint frame.
    ///
    /// Voltages `>= 5` are clamped to 5 V; negative (or NaN) values are a
    /// [`DeviceError::Domain`] error. Resistances are scaled by the converter
    /// and must fit in 16 bits.
    pub fn encode_setpoint(
        &self,
        values: &[f64],
        mode: SetpointMode,
        groups: ChannelGroups,
    ) -> Result<Vec<u8>> {
        self.check_len("setpoint values", values.len())?;

        let mut frame = Vec::with_capacity(self.setpoint_frame_len());
        frame.extend_from_slice(&BEGIN_MARKER);
        frame.push(mode.command() | groups.bits());
        for (channel, &value) in values.iter().enumerate() {
            let raw = match mode {
                SetpointMode::Voltage => voltage_to_raw(value),
                SetpointMode::Resistance => self.resistance_to_raw(value),
            }
            .map_err(|e| DeviceError::Domain(format!("channel {channel}: {e}")))?;
            frame.extend_from_slice(&raw.to_le_bytes());
        }
        frame.resize(frame.len() + self.channels.setpoint_padding(), 0);
        frame.extend_from_slice(&END_MARKER);
        Ok(frame)
    }

    /// Decode one response frame into voltages and heater resistances.
    pub fn decode_response(&self, bytes: &[u8]) -> Result<Response> {
        let expected = self.response_frame_len();
        if bytes.len() != expected {
            return Err(DeviceError::Framing(format!(
                "response has {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        if bytes[..BEGIN_MARKER.len()] != BEGIN_MARKER {
            return Err(DeviceError::Framing(format!(
                "begin marker mismatch: {:02X?}",
                &bytes[..BEGIN_MARKER.len()]
            )));
        }
        if bytes[expected - END_MARKER.len()..] != END_MARKER {
            return Err(DeviceError::Framing(format!(
                "end marker mismatch: {:02X?}",
                &bytes[expected - END_MARKER.len()..]
            )));
        }

        let n = self.channels.get();
        let mut voltages = Vec::with_capacity(n);
        let mut resistances = Vec::with_capacity(n);
        let payload = &bytes[BEGIN_MARKER.len()..expected - END_MARKER.len()];
        for chunk in payload.chunks_exact(RESPONSE_BYTES_PER_CHANNEL) {
            let r_raw = u16::from_le_bytes([chunk[0], chunk[1]]);
            let u_raw = u32::from_le_bytes([chunk[2], chunk[3], chunk[4], 0]);
            resistances.push(f64::from(r_raw) / f64::from(self.converter));
            voltages.push(f64::from(u_raw) / RESPONSE_VOLTAGE_STEPS * FULL_SCALE_VOLTS);
        }
        Ok(Response {
            voltages,
            resistances,
        })
    }

    /// Encode a response frame the way the instrument does.
    ///
    /// Used by the emulator; values are rounded to the nearest step.
    pub fn encode_response(&self, voltages: &[f64], resistances: &[f64]) -> Result<Vec<u8>> {
        self.check_len("response voltages", voltages.len())?;
        self.check_len("response resistances", resistances.len())?;

        let mut frame = Vec::with_capacity(self.response_frame_len());
        frame.extend_from_slice(&BEGIN_MARKER);
        for (&u, &r) in voltages.iter().zip(resistances) {
            if !(r >= 0.0) || !(u >= 0.0) {
                return Err(DeviceError::Domain(format!(
                    "response values must be non-negative (u={u}, r={r})"
                )));
            }
            let r_raw = (r * f64::from(self.converter)).round();
            if r_raw > f64::from(u16::MAX) {
                return Err(DeviceError::Domain(format!("resistance {r} does not fit")));
            }
            let u_raw = ((u / FULL_SCALE_VOLTS) * RESPONSE_VOLTAGE_STEPS)
                .round()
                .min(RESPONSE_VOLTAGE_STEPS - 1.0) as u32;
            frame.extend_from_slice(&(r_raw as u16).to_le_bytes());
            frame.extend_from_slice(&u_raw.to_le_bytes()[..3]);
            frame.push(0);
        }
        frame.extend_from_slice(&END_MARKER);
        Ok(frame)
    }

    /// Encode a range-selection frame (2 bits per channel, little-endian).
    pub fn encode_range_command(&self, ranges: &[Range]) -> Result<Vec<u8>> {
        self.check_len("ranges", ranges.len())?;

        let packed = ranges
            .iter()
            .enumerate()
            .fold(0u32, |acc, (idx, range)| {
                acc | (u32::from(range.to_bits()) << (idx * 2))
            });

        let mut frame = Vec::with_capacity(self.range_frame_len());
        frame.extend_from_slice(&BEGIN_MARKER);
        frame.push(CMD_SEND_RANGE);
        frame.extend_from_slice(&packed.to_le_bytes()[..self.channels.get() / 4]);
        frame.extend_from_slice(&END_MARKER);
        Ok(frame)
    }

    /// Decode the range payload of a range frame (the inverse of
    /// [`encode_range_command`](Self::encode_range_command)).
    pub fn decode_range_command(&self, bytes: &[u8]) -> Result<Vec<Range>> {
        if bytes.len() != self.range_frame_len()
            || bytes[..3] != BEGIN_MARKER
            || bytes[3] != CMD_SEND_RANGE
            || bytes[bytes.len() - 2..] != END_MARKER
        {
            return Err(DeviceError::Framing(format!(
                "malformed range frame: {bytes:02X?}"
            )));
        }
        let mut word = [0u8; 4];
        let payload = &bytes[4..bytes.len() - 2];
        word[..payload.len()].copy_from_slice(payload);
        let packed = u32::from_le_bytes(word);
        (0..self.channels.get())
            .map(|idx| {
                let bits = ((packed >> (idx * 2)) & 0b11) as u8;
                Range::from_bits(bits).ok_or_else(|| {
                    DeviceError::Protocol(format!("channel {idx}: invalid range bits {bits:#04b}"))
                })
            })
            .collect()
    }

    fn resistance_to_raw(&self, value: f64) -> std::result::Result<u16, String> {
        if !(value >= 0.0) {
            return Err(format!("resistance must be non-negative, got {value}"));
        }
        let scaled = value * f64::from(self.converter);
        if scaled > f64::from(u16::MAX) {
            return Err(format!(
                "resistance {value} exceeds {} at converter {}",
                f64::from(u16::MAX) / f64::from(self.converter),
                self.converter
            ));
        }
        Ok(scaled as u16)
    }

    fn check_len(&self, what: &str, actual: usize) -> Result<()> {
        if actual != self.channels.get() {
            return Err(DeviceError::Domain(format!(
                "{what}: expected {} values, got {actual}",
                self.channels.get()
            )));
        }
        Ok(())
    }
}

fn voltage_to_raw(value: f64) -> std::result::Result<u16, String> {
    if !(value >= 0.0) {
        return Err(format!("voltage must be non-negative, got {value}"));
    }
    let clamped = value.min(FULL_SCALE_VOLTS);
    Ok((clamped * (SETPOINT_STEPS / FULL_SCALE_VOLTS)) as u16)
}

/// Validate the fixed 6-byte acknowledgement of a range frame.
pub fn verify_range_ack(bytes: &[u8]) -> Result<()> {
    if bytes.len() != RANGE_ACK_LEN {
        return Err(DeviceError::Protocol(format!(
            "range acknowledgement has {} bytes, expected {RANGE_ACK_LEN}",
            bytes.len()
        )));
    }
    if bytes[..3] != BEGIN_MARKER {
        return Err(DeviceError::Protocol("begin marker in range ack is not matching".into()));
    }
    if bytes[3] != CMD_SEND_RANGE {
        return Err(DeviceError::Protocol(format!(
            "range ack echoes command {:#04X}",
            bytes[3]
        )));
    }
    if bytes[4..] != END_MARKER {
        return Err(DeviceError::Protocol("end marker in range ack is not matching".into()));
    }
    Ok(())
}

/// The acknowledgement the instrument returns for a range frame.
pub fn range_ack() -> [u8; RANGE_ACK_LEN] {
    [
        BEGIN_MARKER[0],
        BEGIN_MARKER[1],
        BEGIN_MARKER[2],
        CMD_SEND_RANGE,
        END_MARKER[0],
        END_MARKER[1],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(n: ChannelCount) -> FrameCodec {
        FrameCodec::new(n, DEFAULT_RESISTANCE_CONVERTER).unwrap()
    }

    #[test]
    fn setpoint_frame_layout_four_channels() {
        let frame = codec(ChannelCount::Four)
            .encode_setpoint(&[0.0, 5.0, 2.5, 1.0], SetpointMode::Voltage, ChannelGroups::GROUP_1_4)
            .unwrap();
        assert_eq!(frame.len(), 14);
        assert_eq!(&frame[..3], &BEGIN_MARKER);
        assert_eq!(frame[3], 0x09);
        assert_eq!(&frame[4..6], &[0x00, 0x00]);
        assert_eq!(&frame[6..8], &[0xFF, 0xFF]);
        // 2.5 * 13107 = 32767.5 -> truncated
        assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 32767);
        assert_eq!(u16::from_le_bytes([frame[10], frame[11]]), 13107);
        assert_eq!(&frame[12..], &END_MARKER);
    }

    #[test]
    fn twelve_channel_setpoint_is_padded() {
        let c = codec(ChannelCount::Twelve);
        let groups = ChannelGroups::all(ChannelCount::Twelve);
        let frame = c
            .encode_setpoint(&[0.0; 12], SetpointMode::Voltage, groups)
            .unwrap();
        assert_eq!(frame.len(), c.setpoint_frame_len());
        assert_eq!(frame.len(), 3 + 1 + 24 + 8 + 2);
        assert_eq!(frame[3], 0x0F);
        assert!(frame[4..frame.len() - 2].iter().all(|&b| b == 0));
    }

    #[test]
    fn voltage_is_clamped_not_wrapped() {
        let c = codec(ChannelCount::Four);
        let frame = c
            .encode_setpoint(&[7.3, 5.0, 1e9, 4.9999], SetpointMode::Voltage, ChannelGroups::GROUP_1_4)
            .unwrap();
        assert_eq!(&frame[4..10], &[0xFF; 6]);
        assert!(u16::from_le_bytes([frame[10], frame[11]]) < u16::MAX);
    }

    #[test]
    fn negative_setpoint_is_rejected() {
        let c = codec(ChannelCount::Four);
        let err = c
            .encode_setpoint(&[1.0, -0.01, 1.0, 1.0], SetpointMode::Voltage, ChannelGroups::GROUP_1_4)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Domain(_)));
        let err = c
            .encode_setpoint(&[1.0, 1.0, -3.0, 1.0], SetpointMode::Resistance, ChannelGroups::GROUP_1_4)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Domain(_)));
        assert!(c
            .encode_setpoint(&[f64::NAN, 1.0, 1.0, 1.0], SetpointMode::Voltage, ChannelGroups::GROUP_1_4)
            .is_err());
    }

    #[test]
    fn resistance_setpoint_uses_converter() {
        let c = FrameCodec::new(ChannelCount::Four, 10).unwrap();
        let frame = c
            .encode_setpoint(&[12.34, 0.0, 100.0, 6553.5], SetpointMode::Resistance, ChannelGroups::GROUP_1_4)
            .unwrap();
        assert_eq!(frame[3], CMD_SEND_R | 0x01);
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), 123);
        assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 1000);
        assert_eq!(u16::from_le_bytes([frame[10], frame[11]]), 65535);

        let err = c
            .encode_setpoint(&[6553.6, 0.0, 0.0, 0.0], SetpointMode::Resistance, ChannelGroups::GROUP_1_4)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Domain(_)));
    }

    #[test]
    fn wrong_value_count_is_an_error() {
        let c = codec(ChannelCount::Twelve);
        assert!(c
            .encode_setpoint(&[1.0; 4], SetpointMode::Voltage, ChannelGroups::GROUP_1_4)
            .is_err());
        assert!(c.encode_range_command(&[Range::R1; 4]).is_err());
    }

    #[test]
    fn response_round_trip_within_one_step() {
        let c = codec(ChannelCount::Twelve);
        let voltages: Vec<f64> = (0..12).map(|i| i as f64 * 0.4137).collect();
        let resistances: Vec<f64> = (0..12).map(|i| 10.0 + i as f64 * 37.77).collect();
        let frame = c.encode_response(&voltages, &resistances).unwrap();
        assert_eq!(frame.len(), c.response_frame_len());

        let decoded = c.decode_response(&frame).unwrap();
        for (a, b) in decoded.voltages.iter().zip(&voltages) {
            assert!((a - b).abs() <= 5.0 / 65535.0, "{a} vs {b}");
        }
        for (a, b) in decoded.resistances.iter().zip(&resistances) {
            assert!((a - b).abs() <= 1.0 / 100.0, "{a} vs {b}");
        }
    }

    #[test]
    fn half_scale_voltage_decodes_to_2_5() {
        let c = codec(ChannelCount::Four);
        let frame = c.encode_response(&[2.5; 4], &[0.0; 4]).unwrap();
        let decoded = c.decode_response(&frame).unwrap();
        for u in decoded.voltages {
            assert!((u - 2.5).abs() < 1e-4);
        }
    }

    #[test]
    fn decode_rejects_bad_markers_and_lengths() {
        let c = codec(ChannelCount::Four);
        let good = c.encode_response(&[1.0; 4], &[1.0; 4]).unwrap();

        let mut bad_begin = good.clone();
        bad_begin[1] = 0x00;
        assert!(matches!(c.decode_response(&bad_begin), Err(DeviceError::Framing(_))));

        let mut bad_end = good.clone();
        let last = bad_end.len() - 1;
        bad_end[last] = 0x00;
        assert!(matches!(c.decode_response(&bad_end), Err(DeviceError::Framing(_))));

        assert!(matches!(
            c.decode_response(&good[..good.len() - 1]),
            Err(DeviceError::Framing(_))
        ));
    }

    #[test]
    fn range_command_packs_two_bits_per_channel() {
        let c = codec(ChannelCount::Four);
        let frame = c
            .encode_range_command(&[Range::R1, Range::R2, Range::R3, Range::R1])
            .unwrap();
        // 0b11 | 0b10 << 2 | 0b00 << 4 | 0b11 << 6
        assert_eq!(frame, vec![0xAA, 0x55, 0xAA, 0x20, 0b1100_1011, 0x0D, 0x0A]);

        let c12 = codec(ChannelCount::Twelve);
        let ranges = [Range::R3; 12];
        let frame = c12.encode_range_command(&ranges).unwrap();
        assert_eq!(frame.len(), 3 + 1 + 3 + 2);
        assert_eq!(&frame[4..7], &[0, 0, 0]);
        assert_eq!(c12.decode_range_command(&frame).unwrap(), ranges.to_vec());
    }

    #[test]
    fn range_ack_validation() {
        assert!(verify_range_ack(&range_ack()).is_ok());
        let mut wrong_echo = range_ack();
        wrong_echo[3] = CMD_SEND_U;
        assert!(matches!(verify_range_ack(&wrong_echo), Err(DeviceError::Protocol(_))));
        assert!(verify_range_ack(&range_ack()[..5]).is_err());
    }

    #[test]
    fn channel_groups_from_numbers() {
        let groups = ChannelGroups::from_numbers([1, 3]).unwrap();
        assert_eq!(groups.bits(), 0x05);
        assert!(groups.contains(ChannelGroups::GROUP_9_12));
        assert!(!groups.contains(ChannelGroups::GROUP_5_8));
        assert!(ChannelGroups::from_numbers([4]).is_err());
    }
}
