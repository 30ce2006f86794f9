//! In-memory instrument used by tests and the `--emulate` CLI flag.
//!
//! The emulator parses the frames written to it and queues the bytes a real
//! instrument would answer with. Reading with nothing queued fails with
//! [`std::io::ErrorKind::TimedOut`], like a serial port with a read timeout.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};

use crate::codec::{
    self, ChannelGroups, FrameCodec, Range, SetpointMode, BEGIN_MARKER,
    CMD_SEND_RANGE,
};

const VOLTS_PER_STEP: f64 = 5.0 / 65535.0;

/// A decoded setpoint frame as seen by the emulator.
#[derive(Debug, Clone, PartialEq)]
pub struct EmulatorRequest {
    pub mode: SetpointMode,
    pub groups: ChannelGroups,
    /// Raw 16-bit setpoints as sent on the wire.
    pub raw: Vec<u16>,
    /// Setpoints in physical units (volts or ohms).
    pub values: Vec<f64>,
    /// Ranges in effect when the frame arrived.
    pub ranges: Vec<Range>,
}

/// Produces `(sensor voltages, heater resistances)` for one request.
pub type Responder = Box<dyn FnMut(&EmulatorRequest) -> (Vec<f64>, Vec<f64>) + Send>;

struct EmulatorState {
    codec: FrameCodec,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    responder: Responder,
    ranges: Vec<Range>,
    requests: Vec<EmulatorRequest>,
    range_history: Vec<Vec<Range>>,
    corrupt_remaining: u32,
    silent: bool,
}

/// Emulated instrument implementing [`Read`] + [`Write`].
pub struct Emulator {
    state: Arc<Mutex<EmulatorState>>,
}

/// Shared view into an [`Emulator`] that stays usable after the emulator is
/// moved into a [`DeviceChannel`](super::DeviceChannel).
#[derive(Clone)]
pub struct EmulatorHandle {
    state: Arc<Mutex<EmulatorState>>,
}

fn lock(state: &Mutex<EmulatorState>) -> MutexGuard<'_, EmulatorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deterministic sensor model: voltage and heater resistance grow with the setpoint.
fn default_response(request: &EmulatorRequest) -> (Vec<f64>, Vec<f64>) {
    let voltages = request
        .values
        .iter()
        .map(|v| (0.5 + 0.4 * v).min(4.99))
        .collect();
    let resistances = request.values.iter().map(|v| 15.0 + 5.0 * v).collect();
    (voltages, resistances)
}

impl Emulator {
    /// Emulator using the built-in sensor model.
    pub fn new(codec: FrameCodec) -> Self {
        Self::with_responder(codec, Box::new(default_response))
    }

    pub fn with_responder(codec: FrameCodec, responder: Responder) -> Self {
        let channels = codec.channels();
        let state = EmulatorState {
            codec,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            responder,
            ranges: vec![Range::R1; channels.get()],
            requests: Vec::new(),
            range_history: Vec::new(),
            corrupt_remaining: 0,
            silent: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn handle(&self) -> EmulatorHandle {
        EmulatorHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl EmulatorHandle {
    /// Corrupt the begin marker of the next `n` responses.
    pub fn corrupt_next(&self, n: u32) {
        lock(&self.state).corrupt_remaining = n;
    }

    /// Stop answering setpoint frames altogether.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    pub fn set_responder(&self, responder: Responder) {
        lock(&self.state).responder = responder;
    }

    /// Every setpoint frame received so far.
    pub fn requests(&self) -> Vec<EmulatorRequest> {
        lock(&self.state).requests.clone()
    }

    /// Every range vector received so far.
    pub fn range_history(&self) -> Vec<Vec<Range>> {
        lock(&self.state).range_history.clone()
    }

    pub fn current_ranges(&self) -> Vec<Range> {
        lock(&self.state).ranges.clone()
    }
}

impl EmulatorState {
    fn process_inbound(&mut self) {
        loop {
            // Drop junk up to the next begin marker.
            match self
                .inbound
                .windows(BEGIN_MARKER.len())
                .position(|w| w == BEGIN_MARKER)
            {
                Some(0) => {}
                Some(pos) => {
                    self.inbound.drain(..pos);
                }
                None => {
                    let keep = self.inbound.len().min(BEGIN_MARKER.len() - 1);
                    let cut = self.inbound.len() - keep;
                    self.inbound.drain(..cut);
                    return;
                }
            }
            let Some(&key) = self.inbound.get(BEGIN_MARKER.len()) else {
                return;
            };

            let frame_len = if key == CMD_SEND_RANGE {
                self.codec.range_frame_len()
            } else if SetpointMode::from_command(key & !0x07).is_some() {
                self.codec.setpoint_frame_len()
            } else {
                debug!("Emulator: unknown command key {key:#04X}");
                self.inbound.drain(..1);
                continue;
            };
            if self.inbound.len() < frame_len {
                return;
            }
            let frame: Vec<u8> = self.inbound.drain(..frame_len).collect();
            self.handle_frame(key, &frame);
        }
    }

    fn handle_frame(&mut self, key: u8, frame: &[u8]) {
        trace!("Emulator received {frame:02X?}");
        if key == CMD_SEND_RANGE {
            match self.codec.decode_range_command(frame) {
                Ok(ranges) => {
                    self.ranges = ranges.clone();
                    self.range_history.push(ranges);
                    self.outbound.extend(codec::range_ack());
                }
                Err(e) => debug!("Emulator: bad range frame: {e}"),
            }
            return;
        }

        let Some(mode) = SetpointMode::from_command(key & !0x07) else {
            return;
        };
        let n = self.codec.channels().get();
        let raw: Vec<u16> = frame[4..4 + 2 * n]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let values = raw
            .iter()
            .map(|&r| match mode {
                SetpointMode::Voltage => f64::from(r) * VOLTS_PER_STEP,
                SetpointMode::Resistance => f64::from(r) / f64::from(self.codec.converter()),
            })
            .collect();
        let request = EmulatorRequest {
            mode,
            groups: ChannelGroups::from_numbers(
                (1..=3u8).filter(|g| key & (1 << (g - 1)) != 0),
            )
            .unwrap_or_default(),
            raw,
            values,
            ranges: self.ranges.clone(),
        };

        let (voltages, resistances) = (self.responder)(&request);
        self.requests.push(request);
        if self.silent {
            return;
        }
        match self.codec.encode_response(&voltages, &resistances) {
            Ok(mut reply) => {
                if self.corrupt_remaining > 0 {
                    self.corrupt_remaining -= 1;
                    reply[0] = 0x00;
                }
                self.outbound.extend(reply);
            }
            Err(e) => debug!("Emulator: responder produced an unencodable reply: {e}"),
        }
    }
}

impl Write for Emulator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        state.inbound.extend_from_slice(buf);
        state.process_inbound();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for Emulator {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.outbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "emulator has no pending data"));
        }
        let n = buf.len().min(state.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChannelCount;

    fn four() -> FrameCodec {
        FrameCodec::new(ChannelCount::Four, 100).unwrap()
    }

    #[test]
    fn answers_setpoint_with_response_frame() {
        let codec = four();
        let mut emu = Emulator::new(codec);
        let frame = codec
            .encode_setpoint(&[1.0, 2.0, 3.0, 4.0], SetpointMode::Voltage, ChannelGroups::GROUP_1_4)
            .unwrap();
        emu.write_all(&frame).unwrap();

        let mut reply = vec![0u8; codec.response_frame_len()];
        emu.read_exact(&mut reply).unwrap();
        let resp = codec.decode_response(&reply).unwrap();
        assert!((resp.resistances[1] - 25.0).abs() < 0.02);

        let req = &emu.handle().requests()[0];
        assert_eq!(req.groups, ChannelGroups::GROUP_1_4);
        assert!((req.values[2] - 3.0).abs() < 1e-3);
    }

    #[test]
    fn frames_split_across_writes_are_reassembled() {
        let codec = four();
        let mut emu = Emulator::new(codec);
        let frame = codec.encode_range_command(&[Range::R2; 4]).unwrap();
        emu.write_all(&[0x13, 0x37]).unwrap();
        emu.write_all(&frame[..3]).unwrap();
        emu.write_all(&frame[3..]).unwrap();

        let mut ack = [0u8; 6];
        emu.read_exact(&mut ack).unwrap();
        assert_eq!(ack, codec::range_ack());
        assert_eq!(emu.handle().current_ranges(), vec![Range::R2; 4]);
    }

    #[test]
    fn empty_read_times_out() {
        let mut emu = Emulator::new(four());
        let err = emu.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
