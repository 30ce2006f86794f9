//! Serial link to the multisensor instrument.
//!
//! [`DeviceChannel`] owns the byte stream and turns one setpoint vector into
//! one decoded [`Response`]. It performs a single attempt per call; retry
//! policy belongs to the caller (see the acquisition loop).

pub mod emulator;

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::codec::{
    self, ChannelCount, ChannelGroups, FrameCodec, Range, Response, SetpointMode, RANGE_ACK_LEN,
};
use crate::errors::{DeviceError, Result};

pub use emulator::{Emulator, EmulatorHandle, EmulatorRequest};

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);

const RESYNC_BUDGET: Duration = Duration::from_millis(200);
const RESYNC_MAX_READS: usize = 64;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Byte stream the channel talks over (serial port, emulator, test double).
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

// ============================================================================
// Device Channel
// ============================================================================

/// Connection to one instrument.
///
/// # Example
/// ```ignore
/// let mut dev = DeviceChannel::open("/dev/ttyUSB0", ChannelCount::Four, 100,
///     DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT)?;
/// let resp = dev.request(&[1.0; 4], SetpointMode::Voltage, ChannelGroups::GROUP_1_4)?;
/// dev.send_safe_zero(ChannelGroups::GROUP_1_4)?;
/// dev.close()?;
/// ```
pub struct DeviceChannel {
    transport: Option<Box<dyn Transport>>,
    codec: FrameCodec,
    read_timeout: Duration,
    label: String,
}

impl std::fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("label", &self.label)
            .field("codec", &self.codec)
            .field("open", &self.is_open())
            .finish()
    }
}

impl DeviceChannel {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open a serial port (8 data bits, no parity, 1 stop bit).
    pub fn open(
        port: &str,
        channels: ChannelCount,
        converter: u16,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self> {
        let codec = FrameCodec::new(channels, converter)?;
        let serial = serialport::new(port, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(read_timeout)
            .open()
            .map_err(|source| DeviceError::Connection {
                port: port.to_string(),
                source,
            })?;
        debug!("Opened {port} at {baud_rate} baud ({} channels)", channels.get());

        let mut channel = Self {
            transport: Some(Box::new(serial)),
            codec,
            read_timeout,
            label: port.to_string(),
        };
        channel.resync()?;
        Ok(channel)
    }

    /// Wrap an already-connected transport.
    pub fn from_transport<T: Transport + 'static>(
        transport: T,
        channels: ChannelCount,
        converter: u16,
        read_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            transport: Some(Box::new(transport)),
            codec: FrameCodec::new(channels, converter)?,
            read_timeout,
            label: "<transport>".to_string(),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn channel_count(&self) -> ChannelCount {
        self.codec.channels()
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    /// Send one setpoint frame and decode the matching response (one attempt).
    pub fn request(
        &mut self,
        values: &[f64],
        mode: SetpointMode,
        groups: ChannelGroups,
    ) -> Result<Response> {
        let frame = self.codec.encode_setpoint(values, mode, groups)?;
        self.write_frame(&frame)?;
        let reply = self.read_frame(self.codec.response_frame_len())?;
        self.codec.decode_response(&reply)
    }

    /// Select the measurement range of every channel and check the acknowledgement.
    pub fn set_range(&mut self, ranges: &[Range]) -> Result<()> {
        let frame = self.codec.encode_range_command(ranges)?;
        debug!("Setting ranges {:?}", ranges.iter().map(|r| r.as_u8()).collect::<Vec<_>>());
        self.write_frame(&frame)?;
        let ack = self.read_frame(RANGE_ACK_LEN).map_err(|e| match e {
            DeviceError::Framing(msg) => DeviceError::Protocol(format!("range ack: {msg}")),
            other => other,
        })?;
        codec::verify_range_ack(&ack)
    }

    /// Drive every heater to zero. Sent before closing a session.
    pub fn send_safe_zero(&mut self, groups: ChannelGroups) -> Result<()> {
        let zeros = vec![0.0; self.codec.channels().get()];
        let frame = self
            .codec
            .encode_setpoint(&zeros, SetpointMode::Voltage, groups)?;
        self.write_frame(&frame)?;
        // The reply carries nothing useful; drain it so the port is left clean.
        if let Err(e) = self.read_frame(self.codec.response_frame_len()) {
            debug!("No reply to safe-zero frame: {e}");
        }
        Ok(())
    }

    /// Discard pending input so the next read starts at a frame boundary.
    pub fn resync(&mut self) -> Result<()> {
        let transport = self.transport_mut()?;
        let mut buf = [0u8; 256];
        let start = Instant::now();
        let mut discarded = 0usize;
        for _ in 0..RESYNC_MAX_READS {
            match transport.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            if start.elapsed() > RESYNC_BUDGET {
                break;
            }
        }
        if discarded > 0 {
            debug!("Resync discarded {discarded} bytes");
        }
        Ok(())
    }

    /// Release the port. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.flush()?;
            debug!("Closed {}", self.label);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport
            .as_mut()
            .ok_or_else(|| DeviceError::Io(std::io::Error::new(ErrorKind::NotConnected, "device is closed")))
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        trace!("-> {frame:02X?}");
        let transport = self.transport_mut()?;
        transport.write_all(frame)?;
        transport.flush()?;
        Ok(())
    }

    /// Read exactly `len` bytes; a short read is a framing error.
    fn read_frame(&mut self, len: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.read_timeout;
        let transport = self.transport_mut()?;
        let mut buf = vec![0u8; len];
        let mut filled = 0usize;
        while filled < len {
            match transport.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(DeviceError::Framing(format!(
                        "stream ended after {filled} of {len} bytes"
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if Instant::now() >= deadline || e.kind() == ErrorKind::TimedOut {
                        return Err(DeviceError::Framing(format!(
                            "timed out after {filled} of {len} bytes"
                        )));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        trace!("<- {buf:02X?}");
        Ok(buf)
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close device: {e}");
        }
    }
}
