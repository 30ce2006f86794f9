//! Multisensor gas-sensor instrument driver and acquisition core.
//!
//! The instrument heats up to twelve metal-oxide sensors and reports their
//! voltages over a serial link. This crate provides:
//!
//! - [`codec`]: the binary frame format (setpoints, responses, range commands)
//! - [`device`]: a serial [`DeviceChannel`] plus an in-memory [`Emulator`]
//! - [`ranging`]: per-channel automatic range switching with hysteresis
//! - [`program`]: declarative temperature/gas programs expanded into ticks
//! - [`acquisition`]: the real-time loop that paces ticks and fans them out
//!
//! # Timing
//!
//! Ticks are due at `run_start + index / frequency`. When I/O is slower than
//! the program the loop falls behind rather than skipping ticks, so every
//! program tick appears exactly once in the log.

pub mod acquisition;
pub mod calibration;
pub mod codec;
pub mod config;
pub mod device;
mod errors;
pub mod logging;
pub mod program;
pub mod ranging;

#[cfg(feature = "python")]
mod python;

pub use acquisition::{AcquisitionLoop, LoopEvent, LoopState, RunSummary, Tick};
pub use calibration::{ConversionMode, Converters};
pub use codec::{ChannelCount, ChannelGroups, FrameCodec, Response, SetpointMode};
pub use config::{CalibrationFile, DeviceSettings};
pub use device::{DeviceChannel, Emulator, Transport};
pub use errors::*;
pub use program::{ProgramGenerator, ProgramTick};
pub use ranging::{AutoRangeController, ChannelSet, Range, RangeMode, Thresholds};
