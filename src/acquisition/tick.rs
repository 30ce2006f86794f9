use chrono::{DateTime, Local};

use crate::program::StageKind;
use crate::ranging::Range;

/// One acquisition step, immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Program time of this tick in seconds.
    pub elapsed: f64,
    /// Wall-clock time at which the measurement completed.
    pub timestamp: DateTime<Local>,
    /// Sensor voltages.
    pub voltages: Vec<f64>,
    /// Heater resistances reported by the instrument.
    pub resistances: Vec<f64>,
    /// Sensor resistances converted from the voltages.
    pub converted: Vec<f64>,
    /// Target temperatures of the device's channels.
    pub temperatures: Vec<f64>,
    /// Values actually sent (volts or ohms).
    pub setpoints: Vec<f64>,
    pub gas_state: u8,
    pub stage_id: u32,
    pub kind: StageKind,
    /// Ranges in effect during the measurement.
    pub ranges: Vec<Range>,
}

impl Tick {
    pub fn channel_count(&self) -> usize {
        self.voltages.len()
    }
}
