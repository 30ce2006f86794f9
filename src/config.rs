//! Device settings and calibration files (YAML).
//!
//! ```yaml
//! # settings.yaml
//! port: /dev/ttyUSB0
//! channel_count: 12
//! multirange: true
//! setpoint_mode: voltage
//! channel_groups: [1, 2, 3]
//! gas_server: 127.0.0.1:5000
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::calibration::{
    calibrated_thresholds, identity, CalibrationSource, LinearFit, LoadResistorCalibration,
    PiecewiseLinear, ScalarFn,
};
use crate::codec::{ChannelCount, ChannelGroups, Range, SetpointMode, DEFAULT_RESISTANCE_CONVERTER};
use crate::device::{DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT};
use crate::errors::ConfigError;
use crate::ranging::{AutoRangeController, RangeMode, Thresholds};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_GAS_TIMEOUT: Duration = Duration::from_millis(1);

// ============================================================================
// Device settings
// ============================================================================

/// Switching voltages per range (outer index = range 1..=3) and channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalVoltages {
    pub top: [Vec<f64>; 3],
    pub bottom: [Vec<f64>; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub channel_count: usize,
    pub multirange: bool,
    /// Heater-resistance scale (LSB per ohm).
    pub resistance_converter: u16,
    /// Active channel groups (1 → 1-4, 2 → 5-8, 3 → 9-12); empty means all.
    pub channel_groups: Vec<u8>,
    pub setpoint_mode: SetpointMode,
    /// Forced ranges; disables auto-ranging when set.
    pub solid_ranges: Option<Vec<u8>>,
    pub critical_voltages: Option<CriticalVoltages>,
    /// `host:port` of the gas-delivery controller.
    pub gas_server: Option<String>,
    pub gas_timeout_ms: u64,
    /// Attempts per tick before the run faults.
    pub max_attempts: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            channel_count: 4,
            multirange: false,
            resistance_converter: DEFAULT_RESISTANCE_CONVERTER,
            channel_groups: Vec::new(),
            setpoint_mode: SetpointMode::Voltage,
            solid_ranges: None,
            critical_voltages: None,
            gas_server: None,
            gas_timeout_ms: DEFAULT_GAS_TIMEOUT.as_millis() as u64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DeviceSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_yaml_str(&content)?;
        debug!("Loaded device settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let channels = self.channels()?;
        if self.resistance_converter == 0 {
            return Err(ConfigError::Invalid("resistance_converter must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        self.groups()?;
        if let Some(ranges) = &self.solid_ranges {
            if ranges.len() != channels.get() {
                return Err(ConfigError::Invalid(format!(
                    "solid_ranges has {} entries for {} channels",
                    ranges.len(),
                    channels.get()
                )));
            }
            self.solid_ranges()?;
        }
        if let Some(critical) = &self.critical_voltages {
            for (i, (top, bottom)) in critical.top.iter().zip(&critical.bottom).enumerate() {
                if top.len() != channels.get() || bottom.len() != channels.get() {
                    return Err(ConfigError::Invalid(format!(
                        "critical_voltages for range {} need {} values",
                        i + 1,
                        channels.get()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn channels(&self) -> Result<ChannelCount, ConfigError> {
        ChannelCount::from_usize(self.channel_count)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn groups(&self) -> Result<ChannelGroups, ConfigError> {
        if self.channel_groups.is_empty() {
            return Ok(ChannelGroups::all(self.channels()?));
        }
        ChannelGroups::from_numbers(self.channel_groups.iter().copied())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn gas_timeout(&self) -> Duration {
        Duration::from_millis(self.gas_timeout_ms)
    }

    pub fn solid_ranges(&self) -> Result<Option<Vec<Range>>, ConfigError> {
        self.solid_ranges
            .as_ref()
            .map(|ranges| {
                ranges
                    .iter()
                    .map(|&r| {
                        Range::from_u8(r)
                            .ok_or_else(|| ConfigError::Invalid(format!("range {r} does not exist")))
                    })
                    .collect()
            })
            .transpose()
    }

    /// Explicit thresholds win over calibration-derived ones, which win over the defaults.
    pub fn thresholds(&self, calibration: Option<&dyn CalibrationSource>) -> Result<Thresholds, ConfigError> {
        if let Some(critical) = &self.critical_voltages {
            return Ok(Thresholds::Calibrated {
                top: critical.top.clone(),
                bottom: critical.bottom.clone(),
            });
        }
        Ok(match calibration {
            Some(source) => calibrated_thresholds(source, self.channels()?),
            None => Thresholds::default(),
        })
    }

    pub fn range_mode(&self, calibration: Option<&dyn CalibrationSource>) -> Result<RangeMode, ConfigError> {
        if !self.multirange {
            return Ok(RangeMode::Disabled);
        }
        if let Some(ranges) = self.solid_ranges()? {
            return Ok(RangeMode::fixed(ranges));
        }
        Ok(RangeMode::Auto(AutoRangeController::new(self.thresholds(calibration)?)))
    }
}

// ============================================================================
// Calibration file
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResistorEntry {
    pub range: u8,
    pub rs_u1: f64,
    pub rs_u2: f64,
    /// Overrides the nominal load resistor of `range`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r4: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    #[serde(default = "default_working")]
    pub working: bool,
    #[serde(default)]
    pub temperature_to_voltage: Option<PiecewiseLinear>,
    #[serde(default)]
    pub temperature_to_resistance: Option<LinearFit>,
    #[serde(default)]
    pub load_resistors: Vec<LoadResistorEntry>,
}

fn default_working() -> bool {
    true
}

/// Per-channel calibration, indexed by channel position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub channels: Vec<ChannelCalibration>,
}

impl CalibrationFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let file = Self::from_yaml_str(&content)?;
        debug!(
            "Loaded calibration for {} channels from {}",
            file.channels.len(),
            path.display()
        );
        Ok(file)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let file: Self = serde_yaml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (channel, cal) in self.channels.iter().enumerate() {
            let mut seen = HashSet::new();
            for entry in &cal.load_resistors {
                if Range::from_u8(entry.range).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "channel {channel}: range {} does not exist",
                        entry.range
                    )));
                }
                if !seen.insert(entry.range) {
                    return Err(ConfigError::Invalid(format!(
                        "channel {channel}: range {} calibrated twice",
                        entry.range
                    )));
                }
            }
        }
        Ok(())
    }
}

impl CalibrationSource for CalibrationFile {
    fn is_working(&self, channel: usize) -> bool {
        self.channels.get(channel).is_some_and(|c| c.working)
    }

    fn temperature_to_voltage(&self, channel: usize) -> Option<ScalarFn> {
        let table = self.channels.get(channel)?.temperature_to_voltage.clone()?;
        Some(std::sync::Arc::new(move |t| table.eval(t)))
    }

    fn temperature_to_resistance(&self, channel: usize) -> Option<ScalarFn> {
        let fit = self.channels.get(channel)?.temperature_to_resistance?;
        Some(std::sync::Arc::new(move |t| fit.eval(t)))
    }

    fn load_resistors(&self, channel: usize) -> [Option<LoadResistorCalibration>; 3] {
        let mut table = [None; 3];
        let Some(cal) = self.channels.get(channel) else {
            return table;
        };
        for entry in &cal.load_resistors {
            if let Some(range) = Range::from_u8(entry.range) {
                let mut bridge = LoadResistorCalibration::for_range(entry.rs_u1, entry.rs_u2, range);
                if let Some(r4) = entry.r4 {
                    bridge.r4 = r4;
                }
                table[range.index()] = Some(bridge);
            }
        }
        table
    }
}

/// Calibration source that treats every channel as uncalibrated but working.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uncalibrated;

impl CalibrationSource for Uncalibrated {
    fn is_working(&self, _channel: usize) -> bool {
        true
    }

    fn temperature_to_voltage(&self, _channel: usize) -> Option<ScalarFn> {
        Some(identity())
    }

    fn temperature_to_resistance(&self, _channel: usize) -> Option<ScalarFn> {
        Some(identity())
    }

    fn load_resistors(&self, _channel: usize) -> [Option<LoadResistorCalibration>; 3] {
        [None; 3]
    }
}
