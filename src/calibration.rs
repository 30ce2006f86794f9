//! Conversion between temperatures, setpoints, voltages and resistances.
//!
//! Calibration constants come from an external source (a calibration file or
//! the GUI's database); this module only evaluates them.

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{ChannelCount, Range, SetpointMode};
use crate::errors::TableError;
use crate::ranging::Thresholds;

/// Gain of the measurement bridge.
pub const BRIDGE_GAIN: f64 = 4.068;
/// Reported resistance when the voltage is past the bridge asymptote.
pub const OPEN_CIRCUIT_RESISTANCE: f64 = 1e14;

const CRITICAL_VOLTAGE_MARGIN: f64 = 0.1;
const FULL_SCALE_VOLTS: f64 = 5.0;
const HALF_SCALE_VOLTS: f64 = 2.5;

/// Load resistor (ohms) selected by each measurement range.
pub fn load_resistor(range: Range) -> f64 {
    match range {
        Range::R1 => 100e3,
        Range::R2 => 1.1e6,
        Range::R3 => 11.1e6,
    }
}

/// A scalar conversion function, shared between threads.
pub type ScalarFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

pub fn identity() -> ScalarFn {
    Arc::new(|x| x)
}

pub fn constant(value: f64) -> ScalarFn {
    Arc::new(move |_| value)
}

// ============================================================================
// Interpolation
// ============================================================================

/// Piecewise-linear interpolant; constant outside the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTable", into = "RawTable")]
pub struct PiecewiseLinear {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct RawTable {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl TryFrom<RawTable> for PiecewiseLinear {
    type Error = TableError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        PiecewiseLinear::new(raw.x, raw.y)
    }
}

impl From<PiecewiseLinear> for RawTable {
    fn from(table: PiecewiseLinear) -> Self {
        RawTable {
            x: table.xs,
            y: table.ys,
        }
    }
}

impl PiecewiseLinear {
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Result<Self, TableError> {
        if xs.len() != ys.len() {
            return Err(TableError::LengthMismatch {
                xs: xs.len(),
                ys: ys.len(),
            });
        }
        if xs.is_empty() {
            return Err(TableError::Empty);
        }
        if let Some(i) = xs
            .iter()
            .zip(&ys)
            .position(|(x, y)| !x.is_finite() || !y.is_finite())
        {
            return Err(TableError::NonFinite(i));
        }
        if let Some(i) = xs.windows(2).position(|w| w[1] <= w[0]) {
            return Err(TableError::NotIncreasing(i + 1));
        }
        Ok(Self { xs, ys })
    }

    pub fn first_x(&self) -> f64 {
        self.xs[0]
    }

    pub fn last_x(&self) -> f64 {
        self.xs[self.xs.len() - 1]
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn eval(&self, x: f64) -> f64 {
        let last = self.xs.len() - 1;
        if x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= self.xs[last] {
            return self.ys[last];
        }
        // First index with xs[i] > x; guaranteed in 1..=last by the checks above.
        let i = self.xs.partition_point(|&v| v <= x);
        let (x0, x1) = (self.xs[i - 1], self.xs[i]);
        let (y0, y1) = (self.ys[i - 1], self.ys[i]);
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }
}

/// `y = intercept + slope * x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
}

impl LinearFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

// ============================================================================
// Load-resistor bridge
// ============================================================================

/// Calibration of one channel's bridge in one range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadResistorCalibration {
    pub rs_u1: f64,
    pub rs_u2: f64,
    /// Load resistor in ohms.
    pub r4: f64,
}

impl LoadResistorCalibration {
    /// Calibration using the nominal load resistor of `range`.
    pub fn for_range(rs_u1: f64, rs_u2: f64, range: Range) -> Self {
        Self {
            rs_u1,
            rs_u2,
            r4: load_resistor(range),
        }
    }

    /// Voltage at which the bridge formula diverges.
    pub fn asymptote(&self) -> f64 {
        HALF_SCALE_VOLTS + BRIDGE_GAIN * (HALF_SCALE_VOLTS - self.rs_u2)
    }

    /// Sensor resistance for a measured voltage.
    pub fn voltage_to_resistance(&self, u: f64) -> f64 {
        if u >= self.asymptote() {
            return OPEN_CIRCUIT_RESISTANCE;
        }
        let k = BRIDGE_GAIN;
        (self.rs_u1 - self.rs_u2) * self.r4
            / ((HALF_SCALE_VOLTS + HALF_SCALE_VOLTS * k - u) / k - self.rs_u2)
            - self.r4
    }

    pub fn to_fn(self) -> ScalarFn {
        Arc::new(move |u| self.voltage_to_resistance(u))
    }
}

/// Voltage where the resistance curves of two adjacent ranges intersect.
///
/// Returns `None` when the curves do not intersect (equal load resistors or a
/// negative discriminant).
pub fn critical_voltage(
    first: &LoadResistorCalibration,
    second: &LoadResistorCalibration,
) -> Option<f64> {
    let k = BRIDGE_GAIN;
    let alpha1 = k * (first.rs_u1 - first.rs_u2) * first.r4;
    let alpha2 = k * (second.rs_u1 - second.rs_u2) * second.r4;
    let beta1 = HALF_SCALE_VOLTS + k * (HALF_SCALE_VOLTS - first.rs_u2);
    let beta2 = HALF_SCALE_VOLTS + k * (HALF_SCALE_VOLTS - second.rs_u2);
    let delta = first.r4 - second.r4;

    let a = delta;
    let b = alpha1 + alpha2 + delta * (beta2 - beta1 - FULL_SCALE_VOLTS);
    let c = alpha1 * beta2 - alpha2 * beta1 + delta * FULL_SCALE_VOLTS * beta1
        - delta * beta1 * beta2
        - FULL_SCALE_VOLTS * alpha1;

    let discriminant = b * b - 4.0 * a * c;
    if a == 0.0 || discriminant < 0.0 {
        return None;
    }
    let root = (-b + discriminant.sqrt()) / 2.0 / a;
    root.is_finite().then_some(root)
}

/// `(top, bottom)` switching voltages for a channel currently in `range`.
///
/// `table` holds the bridge calibration of ranges 1..=3. Missing neighbours
/// fall back to the full-scale limits `(5.0, 0.0)`.
pub fn critical_voltages_for_range(
    table: &[Option<LoadResistorCalibration>; 3],
    range: Range,
) -> (f64, f64) {
    let Some(current) = table[range.index()] else {
        return (FULL_SCALE_VOLTS, 0.0);
    };

    let top = match range {
        Range::R3 => FULL_SCALE_VOLTS,
        _ => table[range.up().index()]
            .and_then(|next| critical_voltage(&current, &next))
            .map(|v| v + CRITICAL_VOLTAGE_MARGIN)
            .unwrap_or(FULL_SCALE_VOLTS),
    };
    let bottom = match range {
        Range::R1 => 0.0,
        _ => table[range.down().index()]
            .and_then(|prev| critical_voltage(&prev, &current))
            .map(|v| FULL_SCALE_VOLTS - v - CRITICAL_VOLTAGE_MARGIN)
            .unwrap_or(0.0),
    };
    (top, bottom)
}

// ============================================================================
// Conversion Modes
// ============================================================================

/// Voltage → resistance conversion for one channel, chosen once per configuration.
#[derive(Clone)]
pub enum ConversionMode {
    /// One function per range (index `0..3`).
    Multirange([ScalarFn; 3]),
    SingleRange(ScalarFn),
}

impl std::fmt::Debug for ConversionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionMode::Multirange(_) => f.write_str("Multirange(..)"),
            ConversionMode::SingleRange(_) => f.write_str("SingleRange(..)"),
        }
    }
}

impl ConversionMode {
    pub fn identity() -> Self {
        ConversionMode::SingleRange(identity())
    }

    pub fn convert(&self, range: Range, u: f64) -> f64 {
        match self {
            ConversionMode::Multirange(funcs) => funcs[range.index()](u),
            ConversionMode::SingleRange(func) => func(u),
        }
    }
}

/// Supplier of per-channel conversion functions.
pub trait CalibrationSource {
    /// Whether the channel has a working sensor. Non-working channels get zero setpoints.
    fn is_working(&self, channel: usize) -> bool;
    fn temperature_to_voltage(&self, channel: usize) -> Option<ScalarFn>;
    fn temperature_to_resistance(&self, channel: usize) -> Option<ScalarFn>;
    /// Bridge calibration for ranges 1..=3 (`None` where uncalibrated).
    fn load_resistors(&self, channel: usize) -> [Option<LoadResistorCalibration>; 3];
}

/// Per-channel conversion functions for one acquisition session.
#[derive(Clone)]
pub struct Converters {
    mode: SetpointMode,
    setpoint: Vec<ScalarFn>,
    resistance: Vec<ConversionMode>,
}

impl std::fmt::Debug for Converters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converters")
            .field("mode", &self.mode)
            .field("channels", &self.setpoint.len())
            .field("resistance", &self.resistance)
            .finish()
    }
}

impl Converters {
    /// Treat program temperatures as raw setpoints and report raw voltages.
    pub fn passthrough(channels: ChannelCount, mode: SetpointMode) -> Self {
        let n = channels.get();
        Self {
            mode,
            setpoint: vec![identity(); n],
            resistance: vec![ConversionMode::identity(); n],
        }
    }

    pub fn from_source(
        source: &dyn CalibrationSource,
        channels: ChannelCount,
        mode: SetpointMode,
        multirange: bool,
    ) -> Self {
        let n = channels.get();
        let mut setpoint = Vec::with_capacity(n);
        let mut resistance = Vec::with_capacity(n);
        for channel in 0..n {
            let func = if source.is_working(channel) {
                match mode {
                    SetpointMode::Voltage => source.temperature_to_voltage(channel),
                    SetpointMode::Resistance => source.temperature_to_resistance(channel),
                }
            } else {
                None
            };
            setpoint.push(func.unwrap_or_else(|| {
                debug!("Channel {channel}: no {mode:?} calibration, setpoint forced to 0");
                constant(0.0)
            }));

            let bridges = source.load_resistors(channel);
            let to_fn = |cal: Option<LoadResistorCalibration>| cal.map_or_else(identity, |c| c.to_fn());
            resistance.push(if multirange {
                ConversionMode::Multirange([to_fn(bridges[0]), to_fn(bridges[1]), to_fn(bridges[2])])
            } else {
                ConversionMode::SingleRange(to_fn(bridges[0]))
            });
        }
        Self {
            mode,
            setpoint,
            resistance,
        }
    }

    pub fn mode(&self) -> SetpointMode {
        self.mode
    }

    pub fn channel_count(&self) -> usize {
        self.setpoint.len()
    }

    /// Setpoints for the first `channel_count` temperatures.
    pub fn setpoints(&self, temperatures: &[f64]) -> Vec<f64> {
        self.setpoint
            .iter()
            .zip(temperatures)
            .map(|(f, &t)| f(t))
            .collect()
    }

    pub fn resistances(&self, voltages: &[f64], ranges: &[Range]) -> Vec<f64> {
        self.resistance
            .iter()
            .zip(voltages.iter().zip(ranges))
            .map(|(conv, (&u, &range))| conv.convert(range, u))
            .collect()
    }
}

/// Calibrated switching thresholds for every channel.
pub fn calibrated_thresholds(source: &dyn CalibrationSource, channels: ChannelCount) -> Thresholds {
    let mut top: [Vec<f64>; 3] = Default::default();
    let mut bottom: [Vec<f64>; 3] = Default::default();
    for channel in 0..channels.get() {
        let table = source.load_resistors(channel);
        for range in Range::ALL {
            let (t, b) = critical_voltages_for_range(&table, range);
            if t <= b {
                warn!(
                    "Channel {channel} range {}: critical voltages overlap ({t:.3} <= {b:.3})",
                    range.as_u8()
                );
            }
            top[range.index()].push(t);
            bottom[range.index()].push(b);
        }
    }
    Thresholds::Calibrated { top, bottom }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(range: Range) -> LoadResistorCalibration {
        LoadResistorCalibration::for_range(2.0, 1.0, range)
    }

    #[test]
    fn piecewise_linear_interpolates_and_clamps() {
        let table = PiecewiseLinear::new(vec![0.0, 10.0, 20.0], vec![100.0, 200.0, 0.0]).unwrap();
        assert!((table.eval(5.0) - 150.0).abs() < 1e-12);
        assert!((table.eval(15.0) - 100.0).abs() < 1e-12);
        assert_eq!(table.eval(-1.0), 100.0);
        assert_eq!(table.eval(30.0), 0.0);
        assert_eq!(table.eval(10.0), 200.0);
    }

    #[test]
    fn piecewise_linear_rejects_bad_tables() {
        assert_eq!(PiecewiseLinear::new(vec![], vec![]), Err(TableError::Empty));
        assert_eq!(
            PiecewiseLinear::new(vec![0.0, 1.0], vec![1.0]),
            Err(TableError::LengthMismatch { xs: 2, ys: 1 })
        );
        assert_eq!(
            PiecewiseLinear::new(vec![0.0, 1.0, 1.0], vec![1.0; 3]),
            Err(TableError::NotIncreasing(2))
        );
        assert_eq!(
            PiecewiseLinear::new(vec![0.0, f64::NAN], vec![1.0; 2]),
            Err(TableError::NonFinite(1))
        );
    }

    #[test]
    fn single_point_table_is_constant() {
        let table = PiecewiseLinear::new(vec![0.0], vec![42.0]).unwrap();
        assert_eq!(table.eval(-5.0), 42.0);
        assert_eq!(table.eval(5.0), 42.0);
    }

    #[test]
    fn bridge_formula_and_asymptote() {
        let cal = bridge(Range::R1);
        // asymptote = 2.5 + 4.068 * 1.5
        assert!((cal.asymptote() - 8.602).abs() < 1e-9);
        assert_eq!(cal.voltage_to_resistance(9.0), OPEN_CIRCUIT_RESISTANCE);

        let u = 2.5;
        let expected = 1.0 * 100e3 / ((2.5 + 2.5 * 4.068 - u) / 4.068 - 1.0) - 100e3;
        assert!((cal.voltage_to_resistance(u) - expected).abs() < 1e-6);
    }

    #[test]
    fn critical_voltage_is_where_adjacent_ranges_agree() {
        let low = bridge(Range::R1);
        let high = bridge(Range::R2);
        let u1 = critical_voltage(&low, &high).unwrap();
        // The second range is read at the mirrored voltage 5 - u.
        let r_low = low.voltage_to_resistance(u1);
        let r_high = high.voltage_to_resistance(5.0 - u1);
        assert!(
            ((r_low - r_high) / r_low).abs() < 1e-6,
            "u={u1} r_low={r_low} r_high={r_high}"
        );
    }

    #[test]
    fn identical_load_resistors_have_no_intersection() {
        let cal = bridge(Range::R1);
        assert_eq!(critical_voltage(&cal, &cal), None);
    }

    #[test]
    fn critical_voltages_edges() {
        let table = [Some(bridge(Range::R1)), Some(bridge(Range::R2)), Some(bridge(Range::R3))];
        let (top1, bottom1) = critical_voltages_for_range(&table, Range::R1);
        assert_eq!(bottom1, 0.0);
        assert!(top1 < 5.0);
        let (top3, bottom3) = critical_voltages_for_range(&table, Range::R3);
        assert_eq!(top3, 5.0);
        assert!(bottom3 > 0.0);

        let sparse = [None, Some(bridge(Range::R2)), None];
        assert_eq!(critical_voltages_for_range(&sparse, Range::R1), (5.0, 0.0));
        assert_eq!(critical_voltages_for_range(&sparse, Range::R2), (5.0, 0.0));
    }

    #[test]
    fn conversion_mode_dispatches_by_range() {
        let mode = ConversionMode::Multirange([constant(1.0), constant(2.0), constant(3.0)]);
        assert_eq!(mode.convert(Range::R2, 0.0), 2.0);
        assert_eq!(ConversionMode::identity().convert(Range::R3, 1.25), 1.25);
    }

    #[test]
    fn passthrough_converters() {
        let conv = Converters::passthrough(ChannelCount::Four, SetpointMode::Voltage);
        assert_eq!(conv.setpoints(&[1.0, 2.0, 3.0, 4.0, 5.0]), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            conv.resistances(&[0.5; 4], &[Range::R1; 4]),
            vec![0.5; 4]
        );
    }
}
