//! Program document model and validation.
//!
//! A document is parsed in two passes: stages are first read as raw YAML
//! values so that the `type` discriminator can be reported with its index,
//! then each stage is deserialized into its typed form and compiled into a
//! [`Stage`] whose every derived quantity (tables, gas cycles, template
//! expansions) is resolved before any tick is produced.

use serde::{Deserialize, Serialize};

use super::gas::{GasCycle, GasStageSpec};
use crate::calibration::PiecewiseLinear;
use crate::errors::ProgramError;

/// Number of temperature slots in every tick, regardless of device size.
pub const TEMPERATURE_SLOTS: usize = 12;

/// Float tolerance applied before rounding tick counts up.
const TICK_EPSILON: f64 = 1e-9;

/// Stage ids are `u32`, so a program allocates at most this many blocks.
pub const MAX_PROGRAM_BLOCKS: u64 = u32::MAX as u64 + 1;

// ============================================================================
// Document
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSettings {
    /// Tick rate in Hz.
    pub frequency: f64,
}

impl ProgramSettings {
    pub fn step(&self) -> f64 {
        1.0 / self.frequency
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProgramDocument {
    pub settings: ProgramSettings,
    #[serde(default)]
    pub program: Vec<serde_yaml::Value>,
}

// ============================================================================
// Stage kinds
// ============================================================================

/// Stage discriminator; the numeric code is persisted in acquisition logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Simple = 0,
    Stepwise = 1,
    Cyclic = 2,
}

impl StageKind {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(StageKind::Simple),
            1 => Some(StageKind::Stepwise),
            2 => Some(StageKind::Cyclic),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "simple" => Some(StageKind::Simple),
            "stepwise" => Some(StageKind::Stepwise),
            "cyclic" => Some(StageKind::Cyclic),
            _ => None,
        }
    }
}

/// A scalar is broadcast to every slot; a list is used per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemperatureSpec {
    Scalar(f64),
    List(Vec<f64>),
}

// ============================================================================
// Raw stage bodies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleStageSpec {
    pub time: f64,
    pub temperature: TemperatureSpec,
    pub gas_state: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepwiseStageSpec {
    pub time: f64,
    pub temperature_start: f64,
    pub temperature_stop: f64,
    pub temperature_step: f64,
    #[serde(default = "one")]
    pub cycles: u32,
    pub gas_states: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclicTableSpec {
    pub time: Vec<f64>,
    pub temperature: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclicStageSpec {
    pub temperatures: CyclicTableSpec,
    #[serde(default = "one")]
    pub repeat: u32,
    pub gas_states: Vec<GasStageSpec>,
}

fn one() -> u32 {
    1
}

// ============================================================================
// Compiled stages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleStage {
    pub ticks: u64,
    pub temperatures: [f64; TEMPERATURE_SLOTS],
    pub gas_state: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepwiseStage {
    pub ticks_per_block: u64,
    pub start: f64,
    /// Signed increment between temperature points.
    pub increment: f64,
    pub points: u64,
    pub cycles: u32,
    pub gas_states: Vec<u8>,
}

impl StepwiseStage {
    pub fn temperature(&self, point: u64) -> f64 {
        self.start + point as f64 * self.increment
    }

    /// Saturates at `u64::MAX`; compiled stages never get there.
    pub fn blocks(&self) -> u64 {
        self.checked_blocks().unwrap_or(u64::MAX)
    }

    fn checked_blocks(&self) -> Option<u64> {
        self.points
            .checked_mul(u64::from(self.cycles))?
            .checked_mul(self.gas_states.len() as u64)
    }

    /// `(temperature, gas state)` of block `b` (temperature-major, then cycle, then gas).
    pub fn block(&self, b: u64) -> (f64, u8) {
        let gases = self.gas_states.len() as u64;
        let per_point = u64::from(self.cycles).saturating_mul(gases);
        let point = b / per_point;
        let gas = self.gas_states[(b % gases) as usize];
        (self.temperature(point), gas)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CyclicStage {
    pub table: PiecewiseLinear,
    pub max_time: f64,
    pub ticks_per_repeat: u64,
    pub repeat: u32,
    pub gas_cycle: GasCycle,
}

/// A validated stage, ready for expansion.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Simple(SimpleStage),
    Stepwise(StepwiseStage),
    Cyclic(CyclicStage),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Simple(_) => StageKind::Simple,
            Stage::Stepwise(_) => StageKind::Stepwise,
            Stage::Cyclic(_) => StageKind::Cyclic,
        }
    }

    /// Number of stage ids this stage allocates.
    pub fn blocks(&self) -> u64 {
        self.checked_blocks().unwrap_or(u64::MAX)
    }

    fn checked_blocks(&self) -> Option<u64> {
        match self {
            Stage::Simple(_) => Some(1),
            Stage::Stepwise(s) => s.checked_blocks(),
            Stage::Cyclic(c) => Some(u64::from(c.repeat)),
        }
    }

    pub fn ticks_per_block(&self) -> u64 {
        match self {
            Stage::Simple(s) => s.ticks,
            Stage::Stepwise(s) => s.ticks_per_block,
            Stage::Cyclic(c) => c.ticks_per_repeat,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.checked_tick_count().unwrap_or(u64::MAX)
    }

    /// `None` when the expansion does not fit in a `u64`.
    pub fn checked_tick_count(&self) -> Option<u64> {
        self.checked_blocks()?.checked_mul(self.ticks_per_block())
    }

    /// Smallest and largest temperature the stage emits, `None` if it emits no ticks.
    pub fn temperature_extent(&self) -> Option<(f64, f64)> {
        if self.tick_count() == 0 {
            return None;
        }
        match self {
            Stage::Simple(s) => Some(min_max(s.temperatures.iter().copied())),
            Stage::Stepwise(s) => {
                let first = s.temperature(0);
                let last = s.temperature(s.points - 1);
                Some((first.min(last), first.max(last)))
            }
            Stage::Cyclic(c) => Some(min_max(c.table.ys().iter().copied())),
        }
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// `ceil(duration / step)` with float-noise tolerance, never negative.
pub fn tick_count(duration: f64, step: f64) -> u64 {
    let n = (duration / step - TICK_EPSILON).ceil();
    if n > 0.0 {
        n as u64
    } else {
        0
    }
}

/// Broadcast a temperature spec to every slot.
///
/// Lists shorter than the slot count are padded with their own minimum.
pub fn broadcast_temperatures(
    spec: &TemperatureSpec,
) -> Result<[f64; TEMPERATURE_SLOTS], String> {
    match spec {
        TemperatureSpec::Scalar(t) => {
            check_finite(*t, "temperature")?;
            Ok([*t; TEMPERATURE_SLOTS])
        }
        TemperatureSpec::List(list) => {
            if list.is_empty() {
                return Err("temperature list is empty".into());
            }
            if list.len() > TEMPERATURE_SLOTS {
                return Err(format!(
                    "temperature list has {} entries, at most {TEMPERATURE_SLOTS} allowed",
                    list.len()
                ));
            }
            for &t in list {
                check_finite(t, "temperature")?;
            }
            let min = list.iter().copied().fold(f64::INFINITY, f64::min);
            let mut out = [min; TEMPERATURE_SLOTS];
            out[..list.len()].copy_from_slice(list);
            Ok(out)
        }
    }
}

fn check_finite(value: f64, what: &str) -> Result<(), String> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(format!("{what} must be finite, got {value}"))
    }
}

fn check_duration(value: f64, what: &str) -> Result<(), String> {
    check_finite(value, what)?;
    if value < 0.0 {
        return Err(format!("{what} must be non-negative, got {value}"));
    }
    Ok(())
}

// ============================================================================
// Compilation
// ============================================================================

/// Deserialize and validate stage `index` of a document.
pub(crate) fn compile_stage(
    index: usize,
    value: serde_yaml::Value,
    step: f64,
) -> Result<Stage, ProgramError> {
    let kind_name = value
        .get("type")
        .and_then(serde_yaml::Value::as_str)
        .ok_or_else(|| ProgramError::stage(index, "missing `type`"))?;
    let kind = StageKind::from_name(kind_name).ok_or_else(|| ProgramError::UnknownStageType {
        index,
        kind: kind_name.to_string(),
    })?;

    let invalid = |e: serde_yaml::Error| ProgramError::stage(index, e.to_string());
    let stage = match kind {
        StageKind::Simple => {
            compile_simple(serde_yaml::from_value(value).map_err(invalid)?, step)
        }
        StageKind::Stepwise => {
            compile_stepwise(serde_yaml::from_value(value).map_err(invalid)?, step)
        }
        StageKind::Cyclic => {
            compile_cyclic(serde_yaml::from_value(value).map_err(invalid)?, step)
        }
    };
    let stage = stage.map_err(|reason| ProgramError::stage(index, reason))?;
    if stage.blocks() > MAX_PROGRAM_BLOCKS {
        return Err(ProgramError::stage(
            index,
            format!("stage allocates more than {MAX_PROGRAM_BLOCKS} stage ids"),
        ));
    }
    if stage.checked_tick_count().is_none() {
        return Err(ProgramError::stage(index, "stage expands to more ticks than fit in 64 bits"));
    }
    Ok(stage)
}

fn compile_simple(spec: SimpleStageSpec, step: f64) -> Result<Stage, String> {
    check_duration(spec.time, "time")?;
    Ok(Stage::Simple(SimpleStage {
        ticks: tick_count(spec.time, step),
        temperatures: broadcast_temperatures(&spec.temperature)?,
        gas_state: spec.gas_state,
    }))
}

fn compile_stepwise(spec: StepwiseStageSpec, step: f64) -> Result<Stage, String> {
    check_duration(spec.time, "time")?;
    check_finite(spec.temperature_start, "temperature_start")?;
    check_finite(spec.temperature_stop, "temperature_stop")?;
    check_finite(spec.temperature_step, "temperature_step")?;
    if spec.temperature_step <= 0.0 {
        return Err(format!(
            "temperature_step must be positive, got {}",
            spec.temperature_step
        ));
    }
    let span = (spec.temperature_stop - spec.temperature_start).abs();
    let increment = if spec.temperature_start > spec.temperature_stop {
        -spec.temperature_step
    } else {
        spec.temperature_step
    };
    Ok(Stage::Stepwise(StepwiseStage {
        ticks_per_block: tick_count(spec.time, step),
        start: spec.temperature_start,
        increment,
        points: tick_count(span, spec.temperature_step),
        cycles: spec.cycles,
        gas_states: spec.gas_states,
    }))
}

fn compile_cyclic(spec: CyclicStageSpec, step: f64) -> Result<Stage, String> {
    let table = PiecewiseLinear::new(spec.temperatures.time, spec.temperatures.temperature)
        .map_err(|e| format!("temperatures: {e}"))?;
    if table.first_x() > 0.0 {
        return Err(format!(
            "temperatures: table must start at or before time 0, starts at {}",
            table.first_x()
        ));
    }
    let max_time = table.last_x();
    let gas_cycle = GasCycle::compile(&spec.gas_states, max_time)?;
    if gas_cycle.is_empty() && spec.repeat > 0 {
        return Err("gas_states: at least one gas state is required".into());
    }
    Ok(Stage::Cyclic(CyclicStage {
        table,
        max_time,
        ticks_per_repeat: tick_count(max_time, step),
        repeat: spec.repeat,
        gas_cycle,
    }))
}
