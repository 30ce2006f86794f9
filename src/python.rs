//! Python bindings (`_core` extension module).

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::codec::{ChannelCount, ChannelGroups, FrameCodec, Range, SetpointMode, DEFAULT_RESISTANCE_CONVERTER};
use crate::errors::{DeviceError, ProgramError};
use crate::program::{ProgramGenerator, ProgramTick};

fn program_err(e: ProgramError) -> PyErr {
    match e {
        ProgramError::Io(e) => PyIOError::new_err(e.to_string()),
        other => PyValueError::new_err(other.to_string()),
    }
}

fn device_err(e: DeviceError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn parse_mode(mode: &str) -> PyResult<SetpointMode> {
    match mode {
        "voltage" | "u" => Ok(SetpointMode::Voltage),
        "resistance" | "r" => Ok(SetpointMode::Resistance),
        other => Err(PyValueError::new_err(format!("unknown setpoint mode {other:?}"))),
    }
}

fn codec(channels: usize, converter: u16) -> PyResult<FrameCodec> {
    let channels = ChannelCount::from_usize(channels).map_err(device_err)?;
    FrameCodec::new(channels, converter).map_err(device_err)
}

// ============================================================================
// Program
// ============================================================================

/// One expanded program tick.
///
/// Attributes:
///     elapsed: Seconds since the program start.
///     temperatures: Target temperature of all 12 slots.
///     gas_state: Gas-state code.
///     stage_id: Block identifier, stable across expansions.
///     kind: 0 simple, 1 stepwise, 2 cyclic.
#[pyclass(name = "Tick", frozen, eq)]
#[derive(Clone, PartialEq)]
struct PyTick {
    #[pyo3(get)]
    elapsed: f64,
    #[pyo3(get)]
    temperatures: Vec<f64>,
    #[pyo3(get)]
    gas_state: u8,
    #[pyo3(get)]
    stage_id: u32,
    #[pyo3(get)]
    kind: u16,
}

#[pymethods]
impl PyTick {
    fn __repr__(&self) -> String {
        format!(
            "Tick(elapsed={:.3}, gas_state={}, stage_id={}, kind={})",
            self.elapsed, self.gas_state, self.stage_id, self.kind
        )
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("elapsed", self.elapsed)?;
        dict.set_item("temperatures", self.temperatures.clone())?;
        dict.set_item("gas_state", self.gas_state)?;
        dict.set_item("stage_id", self.stage_id)?;
        dict.set_item("kind", self.kind)?;
        Ok(dict)
    }
}

impl From<ProgramTick> for PyTick {
    fn from(t: ProgramTick) -> Self {
        PyTick {
            elapsed: t.elapsed,
            temperatures: t.temperatures.to_vec(),
            gas_state: t.gas_state,
            stage_id: t.stage_id,
            kind: t.kind.code(),
        }
    }
}

/// Validated experiment program.
///
/// Example:
///     >>> program = Program.from_yaml(open("program.yaml").read())
///     >>> program.full_time
///     >>> ticks = program.ticks(limit=100)
#[pyclass(name = "Program", frozen)]
struct PyProgram {
    inner: ProgramGenerator,
}

#[pymethods]
impl PyProgram {
    #[staticmethod]
    fn from_yaml(text: &str) -> PyResult<Self> {
        ProgramGenerator::from_yaml_str(text)
            .map(|inner| PyProgram { inner })
            .map_err(program_err)
    }

    #[staticmethod]
    fn load(path: &str) -> PyResult<Self> {
        ProgramGenerator::load(path)
            .map(|inner| PyProgram { inner })
            .map_err(program_err)
    }

    #[getter]
    fn frequency(&self) -> f64 {
        self.inner.settings().frequency
    }

    /// Total duration in seconds.
    #[getter]
    fn full_time(&self) -> f64 {
        self.inner.calculate_full_time()
    }

    /// `(min, max)` target temperature, or None for a program without ticks.
    #[getter]
    fn temperature_extent(&self) -> Option<(f64, f64)> {
        self.inner.calculate_min_and_max_temperatures()
    }

    #[getter]
    fn tick_count(&self) -> u64 {
        self.inner.tick_count()
    }

    /// Expand the program from the start, optionally stopping after `limit` ticks.
    #[pyo3(signature = (limit=None))]
    fn ticks(&self, limit: Option<usize>) -> Vec<PyTick> {
        let ticks = self.inner.parse_program_to_queue();
        match limit {
            Some(n) => ticks.take(n).map(PyTick::from).collect(),
            None => ticks.map(PyTick::from).collect(),
        }
    }

    fn __len__(&self) -> usize {
        self.inner.tick_count() as usize
    }

    fn __repr__(&self) -> String {
        format!(
            "Program(frequency={}, stages={}, ticks={})",
            self.inner.settings().frequency,
            self.inner.stages().len(),
            self.inner.tick_count()
        )
    }
}

// ============================================================================
// Codec Helpers
// ============================================================================

/// Build a setpoint frame.
///
/// Args:
///     values: One setpoint per channel (4 or 12 values).
///     mode: "voltage" or "resistance".
///     groups: Active channel groups (1-3). Default: all groups.
#[pyfunction]
#[pyo3(signature = (values, mode="voltage", groups=None, converter=DEFAULT_RESISTANCE_CONVERTER))]
fn encode_setpoint<'py>(
    py: Python<'py>,
    values: Vec<f64>,
    mode: &str,
    groups: Option<Vec<u8>>,
    converter: u16,
) -> PyResult<Bound<'py, PyBytes>> {
    let codec = codec(values.len(), converter)?;
    let groups = match groups {
        Some(numbers) => ChannelGroups::from_numbers(numbers).map_err(device_err)?,
        None => ChannelGroups::all(codec.channels()),
    };
    let frame = codec
        .encode_setpoint(&values, parse_mode(mode)?, groups)
        .map_err(device_err)?;
    Ok(PyBytes::new(py, &frame))
}

/// Decode a response frame into `(voltages, resistances)`.
#[pyfunction]
#[pyo3(signature = (data, channels=4, converter=DEFAULT_RESISTANCE_CONVERTER))]
fn decode_response(data: &[u8], channels: usize, converter: u16) -> PyResult<(Vec<f64>, Vec<f64>)> {
    let response = codec(channels, converter)?.decode_response(data).map_err(device_err)?;
    Ok((response.voltages, response.resistances))
}

/// Build a range command from one range (1-3) per channel.
#[pyfunction]
fn encode_range_command<'py>(py: Python<'py>, ranges: Vec<u8>) -> PyResult<Bound<'py, PyBytes>> {
    let ranges = ranges
        .iter()
        .map(|&r| Range::from_u8(r).ok_or_else(|| PyValueError::new_err(format!("invalid range {r}"))))
        .collect::<PyResult<Vec<_>>>()?;
    let frame = codec(ranges.len(), DEFAULT_RESISTANCE_CONVERTER)?
        .encode_range_command(&ranges)
        .map_err(device_err)?;
    Ok(PyBytes::new(py, &frame))
}

/// Install the stderr logger. Level comes from `MULTISENSOR_LOG`/`RUST_LOG`,
/// raised by `verbosity` (1 = debug, 2+ = trace). Later calls are no-ops.
#[pyfunction]
#[pyo3(signature = (verbosity=0))]
fn init_logging(verbosity: u8) {
    crate::logging::init_logging(verbosity);
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyProgram>()?;
    m.add_class::<PyTick>()?;
    m.add_function(wrap_pyfunction!(encode_setpoint, m)?)?;
    m.add_function(wrap_pyfunction!(decode_response, m)?)?;
    m.add_function(wrap_pyfunction!(encode_range_command, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("DEFAULT_RESISTANCE_CONVERTER", DEFAULT_RESISTANCE_CONVERTER)?;
    m.add("TEMPERATURE_SLOTS", crate::program::TEMPERATURE_SLOTS)?;

    Ok(())
}
