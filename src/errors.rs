use std::io;
use thiserror::Error;

/// Errors raised while talking to the instrument.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot open serial port {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("framing error: {0}")]
    Framing(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("setpoint out of domain: {0}")]
    Domain(String),
    #[error("unsupported channel count {0} (expected 4 or 12)")]
    ChannelCount(usize),
}

impl DeviceError {
    /// Frame-level failures that the acquisition loop may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Framing(_) | DeviceError::Protocol(_))
    }
}

/// Errors raised while parsing or validating an experiment program.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("stage {index}: unknown stage type {kind:?}")]
    UnknownStageType { index: usize, kind: String },
    #[error("stage {index}: {reason}")]
    InvalidStage { index: usize, reason: String },
    #[error("invalid program settings: {0}")]
    InvalidSettings(String),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProgramError {
    pub(crate) fn stage(index: usize, reason: impl Into<String>) -> Self {
        ProgramError::InvalidStage {
            index,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the acquisition loop.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("acquisition faulted after {attempts} attempts: {source}")]
    Faulted {
        attempts: u32,
        #[source]
        source: DeviceError,
    },
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("acquisition already started")]
    AlreadyStarted,
    #[error("acquisition not started")]
    NotStarted,
    #[error("acquisition worker panicked")]
    WorkerPanicked,
    #[error("consumer {name} failed: {source}")]
    Sink {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{what} expects {expected} channels, got {actual}")]
    ChannelMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised while loading settings or calibration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised while building an interpolation table.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TableError {
    #[error("table is empty")]
    Empty,
    #[error("table has {xs} x values but {ys} y values")]
    LengthMismatch { xs: usize, ys: usize },
    #[error("x values must be strictly increasing (index {0})")]
    NotIncreasing(usize),
    #[error("table contains a non-finite value at index {0}")]
    NonFinite(usize),
}
