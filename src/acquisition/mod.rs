//! Real-time acquisition: pacing, device I/O, range control and fan-out.
//!
//! One worker thread owns the [`DeviceChannel`](crate::device::DeviceChannel)
//! and publishes an `Arc<Tick>` per program tick. Consumers subscribe to the
//! fan-out and usually run behind a [`QueueRunner`].

mod fanout;
pub mod gas_state;
mod runner;
pub mod sinks;
mod tick;

pub use fanout::FanOut;
pub use gas_state::{GasStateSink, NullGasStateSink, TcpGasStateSink};
pub use runner::{AcquisitionLoop, LoopEvent, LoopState, Monitor, RunSummary};
pub use sinks::{read_log, read_log_file, BinaryLogWriter, LiveValues, LogRecord, PlotBuffer, PlotRow, QueueRunner, TickSink};
pub use tick::Tick;
