//! Declarative experiment programs.
//!
//! A program document has global `settings` (tick frequency) and an ordered
//! list of stages:
//!
//! ```yaml
//! settings:
//!   frequency: 10
//! program:
//!   - type: simple
//!     time: 60
//!     temperature: [300, 320, 340, 360]
//!     gas_state: 0
//!   - type: stepwise
//!     time: 30
//!     temperature_start: 200
//!     temperature_stop: 450
//!     temperature_step: 50
//!     cycles: 2
//!     gas_states: [0, 1]
//!   - type: cyclic
//!     temperatures: {time: [0, 10, 20], temperature: [100, 450, 100]}
//!     repeat: 6
//!     gas_states:
//!       - {state: 0, number: 1}
//!       - state: {time: [5, 20], substates: [0, "n * 2"]}
//!         number: 1
//!         template: [n, 1, 4]
//! ```
//!
//! [`ProgramGenerator::parse_program_to_queue`] expands it into a lazy,
//! deterministic stream of [`ProgramTick`]s.

pub mod gas;
mod generator;
pub mod stage;

pub use generator::{ProgramGenerator, ProgramTick, ProgramTicks};
pub use stage::{
    ProgramSettings, Stage, StageKind, TemperatureSpec, MAX_PROGRAM_BLOCKS, TEMPERATURE_SLOTS,
};
