use std::path::Path;
use std::sync::Arc;

use log::debug;

use super::stage::{
    compile_stage, ProgramDocument, ProgramSettings, Stage, StageKind, MAX_PROGRAM_BLOCKS,
    TEMPERATURE_SLOTS,
};
use crate::errors::ProgramError;

/// One element of the expanded program.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramTick {
    /// Seconds since the program start (`index * step`).
    pub elapsed: f64,
    pub temperatures: [f64; TEMPERATURE_SLOTS],
    pub gas_state: u8,
    pub stage_id: u32,
    pub kind: StageKind,
}

#[derive(Debug)]
struct Program {
    settings: ProgramSettings,
    stages: Vec<Stage>,
}

/// Validated experiment program.
///
/// Loading compiles every stage, so a malformed program is rejected before
/// any tick is produced.
///
/// # Example
/// ```
/// use multisensor::program::ProgramGenerator;
///
/// let generator = ProgramGenerator::from_yaml_str(
///     "settings: {frequency: 10}\nprogram: [{type: simple, time: 2, temperature: 25, gas_state: 0}]",
/// )
/// .unwrap();
/// assert_eq!(generator.parse_program_to_queue().count(), 20);
/// ```
#[derive(Debug, Clone)]
pub struct ProgramGenerator {
    program: Arc<Program>,
}

impl ProgramGenerator {
    pub fn from_yaml_str(text: &str) -> Result<Self, ProgramError> {
        let document: ProgramDocument = serde_yaml::from_str(text)?;
        Self::from_document(document)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProgramError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let generator = Self::from_yaml_str(&text)?;
        debug!(
            "Loaded program {} ({} stages)",
            path.display(),
            generator.program.stages.len()
        );
        Ok(generator)
    }

    fn from_document(document: ProgramDocument) -> Result<Self, ProgramError> {
        let frequency = document.settings.frequency;
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(ProgramError::InvalidSettings(format!(
                "frequency must be a positive number, got {frequency}"
            )));
        }
        let step = document.settings.step();
        let stages = document
            .program
            .into_iter()
            .enumerate()
            .map(|(index, value)| compile_stage(index, value, step))
            .collect::<Result<Vec<_>, _>>()?;
        check_totals(&stages)?;
        Ok(Self {
            program: Arc::new(Program {
                settings: document.settings,
                stages,
            }),
        })
    }

    pub fn settings(&self) -> &ProgramSettings {
        &self.program.settings
    }

    /// Seconds between ticks.
    pub fn step(&self) -> f64 {
        self.program.settings.step()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.program.stages
    }

    /// Start a fresh expansion; stage ids restart at 0.
    pub fn parse_program_to_queue(&self) -> ProgramTicks {
        ProgramTicks {
            program: Arc::clone(&self.program),
            stage: 0,
            block: 0,
            tick: 0,
            index: 0,
            remaining: self.tick_count(),
            next_stage_id: 0,
            current_id: None,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.program
            .stages
            .iter()
            .fold(0u64, |total, stage| total.saturating_add(stage.tick_count()))
    }

    /// Duration of the whole program in seconds.
    pub fn calculate_full_time(&self) -> f64 {
        self.tick_count() as f64 * self.step()
    }

    /// Temperature extent over every emitted tick, `None` for an empty program.
    pub fn calculate_min_and_max_temperatures(&self) -> Option<(f64, f64)> {
        self.program
            .stages
            .iter()
            .filter_map(Stage::temperature_extent)
            .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)))
    }
}

/// Reject programs whose stage ids or total tick count would overflow.
fn check_totals(stages: &[Stage]) -> Result<(), ProgramError> {
    let mut blocks = 0u64;
    let mut ticks = 0u64;
    for (index, stage) in stages.iter().enumerate() {
        blocks = blocks
            .checked_add(stage.blocks())
            .filter(|&b| b <= MAX_PROGRAM_BLOCKS)
            .ok_or_else(|| {
                ProgramError::stage(
                    index,
                    format!("program allocates more than {MAX_PROGRAM_BLOCKS} stage ids"),
                )
            })?;
        ticks = ticks.checked_add(stage.tick_count()).ok_or_else(|| {
            ProgramError::stage(index, "program expands to more ticks than fit in 64 bits")
        })?;
    }
    Ok(())
}

/// Lazy tick stream of one expansion.
#[derive(Debug, Clone)]
pub struct ProgramTicks {
    program: Arc<Program>,
    stage: usize,
    block: u64,
    tick: u64,
    index: u64,
    remaining: u64,
    next_stage_id: u64,
    current_id: Option<u32>,
}

impl ProgramTicks {
    pub fn step(&self) -> f64 {
        self.program.settings.step()
    }

    fn next_block(&mut self) {
        self.block += 1;
        self.tick = 0;
        self.current_id = None;
    }
}

impl Iterator for ProgramTicks {
    type Item = ProgramTick;

    fn next(&mut self) -> Option<ProgramTick> {
        let step = self.step();
        loop {
            let program = Arc::clone(&self.program);
            let stage = program.stages.get(self.stage)?;
            if self.block >= stage.blocks() {
                self.stage += 1;
                self.block = 0;
                self.tick = 0;
                self.current_id = None;
                continue;
            }
            // Every block takes an id, even one that emits no ticks.
            let stage_id = match self.current_id {
                Some(id) => id,
                None => {
                    let id = u32::try_from(self.next_stage_id).ok()?;
                    self.next_stage_id += 1;
                    self.current_id = Some(id);
                    id
                }
            };
            if self.tick >= stage.ticks_per_block() {
                self.next_block();
                continue;
            }

            let local = self.tick as f64 * step;
            let (temperatures, gas_state) = match stage {
                Stage::Simple(s) => (s.temperatures, s.gas_state),
                Stage::Stepwise(s) => {
                    let (t, gas) = s.block(self.block);
                    ([t; TEMPERATURE_SLOTS], gas)
                }
                Stage::Cyclic(c) => {
                    let gas = c
                        .gas_cycle
                        .for_repetition(self.block)
                        .map_or(0, |profile| profile.at(local));
                    ([c.table.eval(local); TEMPERATURE_SLOTS], gas)
                }
            };
            let tick = ProgramTick {
                elapsed: self.index as f64 * step,
                temperatures,
                gas_state,
                stage_id,
                kind: stage.kind(),
            };
            self.tick += 1;
            self.index += 1;
            self.remaining = self.remaining.saturating_sub(1);
            return Some(tick);
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}
