use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, error, info, warn};

use super::fanout::FanOut;
use super::gas_state::{GasStateSink, NullGasStateSink};
use super::tick::Tick;
use crate::calibration::Converters;
use crate::codec::ChannelGroups;
use crate::config::DEFAULT_MAX_ATTEMPTS;
use crate::device::DeviceChannel;
use crate::errors::{AcquisitionError, DeviceError, Result};
use crate::program::{ProgramGenerator, ProgramTick, ProgramTicks};
use crate::ranging::{ChannelSet, Range, RangeMode};

// ============================================================================
// Loop State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
    Faulted = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Running,
            2 => LoopState::Stopped,
            3 => LoopState::Faulted,
            _ => LoopState::Idle,
        }
    }
}

/// Notifications delivered to the monitor callback from the worker thread.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Started { ticks: u64, step: f64 },
    FrameRetried { attempt: u32, error: String },
    RangeChanged { elapsed: f64, ranges: Vec<Range> },
    Faulted { message: String },
    Finished { ticks: u64, interrupted: bool },
}

pub type Monitor = Box<dyn FnMut(&LoopEvent) + Send>;

/// Outcome of a run that ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// Ticks published to consumers.
    pub ticks: u64,
    /// True when `stop()` ended the run before the program did.
    pub interrupted: bool,
    pub duration: Duration,
}

// ============================================================================
// Acquisition Loop
// ============================================================================

/// Drives one program against one device on a dedicated thread.
///
/// ```ignore
/// let mut acquisition = AcquisitionLoop::new(device, &program, converters, RangeMode::Disabled)?;
/// let log = QueueRunner::spawn("log", acquisition.subscribe(), BinaryLogWriter::create(path)?)?;
/// acquisition.start()?;
/// let summary = acquisition.join()?;
/// log.join()?;
/// ```
pub struct AcquisitionLoop {
    worker: Option<Worker>,
    handle: Option<JoinHandle<std::result::Result<RunSummary, AcquisitionError>>>,
    fanout: Arc<FanOut<Arc<Tick>>>,
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl std::fmt::Debug for AcquisitionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionLoop")
            .field("state", &self.state())
            .field("subscribers", &self.fanout.subscriber_count())
            .finish()
    }
}

impl AcquisitionLoop {
    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    pub fn new(
        device: DeviceChannel,
        program: &ProgramGenerator,
        converters: Converters,
        range_mode: RangeMode,
    ) -> std::result::Result<Self, AcquisitionError> {
        let channels = device.channel_count();
        if converters.channel_count() != channels.get() {
            return Err(AcquisitionError::ChannelMismatch {
                what: "converters",
                expected: channels.get(),
                actual: converters.channel_count(),
            });
        }

        let fanout = Arc::new(FanOut::new());
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(LoopState::Idle as u8));
        let worker = Worker {
            device,
            ticks: program.parse_program_to_queue(),
            converters,
            range_mode,
            channels: ChannelSet::new(channels),
            gas: Box::new(NullGasStateSink),
            groups: ChannelGroups::all(channels),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            monitor: None,
            fanout: Arc::clone(&fanout),
            stop: Arc::clone(&stop),
            state: Arc::clone(&state),
        };
        Ok(Self {
            worker: Some(worker),
            handle: None,
            fanout,
            stop,
            state,
        })
    }

    /// Channel groups addressed by every frame, including the final safe zero.
    pub fn with_groups(mut self, groups: ChannelGroups) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.groups = groups;
        }
        self
    }

    /// Attempts per frame before a transient error faults the run.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.max_attempts = attempts.max(1);
        }
        self
    }

    pub fn with_gas_sink(mut self, sink: impl GasStateSink + 'static) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.gas = Box::new(sink);
        }
        self
    }

    pub fn with_monitor(mut self, monitor: impl FnMut(&LoopEvent) + Send + 'static) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.monitor = Some(Box::new(monitor));
        }
        self
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// New consumer queue. Subscribe before `start()` to see every tick.
    pub fn subscribe(&self) -> Receiver<Arc<Tick>> {
        self.fanout.subscribe()
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn start(&mut self) -> std::result::Result<(), AcquisitionError> {
        let worker = self.worker.take().ok_or(AcquisitionError::AlreadyStarted)?;
        self.state.store(LoopState::Running as u8, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.store(LoopState::Faulted as u8, Ordering::SeqCst);
                self.fanout.close();
                Err(DeviceError::Io(e).into())
            }
        }
    }

    /// Ask the loop to halt at the next tick boundary without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Halt and wait until the safe-zero frame has been sent and the device closed.
    pub fn stop(&mut self) -> std::result::Result<RunSummary, AcquisitionError> {
        self.request_stop();
        self.join()
    }

    /// Wait for the run to end on its own (or after `request_stop`).
    pub fn join(&mut self) -> std::result::Result<RunSummary, AcquisitionError> {
        let handle = self.handle.take().ok_or(AcquisitionError::NotStarted)?;
        handle.join().unwrap_or_else(|_| {
            self.state.store(LoopState::Faulted as u8, Ordering::SeqCst);
            self.fanout.close();
            Err(AcquisitionError::WorkerPanicked)
        })
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_stop();
            if let Err(e) = self.join() {
                debug!("Acquisition ended with {e} while dropping");
            }
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    device: DeviceChannel,
    ticks: ProgramTicks,
    converters: Converters,
    range_mode: RangeMode,
    channels: ChannelSet,
    gas: Box<dyn GasStateSink>,
    groups: ChannelGroups,
    max_attempts: u32,
    monitor: Option<Monitor>,
    fanout: Arc<FanOut<Arc<Tick>>>,
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl Worker {
    fn emit(&mut self, event: LoopEvent) {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor(&event);
        }
    }

    fn run(mut self) -> std::result::Result<RunSummary, AcquisitionError> {
        let begun = Instant::now();
        let total = self.ticks.size_hint().0 as u64;
        let step = self.ticks.step();
        info!("Acquisition started: {total} ticks every {step:.3}s");
        self.emit(LoopEvent::Started { ticks: total, step });

        let mut published = 0u64;
        let outcome = self.run_ticks(begun, &mut published);
        let result = match outcome {
            Ok(interrupted) => {
                self.release(false);
                self.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
                info!(
                    "Acquisition {} after {published} ticks",
                    if interrupted { "stopped" } else { "finished" }
                );
                self.emit(LoopEvent::Finished {
                    ticks: published,
                    interrupted,
                });
                Ok(RunSummary {
                    ticks: published,
                    interrupted,
                    duration: begun.elapsed(),
                })
            }
            Err(e) => {
                error!("Acquisition faulted after {published} ticks: {e}");
                self.release(true);
                self.state.store(LoopState::Faulted as u8, Ordering::SeqCst);
                self.emit(LoopEvent::Faulted { message: e.to_string() });
                Err(e)
            }
        };
        self.fanout.close();
        result
    }

    /// Returns `Ok(true)` when a stop request ended the run early.
    fn run_ticks(&mut self, begun: Instant, published: &mut u64) -> std::result::Result<bool, AcquisitionError> {
        let step = self.ticks.step();
        while let Some(tick) = self.ticks.next() {
            if !self.pace(begun, tick.elapsed, step) {
                return Ok(true);
            }
            self.execute(&tick)?;
            *published += 1;
        }
        Ok(false)
    }

    /// Sleep in `step / 100` slices until the tick is due. False if stopped.
    fn pace(&self, begun: Instant, due: f64, step: f64) -> bool {
        let slice = Duration::from_secs_f64((step / 100.0).max(1e-4));
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            let remaining = due - begun.elapsed().as_secs_f64();
            if remaining <= 0.0 {
                return true;
            }
            thread::sleep(slice.min(Duration::from_secs_f64(remaining)));
        }
    }

    fn execute(&mut self, program_tick: &ProgramTick) -> std::result::Result<(), AcquisitionError> {
        let n = self.channels.len();
        let temperatures = program_tick.temperatures[..n].to_vec();
        let setpoints = self.converters.setpoints(&temperatures);
        let ranges = self.channels.ranges();
        let mode = self.converters.mode();
        let groups = self.groups;

        let response = with_retry(&mut self.device, self.max_attempts, &mut self.monitor, |device| {
            device.request(&setpoints, mode, groups)
        })?;
        self.channels.record(&response.voltages, &response.resistances);
        let converted = self.converters.resistances(&response.voltages, &ranges);

        if let Err(e) = self.gas.send_state(program_tick.gas_state) {
            warn!("Gas state {} not delivered: {e}", program_tick.gas_state);
        }

        let voltages = response.voltages;
        self.fanout.publish(Arc::new(Tick {
            elapsed: program_tick.elapsed,
            timestamp: Local::now(),
            voltages: voltages.clone(),
            resistances: response.resistances,
            converted,
            temperatures,
            setpoints,
            gas_state: program_tick.gas_state,
            stage_id: program_tick.stage_id,
            kind: program_tick.kind,
            ranges,
        }));

        if let Some(next) = self.range_mode.apply(&mut self.channels, &voltages) {
            with_retry(&mut self.device, self.max_attempts, &mut self.monitor, |device| {
                device.set_range(&next)
            })?;
            self.emit(LoopEvent::RangeChanged {
                elapsed: program_tick.elapsed,
                ranges: next,
            });
        }
        Ok(())
    }

    /// Zero every heater and close the port. After a fault this is best effort.
    fn release(&mut self, faulted: bool) {
        if let Err(e) = self.device.send_safe_zero(self.groups) {
            if faulted {
                debug!("Safe zero after fault failed: {e}");
            } else {
                warn!("Safe zero failed: {e}");
            }
        }
        if let Err(e) = self.device.close() {
            warn!("Closing device failed: {e}");
        }
    }
}

/// Run `op`, resynchronising and retrying transient frame errors up to
/// `max_attempts` times in total.
fn with_retry<T>(
    device: &mut DeviceChannel,
    max_attempts: u32,
    monitor: &mut Option<Monitor>,
    mut op: impl FnMut(&mut DeviceChannel) -> Result<T>,
) -> std::result::Result<T, AcquisitionError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(device) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!("Attempt {attempt}/{max_attempts} failed: {e}");
                if let Some(monitor) = monitor.as_mut() {
                    monitor(&LoopEvent::FrameRetried {
                        attempt,
                        error: e.to_string(),
                    });
                }
                if let Err(e) = device.resync() {
                    debug!("Resync failed: {e}");
                }
            }
            Err(e) if e.is_transient() => {
                return Err(AcquisitionError::Faulted {
                    attempts: attempt,
                    source: e,
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
}
