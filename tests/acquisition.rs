use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use multisensor::acquisition::{read_log_file, BinaryLogWriter, GasStateSink, QueueRunner};
use multisensor::calibration::{CalibrationSource, LoadResistorCalibration};
use multisensor::device::{Emulator, EmulatorHandle};
use multisensor::{
    AcquisitionError, AcquisitionLoop, AutoRangeController, CalibrationFile, ChannelCount, Converters, DeviceChannel,
    DeviceSettings, FrameCodec, LoopEvent, LoopState, ProgramGenerator, Range, RangeMode, SetpointMode, Thresholds,
};

fn emulated(responder: Option<multisensor::device::emulator::Responder>) -> (DeviceChannel, EmulatorHandle) {
    let codec = FrameCodec::new(ChannelCount::Four, 100).unwrap();
    let emulator = match responder {
        Some(r) => Emulator::with_responder(codec, r),
        None => Emulator::new(codec),
    };
    let handle = emulator.handle();
    let device = DeviceChannel::from_transport(emulator, ChannelCount::Four, 100, Duration::from_millis(20)).unwrap();
    (device, handle)
}

fn passthrough() -> Converters {
    Converters::passthrough(ChannelCount::Four, SetpointMode::Voltage)
}

fn program(yaml: &str) -> ProgramGenerator {
    ProgramGenerator::from_yaml_str(yaml).unwrap()
}

const SHORT: &str = "settings: {frequency: 100}\nprogram: [{type: simple, time: 0.2, temperature: 1, gas_state: 0}]";

#[test]
fn publishes_every_tick_in_program_order() {
    let (device, handle) = emulated(None);
    let mut acquisition = AcquisitionLoop::new(device, &program(SHORT), passthrough(), RangeMode::Disabled).unwrap();
    let ticks = acquisition.subscribe();
    acquisition.start().unwrap();
    let summary = acquisition.join().unwrap();

    assert_eq!(summary.ticks, 20);
    assert!(!summary.interrupted);
    assert_eq!(acquisition.state(), LoopState::Stopped);

    let ticks: Vec<_> = ticks.iter().collect();
    assert_eq!(ticks.len(), 20);
    for (i, tick) in ticks.iter().enumerate() {
        assert!((tick.elapsed - i as f64 * 0.01).abs() < 1e-9);
        assert_eq!(tick.stage_id, 0);
        assert_eq!(tick.temperatures, vec![1.0; 4]);
        assert_eq!(tick.ranges, vec![Range::R1; 4]);
        // Default emulator model: u = 0.5 + 0.4 * setpoint.
        assert!(tick.voltages.iter().all(|u| (u - 0.9).abs() < 1e-3));
    }

    let requests = handle.requests();
    assert_eq!(requests.len(), 21);
    assert!(requests.last().unwrap().values.iter().all(|&v| v == 0.0));
}

#[test]
fn saturated_channels_escalate_range_twice() {
    let (device, handle) = emulated(Some(Box::new(|_req| (vec![4.7; 4], vec![20.0; 4]))));
    let mode = RangeMode::Auto(AutoRangeController::default());
    let mut acquisition = AcquisitionLoop::new(device, &program(SHORT), passthrough(), mode).unwrap();
    let ticks = acquisition.subscribe();
    acquisition.start().unwrap();
    acquisition.join().unwrap();

    assert_eq!(handle.range_history(), vec![vec![Range::R2; 4], vec![Range::R3; 4]]);
    let ranges: Vec<Range> = ticks.iter().map(|t| t.ranges[0]).collect();
    assert_eq!(&ranges[..3], &[Range::R1, Range::R2, Range::R3]);
    assert!(ranges[3..].iter().all(|&r| r == Range::R3));
}

#[test]
fn fixed_ranges_are_sent_once() {
    let (device, handle) = emulated(None);
    let mode = RangeMode::fixed(vec![Range::R3, Range::R2, Range::R1, Range::R3]);
    let mut acquisition = AcquisitionLoop::new(device, &program(SHORT), passthrough(), mode).unwrap();
    acquisition.start().unwrap();
    acquisition.join().unwrap();
    assert_eq!(handle.range_history(), vec![vec![Range::R3, Range::R2, Range::R1, Range::R3]]);
}

#[test]
fn persistent_framing_errors_fault_the_run() {
    let (device, handle) = emulated(None);
    handle.corrupt_next(100);
    let (events_tx, events) = mpsc::channel();
    let mut acquisition = AcquisitionLoop::new(device, &program(SHORT), passthrough(), RangeMode::Disabled)
        .unwrap()
        .with_max_attempts(20)
        .with_monitor(move |event| {
            let _ = events_tx.send(event.clone());
        });
    let ticks = acquisition.subscribe();
    acquisition.start().unwrap();

    let err = acquisition.join().unwrap_err();
    assert!(matches!(err, AcquisitionError::Faulted { attempts: 20, .. }));
    assert_eq!(acquisition.state(), LoopState::Faulted);
    assert_eq!(ticks.iter().count(), 0);
    // 20 attempts, then the best-effort safe zero.
    assert_eq!(handle.requests().len(), 21);

    let events: Vec<LoopEvent> = events.iter().collect();
    let retries = events.iter().filter(|e| matches!(e, LoopEvent::FrameRetried { .. })).count();
    assert_eq!(retries, 19);
    assert!(matches!(events.last(), Some(LoopEvent::Faulted { .. })));
}

#[test]
fn transient_errors_are_retried_without_losing_ticks() {
    let (device, handle) = emulated(None);
    handle.corrupt_next(3);
    let mut acquisition = AcquisitionLoop::new(device, &program(SHORT), passthrough(), RangeMode::Disabled).unwrap();
    let ticks = acquisition.subscribe();
    acquisition.start().unwrap();
    assert_eq!(acquisition.join().unwrap().ticks, 20);
    assert_eq!(ticks.iter().count(), 20);
}

#[test]
fn stop_sends_safe_zero_and_ends_early() {
    let (device, handle) = emulated(None);
    let long = program("settings: {frequency: 10}\nprogram: [{type: simple, time: 100, temperature: 2, gas_state: 0}]");
    let mut acquisition = AcquisitionLoop::new(device, &long, passthrough(), RangeMode::Disabled).unwrap();
    let ticks = acquisition.subscribe();
    acquisition.start().unwrap();
    assert!(matches!(acquisition.start(), Err(AcquisitionError::AlreadyStarted)));
    thread::sleep(Duration::from_millis(250));

    let summary = acquisition.stop().unwrap();
    assert!(summary.interrupted);
    assert!(summary.ticks >= 1 && summary.ticks < 1000);
    assert_eq!(ticks.iter().count() as u64, summary.ticks);
    assert_eq!(acquisition.state(), LoopState::Stopped);

    let requests = handle.requests();
    assert!(requests.last().unwrap().values.iter().all(|&v| v == 0.0));
    assert!(requests[..requests.len() - 1].iter().all(|r| (r.values[0] - 2.0).abs() < 1e-3));
}

#[derive(Clone, Default)]
struct RecordingGas {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl GasStateSink for RecordingGas {
    fn send_state(&mut self, state: u8) -> io::Result<()> {
        self.seen.lock().unwrap().push(state);
        Err(io::Error::new(io::ErrorKind::Other, "controller offline"))
    }
}

#[test]
fn gas_sink_failures_do_not_stop_acquisition() {
    let (device, _handle) = emulated(None);
    let two_stages = program(
        "settings: {frequency: 100}\nprogram:\n  \
         - {type: simple, time: 0.05, temperature: 1, gas_state: 0}\n  \
         - {type: simple, time: 0.05, temperature: 1, gas_state: 3}\n",
    );
    let gas = RecordingGas::default();
    let mut acquisition = AcquisitionLoop::new(device, &two_stages, passthrough(), RangeMode::Disabled)
        .unwrap()
        .with_gas_sink(gas.clone());
    acquisition.start().unwrap();
    assert_eq!(acquisition.join().unwrap().ticks, 10);
    let seen = gas.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![0, 0, 0, 0, 0, 3, 3, 3, 3, 3]);
}

#[test]
fn binary_log_records_every_published_tick() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("run.dat");
    let (device, _handle) = emulated(None);
    let two_stages = program(
        "settings: {frequency: 100}\nprogram:\n  \
         - {type: simple, time: 0.05, temperature: 1, gas_state: 2}\n  \
         - {type: stepwise, time: 0.03, temperature_start: 1, temperature_stop: 3, temperature_step: 1, gas_states: [4]}\n",
    );
    let mut acquisition = AcquisitionLoop::new(device, &two_stages, passthrough(), RangeMode::Disabled).unwrap();
    let log = QueueRunner::spawn("log", acquisition.subscribe(), BinaryLogWriter::create(&path).unwrap()).unwrap();
    acquisition.start().unwrap();
    let summary = acquisition.join().unwrap();
    let writer = log.join().unwrap();
    assert_eq!(writer.records(), summary.ticks);

    let records = read_log_file(&path).unwrap();
    assert_eq!(records.len(), 5 + 2 * 3);
    assert_eq!(records[0].voltages.len(), 4);
    assert_eq!(records[0].gas_state, 2);
    assert_eq!(records[0].kind, 0);
    let stage_ids: Vec<u32> = records.iter().map(|r| r.stage_id).collect();
    assert_eq!(stage_ids, vec![0, 0, 0, 0, 0, 1, 1, 1, 2, 2, 2]);
    assert_eq!(records[5].temperatures, vec![1.0f32; 4]);
    assert_eq!(records[8].temperatures, vec![2.0f32; 4]);
    assert!(records.iter().all(|r| r.ranges == vec![1u8; 4]));
}

const CALIBRATION: &str = "channels:
- temperature_to_voltage: {x: [0, 500], y: [0, 5]}
  load_resistors:
    - {range: 1, rs_u1: 2.5, rs_u2: 2.0}
    - {range: 2, rs_u1: 2.5, rs_u2: 2.0}
    - {range: 3, rs_u1: 2.5, rs_u2: 2.0}
- temperature_to_voltage: {x: [0, 500], y: [0, 5]}
  load_resistors:
    - {range: 1, rs_u1: 2.5, rs_u2: 2.0}
- temperature_to_voltage: {x: [0, 500], y: [0, 5]}
- working: false
";

#[test]
fn calibrated_session_converts_and_ranges_with_file_thresholds() {
    let cal = CalibrationFile::from_yaml_str(CALIBRATION).unwrap();
    let settings = DeviceSettings::from_yaml_str("multirange: true\n").unwrap();
    let mode = settings.range_mode(Some(&cal as &dyn CalibrationSource)).unwrap();
    let RangeMode::Auto(controller) = &mode else {
        panic!("expected auto ranging, got {mode:?}")
    };
    let Thresholds::Calibrated { top, .. } = controller.thresholds() else {
        panic!("expected calibrated thresholds")
    };
    // Adjacent ranges of this bridge intersect at 2.5 V.
    assert!((top[0][0] - 2.6).abs() < 1e-9);
    // 3 V would never leave range 1 under the fixed defaults.
    assert!(Thresholds::default().limits(Range::R1, 0).0 > 3.0);

    let converters = Converters::from_source(&cal, ChannelCount::Four, SetpointMode::Voltage, settings.multirange);
    let (device, handle) = emulated(Some(Box::new(|_req| (vec![3.0, 1.0, 1.0, 1.0], vec![20.0; 4]))));
    let warm = program("settings: {frequency: 100}\nprogram: [{type: simple, time: 0.1, temperature: 250, gas_state: 0}]");
    let mut acquisition = AcquisitionLoop::new(device, &warm, converters, mode).unwrap();
    let ticks = acquisition.subscribe();
    acquisition.start().unwrap();
    assert_eq!(acquisition.join().unwrap().ticks, 10);

    assert_eq!(
        handle.range_history(),
        vec![
            vec![Range::R2, Range::R1, Range::R1, Range::R1],
            vec![Range::R3, Range::R1, Range::R1, Range::R1],
        ]
    );
    for request in &handle.requests()[..10] {
        assert!((request.values[0] - 2.5).abs() < 1e-3);
        assert!((request.values[2] - 2.5).abs() < 1e-3);
        assert_eq!(request.values[3], 0.0);
    }

    let ticks: Vec<_> = ticks.iter().collect();
    assert_eq!(ticks.len(), 10);
    let ch0: Vec<Range> = ticks.iter().map(|t| t.ranges[0]).collect();
    assert_eq!(&ch0[..3], &[Range::R1, Range::R2, Range::R3]);
    for tick in &ticks {
        assert_eq!(tick.setpoints[3], 0.0);
        let bridge = LoadResistorCalibration::for_range(2.5, 2.0, tick.ranges[0]);
        let expected = bridge.voltage_to_resistance(tick.voltages[0]);
        assert!((tick.converted[0] - expected).abs() <= expected.abs() * 1e-9);
        assert!((tick.converted[0] - tick.voltages[0]).abs() > 1.0);
        // Channel 3 has no bridge calibration and reports its voltage.
        assert_eq!(tick.converted[3], tick.voltages[3]);
    }
}
