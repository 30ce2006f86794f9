//! Tick consumers and the threads that feed them.
//!
//! Every consumer owns one receiver from the acquisition fan-out. A
//! [`QueueRunner`] drains that receiver on its own thread so formatting
//! and disk writes never delay the control loop.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, error};

use super::tick::Tick;
use crate::errors::AcquisitionError;

pub const DEFAULT_PLOT_CAPACITY: usize = 400;

// ============================================================================
// Consumer Trait
// ============================================================================

/// Destination for published ticks.
pub trait TickSink: Send {
    fn consume(&mut self, tick: &Tick) -> io::Result<()>;

    /// Called once after the last tick.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Queue Runner
// ============================================================================

/// Worker thread draining one fan-out receiver into a [`TickSink`].
///
/// The thread ends when the acquisition loop closes the fan-out and the
/// queue is empty. After a sink error the remaining ticks are still drained
/// but no longer forwarded.
#[derive(Debug)]
pub struct QueueRunner<S> {
    name: String,
    handle: JoinHandle<(S, Option<io::Error>)>,
}

impl<S: TickSink + 'static> QueueRunner<S> {
    pub fn spawn(name: &str, queue: Receiver<Arc<Tick>>, mut sink: S) -> io::Result<Self> {
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(format!("sink-{name}")).spawn(move || {
            let mut failure: Option<io::Error> = None;
            let mut consumed = 0u64;
            for tick in queue.iter() {
                if failure.is_some() {
                    continue;
                }
                match sink.consume(&tick) {
                    Ok(()) => consumed += 1,
                    Err(e) => {
                        error!("Consumer {thread_name} failed at t = {:.3}s: {e}", tick.elapsed);
                        failure = Some(e);
                    }
                }
            }
            if let Err(e) = sink.finish() {
                error!("Consumer {thread_name} failed to finish: {e}");
                failure.get_or_insert(e);
            }
            debug!("Consumer {thread_name} done after {consumed} ticks");
            (sink, failure)
        })?;
        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the queue to drain and hand the sink back.
    pub fn join(self) -> Result<S, AcquisitionError> {
        let (sink, failure) = self.handle.join().map_err(|_| AcquisitionError::WorkerPanicked)?;
        match failure {
            Some(source) => Err(AcquisitionError::Sink {
                name: self.name,
                source,
            }),
            None => Ok(sink),
        }
    }
}

// ============================================================================
// Binary Log
// ============================================================================

/// Writes the acquisition log: a one-byte channel count, then one
/// little-endian record per tick.
///
/// Record layout for `N` channels: `f32` time, `N` × `f32` voltages,
/// `N` × `f32` heater resistances, `N` × `f32` converted resistances,
/// `N` × `f32` temperatures, `u8` gas state, `u32` stage id, `u16` stage
/// kind, `N` × `u8` ranges.
#[derive(Debug)]
pub struct BinaryLogWriter<W: Write> {
    writer: W,
    channels: Option<usize>,
    records: u64,
}

impl BinaryLogWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        debug!("Writing acquisition log to {}", path.display());
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> BinaryLogWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            channels: None,
            records: 0,
        }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn write_tick(&mut self, tick: &Tick) -> io::Result<()> {
        let n = tick.channel_count();
        let columns = [&tick.resistances, &tick.converted, &tick.temperatures];
        if let Some(bad) = columns.iter().find(|c| c.len() != n) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("tick column has {} values, expected {n}", bad.len()),
            ));
        }
        if tick.ranges.len() != n {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("tick has {} ranges, expected {n}", tick.ranges.len()),
            ));
        }
        match self.channels {
            None => {
                let header = u8::try_from(n).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("{n} channels do not fit the header"))
                })?;
                self.writer.write_all(&[header])?;
                self.channels = Some(n);
            }
            Some(expected) if expected != n => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("log holds {expected} channels, tick has {n}"),
                ));
            }
            Some(_) => {}
        }

        let mut record = Vec::with_capacity(record_len(n));
        record.extend_from_slice(&(tick.elapsed as f32).to_le_bytes());
        for column in [&tick.voltages, &tick.resistances, &tick.converted, &tick.temperatures] {
            for &value in column.iter() {
                record.extend_from_slice(&(value as f32).to_le_bytes());
            }
        }
        record.push(tick.gas_state);
        record.extend_from_slice(&tick.stage_id.to_le_bytes());
        record.extend_from_slice(&tick.kind.code().to_le_bytes());
        record.extend(tick.ranges.iter().map(|r| r.as_u8()));
        self.writer.write_all(&record)?;
        self.records += 1;
        Ok(())
    }
}

impl<W: Write + Send> TickSink for BinaryLogWriter<W> {
    fn consume(&mut self, tick: &Tick) -> io::Result<()> {
        self.write_tick(tick)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

fn record_len(channels: usize) -> usize {
    4 + 16 * channels + 1 + 4 + 2 + channels
}

/// One record of an acquisition log, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub elapsed: f32,
    pub voltages: Vec<f32>,
    pub resistances: Vec<f32>,
    pub converted: Vec<f32>,
    pub temperatures: Vec<f32>,
    pub gas_state: u8,
    pub stage_id: u32,
    pub kind: u16,
    pub ranges: Vec<u8>,
}

/// Parse a complete acquisition log. An empty stream holds no records.
pub fn read_log<R: Read>(mut reader: R) -> io::Result<Vec<LogRecord>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let Some((&header, body)) = bytes.split_first() else {
        return Ok(Vec::new());
    };
    let n = header as usize;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "log header declares zero channels"));
    }
    let len = record_len(n);
    if body.len() % len != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("truncated record: {} trailing bytes", body.len() % len),
        ));
    }

    let f32_at = |chunk: &[u8], at: usize| f32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]]);
    let column = |chunk: &[u8], index: usize| -> Vec<f32> {
        let start = 4 + index * 4 * n;
        (0..n).map(|i| f32_at(chunk, start + 4 * i)).collect()
    };

    Ok(body
        .chunks_exact(len)
        .map(|chunk| {
            let tail = 4 + 16 * n;
            LogRecord {
                elapsed: f32_at(chunk, 0),
                voltages: column(chunk, 0),
                resistances: column(chunk, 1),
                converted: column(chunk, 2),
                temperatures: column(chunk, 3),
                gas_state: chunk[tail],
                stage_id: u32::from_le_bytes([chunk[tail + 1], chunk[tail + 2], chunk[tail + 3], chunk[tail + 4]]),
                kind: u16::from_le_bytes([chunk[tail + 5], chunk[tail + 6]]),
                ranges: chunk[tail + 7..].to_vec(),
            }
        })
        .collect())
}

pub fn read_log_file(path: impl AsRef<Path>) -> io::Result<Vec<LogRecord>> {
    read_log(io::BufReader::new(File::open(path)?))
}

// ============================================================================
// Display Sinks
// ============================================================================

/// Latest published tick, shared with whoever refreshes a display.
#[derive(Debug, Clone, Default)]
pub struct LiveValues {
    latest: Arc<Mutex<Option<Arc<Tick>>>>,
}

impl LiveValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<Tick>> {
        lock(&self.latest).clone()
    }
}

impl TickSink for LiveValues {
    fn consume(&mut self, tick: &Tick) -> io::Result<()> {
        *lock(&self.latest) = Some(Arc::new(tick.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotRow {
    pub elapsed: f64,
    pub converted: Vec<f64>,
    pub resistances: Vec<f64>,
}

/// Bounded history of the most recent ticks for plotting.
#[derive(Debug, Clone)]
pub struct PlotBuffer {
    capacity: usize,
    rows: Arc<Mutex<VecDeque<PlotRow>>>,
}

impl Default for PlotBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PLOT_CAPACITY)
    }
}

impl PlotBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            rows: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest row first.
    pub fn rows(&self) -> Vec<PlotRow> {
        lock(&self.rows).iter().cloned().collect()
    }

    pub fn push(&self, row: PlotRow) {
        let mut rows = lock(&self.rows);
        while rows.len() >= self.capacity {
            rows.pop_front();
        }
        rows.push_back(row);
    }
}

impl TickSink for PlotBuffer {
    fn consume(&mut self, tick: &Tick) -> io::Result<()> {
        self.push(PlotRow {
            elapsed: tick.elapsed,
            converted: tick.converted.clone(),
            resistances: tick.resistances.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::StageKind;
    use crate::ranging::Range;
    use chrono::Local;
    use std::sync::mpsc;

    fn tick(elapsed: f64, n: usize) -> Tick {
        Tick {
            elapsed,
            timestamp: Local::now(),
            voltages: vec![1.25; n],
            resistances: vec![20.0; n],
            converted: vec![1.0e5; n],
            temperatures: vec![300.0; n],
            setpoints: vec![0.5; n],
            gas_state: 7,
            stage_id: 3,
            kind: StageKind::Cyclic,
            ranges: vec![Range::R2; n],
        }
    }

    #[test]
    fn log_header_and_record_layout() {
        let mut writer = BinaryLogWriter::new(Vec::new());
        writer.write_tick(&tick(0.5, 4)).unwrap();
        writer.write_tick(&tick(0.6, 4)).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes[0], 4);
        assert_eq!(bytes.len(), 1 + 2 * record_len(4));
        assert_eq!(&bytes[1..5], &0.5f32.to_le_bytes());

        let records = read_log(bytes.as_slice()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].elapsed, 0.6f32);
        assert_eq!(records[0].gas_state, 7);
        assert_eq!(records[0].stage_id, 3);
        assert_eq!(records[0].kind, StageKind::Cyclic.code());
        assert_eq!(records[0].ranges, vec![2; 4]);
        assert_eq!(records[0].converted, vec![1.0e5f32; 4]);
    }

    #[test]
    fn channel_count_cannot_change_mid_log() {
        let mut writer = BinaryLogWriter::new(Vec::new());
        writer.write_tick(&tick(0.0, 4)).unwrap();
        assert!(writer.write_tick(&tick(0.1, 12)).is_err());
        assert_eq!(writer.records(), 1);
    }

    #[test]
    fn truncated_log_is_rejected() {
        let mut writer = BinaryLogWriter::new(Vec::new());
        writer.write_tick(&tick(0.0, 4)).unwrap();
        let mut bytes = writer.into_inner();
        bytes.pop();
        let err = read_log(bytes.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(read_log(io::empty()).unwrap().is_empty());
    }

    #[test]
    fn plot_buffer_keeps_most_recent_rows() {
        let mut buffer = PlotBuffer::with_capacity(3);
        for i in 0..5 {
            buffer.consume(&tick(i as f64, 4)).unwrap();
        }
        let elapsed: Vec<f64> = buffer.rows().iter().map(|r| r.elapsed).collect();
        assert_eq!(elapsed, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn runner_drains_queue_then_returns_sink() {
        let (tx, rx) = mpsc::channel();
        let live = LiveValues::new();
        let runner = QueueRunner::spawn("live", rx, live.clone()).unwrap();
        for i in 0..10 {
            tx.send(Arc::new(tick(i as f64 * 0.1, 4))).unwrap();
        }
        drop(tx);
        runner.join().unwrap();
        let latest = live.latest().unwrap();
        assert!((latest.elapsed - 0.9).abs() < 1e-12);
    }

    struct Failing;

    impl TickSink for Failing {
        fn consume(&mut self, _tick: &Tick) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn sink_failure_is_reported_on_join() {
        let (tx, rx) = mpsc::channel();
        let runner = QueueRunner::spawn("failing", rx, Failing).unwrap();
        tx.send(Arc::new(tick(0.0, 4))).unwrap();
        tx.send(Arc::new(tick(0.1, 4))).unwrap();
        drop(tx);
        assert!(matches!(runner.join(), Err(AcquisitionError::Sink { .. })));
    }
}
