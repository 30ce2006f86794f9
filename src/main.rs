use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::info;

use multisensor::acquisition::{BinaryLogWriter, LoopEvent, QueueRunner, TcpGasStateSink};
use multisensor::calibration::{CalibrationSource, Converters};
use multisensor::config::{CalibrationFile, DeviceSettings};
use multisensor::device::{DeviceChannel, Emulator};
use multisensor::logging::init_logging;
use multisensor::program::ProgramGenerator;
use multisensor::{AcquisitionLoop, FrameCodec};

#[derive(Parser, Debug)]
#[command(name = "multisensor", version, about = "Run and inspect multisensor experiment programs")]
struct Args {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a summary of a program file
    Inspect {
        program: PathBuf,
    },
    /// Print every tick of a program
    Dump {
        program: PathBuf,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a program against the instrument
    Run {
        #[arg(long)]
        settings: PathBuf,
        #[arg(long)]
        program: PathBuf,
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Directory for the acquisition log
        #[arg(long, default_value = ".")]
        output: PathBuf,
        /// Serial port, overriding the settings file
        #[arg(long)]
        port: Option<String>,
        /// Use the built-in emulator instead of a serial port
        #[arg(long)]
        emulate: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Inspect { program } => inspect(&load_program(&program)?),
        Command::Dump { program, output } => dump(&load_program(&program)?, output),
        Command::Run {
            settings,
            program,
            calibration,
            output,
            port,
            emulate,
        } => acquire(settings, program, calibration, output, port, emulate),
    }
}

fn load_program(path: &Path) -> Result<ProgramGenerator> {
    ProgramGenerator::load(path).with_context(|| format!("loading program {}", path.display()))
}

fn inspect(program: &ProgramGenerator) -> Result<()> {
    println!("Frequency:   {} Hz", program.settings().frequency);
    println!("Stages:      {}", program.stages().len());
    for (i, stage) in program.stages().iter().enumerate() {
        println!("  [{i}] {:?}: {} ticks", stage.kind(), stage.tick_count());
    }
    println!("Ticks:       {}", program.tick_count());
    println!("Full time:   {:.3} s", program.calculate_full_time());
    match program.calculate_min_and_max_temperatures() {
        Some((min, max)) => println!("Temperature: {min} .. {max}"),
        None => println!("Temperature: -"),
    }
    Ok(())
}

fn dump(program: &ProgramGenerator, output: Option<PathBuf>) -> Result<()> {
    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    for tick in program.parse_program_to_queue() {
        let temperatures: Vec<String> = tick.temperatures.iter().map(|t| format!("{t:.3}")).collect();
        writeln!(
            out,
            "{:.3}\t{}\t{}\t{}\t{:?}",
            tick.elapsed,
            temperatures.join(","),
            tick.gas_state,
            tick.stage_id,
            tick.kind
        )?;
    }
    out.flush()?;
    Ok(())
}

fn acquire(
    settings: PathBuf,
    program: PathBuf,
    calibration: Option<PathBuf>,
    output: PathBuf,
    port: Option<String>,
    emulate: bool,
) -> Result<()> {
    let mut settings = DeviceSettings::load(&settings)
        .with_context(|| format!("loading settings {}", settings.display()))?;
    if let Some(port) = port {
        settings.port = port;
    }
    let program = load_program(&program)?;
    let calibration = calibration
        .map(|path| CalibrationFile::load(&path).with_context(|| format!("loading calibration {}", path.display())))
        .transpose()?;
    let source = calibration.as_ref().map(|c| c as &dyn CalibrationSource);

    let channels = settings.channels()?;
    let converters = match source {
        Some(source) => Converters::from_source(source, channels, settings.setpoint_mode, settings.multirange),
        None => Converters::passthrough(channels, settings.setpoint_mode),
    };
    let range_mode = settings.range_mode(source)?;

    let device = if emulate {
        info!("Using the emulated instrument");
        let codec = FrameCodec::new(channels, settings.resistance_converter)?;
        DeviceChannel::from_transport(
            Emulator::new(codec),
            channels,
            settings.resistance_converter,
            settings.read_timeout(),
        )?
    } else {
        DeviceChannel::open(
            &settings.port,
            channels,
            settings.resistance_converter,
            settings.baud_rate,
            settings.read_timeout(),
        )?
    };

    let mut acquisition = AcquisitionLoop::new(device, &program, converters, range_mode)?
        .with_groups(settings.groups()?)
        .with_max_attempts(settings.max_attempts)
        .with_monitor(|event| match event {
            LoopEvent::RangeChanged { elapsed, ranges } => {
                info!("t = {elapsed:.1}s: ranges {:?}", ranges.iter().map(|r| r.as_u8()).collect::<Vec<_>>())
            }
            LoopEvent::Faulted { message } => eprintln!("Acquisition fault: {message}"),
            _ => {}
        });
    if let Some(address) = &settings.gas_server {
        let sink = TcpGasStateSink::with_timeout(address, settings.gas_timeout())
            .with_context(|| format!("resolving gas server {address}"))?;
        acquisition = acquisition.with_gas_sink(sink);
    }

    let path = output.join(format!("{}.dat", Local::now().format("%Y%m%d-%H%M%S")));
    let writer = BinaryLogWriter::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let log = QueueRunner::spawn("log", acquisition.subscribe(), writer)?;

    println!(
        "Running {} ticks ({:.1} s), logging to {}",
        program.tick_count(),
        program.calculate_full_time(),
        path.display()
    );
    acquisition.start()?;
    let summary = acquisition.join();
    let writer = log.join()?;
    let summary = summary?;

    println!(
        "Done: {} ticks in {:.1} s, {} records written",
        summary.ticks,
        summary.duration.as_secs_f64(),
        writer.records()
    );
    Ok(())
}
