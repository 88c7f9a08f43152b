// Continuous acquisition example
//
// Records from the simulated board for a fixed time while draining the
// display queues at the GUI refresh cadence, or accepts remote-control
// commands on stdin.

use clap::Parser;
use mccrecorder::recording::default_file_name;
use mccrecorder::{
    AcquisitionSettings, BufferModel, DaqSession, Pacing, RemoteController, SessionConfig,
    SignalHistory, SimulatedDevice, SimulatedDriver, VoltageRange, MAX_SAMPLES_PER_REFRESH,
    REFRESH_INTERVAL,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const COUNTER_UPDATE_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Parser)]
#[command(name = "record")]
#[command(about = "Record analog input from a (simulated) MCC DAQ board")]
#[command(long_about = "Runs a continuous scan, writes every sample to a binary recording and keeps a live per-channel history, the way the recorder GUI does.")]
struct Args {
    /// Lowest channel to scan
    #[arg(long, default_value_t = 0)]
    low: u32,

    /// Highest channel to scan
    #[arg(long, default_value_t = 3)]
    high: u32,

    /// Samples per second per channel
    #[arg(short, long, default_value_t = 10_000.0)]
    rate: f64,

    /// Input range, e.g. BIP10VOLTS
    #[arg(long, default_value = "BIP10VOLTS")]
    range: String,

    /// Seconds to record
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// Directory the recording is written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Settings file to take channels, range and rate from
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Only view, do not write a file
    #[arg(long)]
    view_only: bool,

    /// Pulse output frequency in Hz
    #[arg(long)]
    pulse: Option<f64>,

    /// Simulate a board that buffers 16-bit counts
    #[arg(long)]
    raw: bool,

    /// Read remote-control commands from stdin instead of recording
    #[arg(long)]
    remote: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let (config, scan_counters) = match &args.settings {
        Some(path) => {
            let settings = AcquisitionSettings::load(path)?;
            (SessionConfig::from_settings(&settings)?, settings.scan_counters)
        }
        None => {
            let range = VoltageRange::from_name(&args.range)
                .ok_or_else(|| format!("Unknown voltage range: {}", args.range))?;
            let config = SessionConfig::builder()
                .channel_range(args.low, args.high)
                .voltage_range(range)
                .sampling_rate(args.rate)
                .build()?;
            (config, true)
        }
    };

    let device = Arc::new(
        SimulatedDevice::builder()
            .pacing(Pacing::RealTime)
            .buffer_model(if args.raw { BufferModel::Raw } else { BufferModel::Scaled })
            .signal(SimulatedDevice::sine_signal(5.0, config.sampling_rate()))
            .build(),
    );
    let mut session = DaqSession::new(Box::new(SimulatedDriver::new(vec![device])));

    println!("MCC Recorder");
    println!("============\n");
    for (index, descriptor) in session.scan_devices()?.iter().enumerate() {
        println!("  [{index}] {descriptor}");
    }
    let descriptor = session.connect(0)?;
    println!("✓ Connected to {descriptor}\n");

    if args.remote {
        return run_remote(&mut session, config);
    }

    if let Some(frequency) = args.pulse {
        let (frequency, duty) = session.start_pulsing(frequency)?;
        println!("Pulsing at {frequency:.3} Hz ({:.0}% duty)", duty * 100.0);
    }

    let rate = config.sampling_rate();
    let num_channels = config.num_channels();
    if args.view_only {
        session.start_viewing(config)?;
        println!("Viewing for {} s", args.seconds);
    } else {
        let path = default_file_name(&args.output);
        session.start_recording(config, &path)?;
        println!("Recording to {} for {} s", path.display(), args.seconds);
    }

    let mut history = SignalHistory::new(num_channels, rate, 10.0);
    let start = Instant::now();
    let mut last_counter_read = Instant::now();

    while start.elapsed() < Duration::from_secs(args.seconds) {
        std::thread::sleep(REFRESH_INTERVAL);
        if !(session.is_recording() || session.is_viewing()) {
            break;
        }
        if let Some(queues) = session.data_queues() {
            history.update(&queues.refresh(MAX_SAMPLES_PER_REFRESH));
        }

        if last_counter_read.elapsed() >= COUNTER_UPDATE_INTERVAL {
            last_counter_read = Instant::now();
            let stats = session.stats();
            let latest = history.history(0).last().copied().unwrap_or_default();
            print!(
                "  {:>3} s  {:>9} samples  {:>5} chunks  ch0 {:+.4} V",
                start.elapsed().as_secs(),
                stats.samples,
                stats.chunks,
                latest
            );
            if scan_counters {
                print!("  counters {:?}", session.read_counters()?);
            }
            println!();
        }
    }

    if let Some((active, actual_rate)) = session.active_config() {
        log::debug!("Stopping {} channels at {actual_rate} Hz", active.num_channels());
    }
    session.stop()?;
    if session.has_fault() {
        if let Some(err) = session.take_fault() {
            eprintln!("✗ Acquisition ended early: {err}");
        }
    }

    let stats = session.stats();
    println!("\nAcquired {} samples in {} chunks", stats.samples, stats.chunks);
    let drops: u64 = stats.queue_drops.iter().sum();
    if drops > 0 {
        println!("Display dropped {drops} samples");
    }
    if let Some(path) = session.file_name() {
        println!("Recording saved to {}", path.display());
    }

    session.release_device()?;
    Ok(())
}

fn run_remote(session: &mut DaqSession, config: SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut controller = RemoteController::new(config);
    println!("Commands: start_recording <path>, start_viewing, stop, status, pulse <hz>, pulse_stop, load <settings.json>");

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // Settings reloads are handled here, the session never sees them
        if let Some(path) = line.trim().strip_prefix("load ") {
            match AcquisitionSettings::load(path.trim()).and_then(|s| SessionConfig::from_settings(&s)) {
                Ok(config) => {
                    println!("Loaded {} channels from {}", config.num_channels(), path.trim());
                    controller.set_config(config);
                }
                Err(err) => eprintln!("✗ {err}"),
            }
            continue;
        }
        println!("{}", controller.handle_line(session, &line));
    }

    session.release_device()?;
    Ok(())
}
