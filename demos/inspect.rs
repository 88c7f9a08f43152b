// Recording inspection example
//
// Loads a binary recording, prints its header and a summary of each channel,
// and optionally exports it to CSV.

use clap::Parser;
use mccrecorder::Recording;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "inspect")]
#[command(about = "Inspect a binary MCC recording")]
struct Args {
    /// Recording file to read
    file: PathBuf,

    /// Number of leading rows to print
    #[arg(short, long, default_value_t = 5)]
    rows: usize,

    /// Export the samples to this CSV file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
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

    let recording = Recording::open(&args.file)?;
    let header = &recording.header;

    println!("Recording: {}", args.file.display());
    println!("  Device:        {}", header.device);
    println!("  Started:       {}", header.datetime);
    println!("  Sampling rate: {} Hz", header.sampling_rate);
    println!("  Range:         {}", header.voltage_range);
    println!("  Channels:      {}", header.num_channels);
    println!(
        "  Samples:       {} ({:.2} s)",
        recording.num_samples(),
        recording.num_samples() as f64 / header.sampling_rate
    );
    if recording.dropped_samples() > 0 {
        println!("  Partial row:   {} samples dropped", recording.dropped_samples());
    }

    println!("\nChannel summary:");
    for (position, entry) in header.channel_list.iter().enumerate() {
        let values = recording.channel(position);
        if values.is_empty() {
            println!("  {:>3} {:<16} (empty)", entry.id, entry.name);
            continue;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        println!(
            "  {:>3} {:<16} min {:+.4} V  max {:+.4} V  mean {:+.4} V",
            entry.id, entry.name, min, max, mean
        );
    }

    let df = recording.to_dataframe()?;
    println!("\n{}", df.head(Some(args.rows)));

    if let Some(path) = &args.csv {
        recording.write_csv(path)?;
        println!("Exported to {}", path.display());
    }

    Ok(())
}
