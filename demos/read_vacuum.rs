// Vacuum logging example
//
// Polls the Pirani gauge and the capacitance manometer of one vacuum chamber
// and logs a sample every few seconds until Ctrl+C.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use vacuum_gauges::{ChamberProfile, SessionConfig, VacuumSession};

#[derive(Parser)]
#[command(name = "read_vacuum")]
#[command(version = "1.0")]
#[command(about = "Log vacuum chamber pressure from a Pirani gauge and a capacitance manometer")]
#[command(long_about = "Polls both gauges of a vacuum chamber, writes a vacuum-<timestamp>.csv log and echoes every sample to stdout. Chamber -1 runs against canned replies without hardware.")]
struct Args {
    /// Chamber number (1, 2, or -1 for test mode)
    #[arg(allow_hyphen_values = true)]
    chamber: ChamberProfile,

    /// Seconds between samples
    #[arg(short, long, default_value_t = 9.0)]
    interval: f64,

    /// Directory for the output file
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Stop after this many samples
    #[arg(short = 'n', long)]
    count: Option<u64>,

    /// Override the Pirani gauge serial port
    #[arg(long)]
    pirani_port: Option<String>,

    /// Override the capacitance manometer serial port
    #[arg(long)]
    capacitance_port: Option<String>,

    /// Skip samples whose replies cannot be decoded instead of stopping
    #[arg(long)]
    skip_malformed: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and raw gauge traffic")]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("VACUUM READER");
    println!("=============");
    println!("Chamber: {}", args.chamber);
    println!("Press Ctrl+C to stop\n");

    let config = SessionConfig::new(args.chamber)
        .measurement_interval(Duration::from_secs_f64(args.interval.max(0.0)))
        .output_dir(args.output_dir)
        .max_samples(args.count)
        .skip_malformed(args.skip_malformed)
        .ports(args.pirani_port, args.capacitance_port);
    let session = VacuumSession::new(config);

    let cancel = session.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
        eprintln!("Could not install Ctrl+C handler: {}", e);
        return ExitCode::FAILURE;
    }

    match session.run() {
        Ok(summary) => {
            eprintln!(
                "\nDone: {} sample(s) written, {} skipped{}",
                summary.samples_written,
                summary.samples_skipped,
                if summary.cancelled { " (interrupted)" } else { "" }
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
