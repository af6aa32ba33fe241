use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tevaa::logging::init_rust_logging;
use tevaa::{
    Channel, ConnectionState, Event, Reading, RecvError, SensorConfig, SensorController,
};

#[derive(Parser, Debug)]
#[command(name = "tevaa-monitor", about = "Poll a TEV/AA sensor over Modbus RTU")]
struct Args {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Connect and print readings until interrupted
    Monitor(MonitorArgs),
}

#[derive(clap::Args, Debug)]
struct MonitorArgs {
    /// Serial port (e.g., /dev/ttyUSB0 or COM3); overrides the config file
    port: Option<String>,
    /// JSON config file with link, poll and registers sections
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    baud: Option<u32>,
    /// Modbus slave address (1-247)
    #[arg(short, long)]
    address: Option<u8>,
    /// Response timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Attempts per read
    #[arg(long)]
    retries: Option<u32>,
    /// Poll period in milliseconds
    #[arg(long)]
    period_ms: Option<u64>,
    /// Read waveforms every N cycles (0 = never)
    #[arg(long)]
    subrate: Option<u32>,
    /// Stop after this many readings
    #[arg(short = 'n', long)]
    count: Option<u64>,
}

fn main() {
    let args = Args::parse();
    init_rust_logging(args.verbose);
    if let Err(e) = run(args) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Ports => list_ports(),
        Command::Monitor(monitor_args) => monitor(monitor_args),
    }
}

fn list_ports() -> Result<()> {
    let ports = SensorController::list_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for (i, port) in ports.iter().enumerate() {
        println!("{}. {} - {}", i + 1, port.name, port.label);
    }
    Ok(())
}

fn monitor(args: MonitorArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SensorConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SensorConfig::default(),
    };
    if let Some(port) = args.port {
        config.link.port = port;
    }
    if config.link.port.is_empty() {
        bail!("No serial port given; run `tevaa-monitor ports` to list them");
    }
    if let Some(baud) = args.baud {
        config.link.baud_rate = baud;
    }
    if let Some(address) = args.address {
        config.link.slave_address = address;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.link.timeout_ms = timeout_ms;
    }
    if let Some(retries) = args.retries {
        config.link.retries = retries;
    }
    if let Some(period_ms) = args.period_ms {
        config.poll.period_ms = period_ms;
    }
    if let Some(subrate) = args.subrate {
        config.poll.waveform_subrate = subrate;
    }

    println!(
        "--- Connecting to {} ({} baud, address {}) ---",
        config.link.port, config.link.baud_rate, config.link.slave_address
    );
    let mut sensor = SensorController::new(config.poll, config.registers);
    let events = sensor.events();
    sensor
        .connect(config.link.clone())
        .with_context(|| format!("Failed to connect on {}", config.link.port))?;

    let mut received = 0u64;
    loop {
        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(Event::Reading(reading)) => {
                print_reading(&reading);
                received += 1;
                if args.count.is_some_and(|n| received >= n) {
                    break;
                }
            }
            Ok(Event::StateChanged { old, new }) => {
                println!("[state] {old} -> {new}");
                if new == ConnectionState::Failed {
                    sensor.disconnect();
                    bail!("Sensor stopped responding on {}", config.link.port);
                }
            }
            Err(RecvError::Timeout) => {}
            Err(RecvError::Closed) => break,
        }
    }

    if let Some(stats) = sensor.stats() {
        println!(
            "Done: {} requests, {} responses, {} timeouts, {} CRC errors",
            stats.requests, stats.responses, stats.timeouts, stats.checksum_errors
        );
    }
    sensor.disconnect();
    Ok(())
}

fn print_reading(reading: &Reading) {
    let mut line = format!(
        "[{}] TEV: {:.1} dB | AA: {:.1} dB",
        reading.timestamp.format("%H:%M:%S%.3f"),
        reading.tev,
        reading.aa
    );
    for extra in &reading.extras {
        line.push_str(&format!(" | {}: {} {}", extra.name, extra.value, extra.unit));
    }
    for channel in [Channel::Tev, Channel::Aa] {
        if let Some(w) = reading.waveform(channel) {
            if reading.is_waveform_fresh(channel) {
                line.push_str(&format!(
                    " | {} wave n={} min={} max={} mean={:.1}",
                    channel.as_str(),
                    w.len(),
                    w.min().unwrap_or_default(),
                    w.max().unwrap_or_default(),
                    w.mean().unwrap_or_default()
                ));
            }
        }
    }
    println!("{line}");
}
