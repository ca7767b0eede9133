use std::convert::TryFrom;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use linux_embedded_hal::Serial;
use log::LevelFilter;
use serial_core::{BaudRate, CharSize, FlowControl, Parity, PortSettings, SerialPort, StopBits};

use mhz14a::{Config, DetectionRange, Session};

/// Print the CO2 concentration (ppm) measured by an MH-Z14A sensor, one reading per line.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Serial device the sensor is attached to
    #[arg(default_value = "/dev/ttyUSB0")]
    device: PathBuf,

    /// Detection range in ppm: 2000, 5000 or 10000
    #[arg(long, default_value = "10000", value_parser = parse_range)]
    range: DetectionRange,

    /// Seconds between readings
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Seconds to wait for the sensor to acknowledge each startup command
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    handshake_timeout: u64,

    /// Log every received byte and frame decision to stderr
    #[arg(long)]
    trace: bool,
}

fn parse_range(s: &str) -> Result<DetectionRange, String> {
    let ppm: u16 = s.parse().map_err(|e| format!("{}", e))?;
    DetectionRange::try_from(ppm).map_err(|e| e.to_string())
}

/// 9600 8N1, raw, with reads giving up after 100ms.
///
/// Input already queued on the port is not discarded, since `serial_core` has no
/// input flush. The receiver drops such stale bytes within one frame window.
fn open_link(path: &Path) -> Result<Serial> {
    let mut serial = Serial::open(path)
        .with_context(|| format!("failed to open serial device {}", path.display()))?;

    let settings = PortSettings {
        baud_rate: BaudRate::Baud9600,
        char_size: CharSize::Bits8,
        parity: Parity::ParityNone,
        stop_bits: StopBits::Stop1,
        flow_control: FlowControl::FlowNone,
    };
    serial
        .0
        .configure(&settings)
        .with_context(|| format!("failed to configure serial device {}", path.display()))?;
    serial
        .0
        .set_timeout(Duration::from_millis(100))
        .with_context(|| format!("failed to set read timeout on {}", path.display()))?;

    Ok(serial)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if args.trace {
        logger.filter_module("mhz14a", LevelFilter::Trace);
    }
    logger.init();

    let serial = open_link(&args.device)?;
    let config = Config {
        range: args.range,
        interval: Duration::from_secs(args.interval),
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
    };

    let mut session = Session::new(serial, Instant::now(), config);
    session.initialize()?;

    let stdout = io::stdout();
    session
        .run(stdout.lock())
        .context("failed to write CO2 reading")?;

    Ok(())
}
