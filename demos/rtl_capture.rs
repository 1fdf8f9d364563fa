//! Capture raw I/Q bytes from an RTL-SDR device.
//!
//! Output is interleaved unsigned 8-bit I/Q (cu8), as written by `rtl_sdr`.
//!
//! # Usage
//!
//! ```sh
//! # 10 buffers from a scripted device
//! cargo run --example rtl_capture -- -s 2048000 -c 100M -n 10 -o capture.cu8
//!
//! # ADS-B band from a real dongle, piped to stdout
//! cargo run --example rtl_capture --features rtlsdr -- \
//!     --source rtlsdr -c 1090M -s 2.4M -n 100 -o -
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::process;
use std::str::FromStr;

use clap::{ArgAction, Parser, ValueEnum};
use rtlsdr_session::mock::{MockDevice, MockDriver};
use rtlsdr_session::{Driver, Gain, SdrContext, StreamConfig, TunerSettings};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
struct Frequency(u32);

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(stripped) = s.strip_suffix('M') {
            let val: f64 = stripped.trim().parse().map_err(|_| "Invalid MHz value")?;
            Ok(Frequency((val * 1_000_000.0) as u32))
        } else if let Some(stripped) = s.strip_suffix('k') {
            let val: f64 = stripped.trim().parse().map_err(|_| "Invalid kHz value")?;
            Ok(Frequency((val * 1_000.0) as u32))
        } else {
            let val: u32 = s.parse().map_err(|_| "Invalid Hz value")?;
            Ok(Frequency(val))
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceType {
    Mock,
    #[cfg(feature = "rtlsdr")]
    Rtlsdr,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture raw I/Q from an RTL-SDR device", long_about = None)]
struct Args {
    /// Center frequency in Hz (accepts k/M suffix, e.g. 100M)
    #[arg(short, long, value_parser = Frequency::from_str)]
    center_freq: Frequency,

    /// Sample rate in Hz (accepts k/M suffix)
    #[arg(short, long, value_parser = Frequency::from_str, default_value = "2048000")]
    sample_rate: Frequency,

    /// Tuner gain in dB (automatic gain when omitted)
    #[arg(short, long)]
    gain: Option<f32>,

    /// Number of buffers to capture
    #[arg(short, long, default_value_t = 10)]
    num_buffers: usize,

    /// Buffer length in bytes
    #[arg(short, long, default_value_t = 16 * 16384)]
    buf_len: u32,

    /// Output file, `-` for stdout
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Device index
    #[arg(short, long, default_value_t = 0)]
    device_index: u32,

    /// Driver to capture with
    #[arg(long, default_value = "mock")]
    source: SourceType,

    /// Verbosity level (-v=info, -vv=debug, -vvv=trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .try_init();

    let result = match args.source {
        SourceType::Mock => run(SdrContext::init(demo_driver(&args)), &args),
        #[cfg(feature = "rtlsdr")]
        SourceType::Rtlsdr => run(
            SdrContext::init(rtlsdr_session::rtlsdr::RtlSdrDriver::new()),
            &args,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// A single scripted dongle producing a 25 kHz tone, forever.
fn demo_driver(args: &Args) -> MockDriver {
    let samples = args.buf_len as usize / 2;
    let step = 2.0 * std::f32::consts::PI * 25_000.0 / args.sample_rate.0.max(1) as f32;
    let tone: Vec<u8> = (0..samples)
        .flat_map(|n| {
            let phase = step * n as f32;
            [
                ((phase.cos() + 1.0) * 127.5) as u8,
                ((phase.sin() + 1.0) * 127.5) as u8,
            ]
        })
        .collect();

    MockDriver::new().with_device(
        MockDevice::new("Realtek", "RTL2838UHIDIR", "00000001")
            .with_buffers(vec![tone; args.num_buffers])
            .stream_until_cancelled(),
    )
}

fn run<D: Driver>(context: SdrContext<D>, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let session = context.open(args.device_index)?;

    let mut settings = TunerSettings::new(args.sample_rate.0, args.center_freq.0);
    settings.gain = Some(match args.gain {
        Some(db) => Gain::Manual((db * 10.0).round() as i32),
        None => Gain::Auto,
    });
    session.configure(&settings)?;
    info!(
        "tuned device {} to {} Hz at {} S/s",
        args.device_index, args.center_freq.0, args.sample_rate.0
    );

    let mut output: Box<dyn Write> = if args.output == "-" {
        Box::new(BufWriter::new(io::stdout().lock()))
    } else {
        Box::new(BufWriter::new(File::create(&args.output)?))
    };

    let config = StreamConfig::new(32, args.buf_len);
    let mut stream = session.stream(&config)?;

    let mut written = 0;
    let mut bytes = 0;
    while written < args.num_buffers {
        let Some(chunk) = stream.next_blocking() else {
            warn!("stream ended after {} buffer(s)", written);
            break;
        };
        let chunk = chunk?;
        output.write_all(chunk.as_bytes())?;
        bytes += chunk.len();
        written += 1;
    }

    session.stop()?;
    // Wait for the read loop to wind down; chunks still queued are dropped.
    while stream.next_blocking().is_some() {}
    output.flush()?;
    session.close();

    info!("wrote {} buffer(s), {} bytes", written, bytes);
    Ok(())
}
