//! List attached RTL-SDR devices.
//!
//! # Usage
//!
//! ```sh
//! # Scripted devices, no hardware needed
//! cargo run --example rtl_list
//!
//! # Real dongles
//! cargo run --example rtl_list --features rtlsdr -- --source rtlsdr
//! ```

use std::process;

use clap::{ArgAction, Parser, ValueEnum};
use rtlsdr_session::mock::{MockDevice, MockDriver};
use rtlsdr_session::{Driver, SdrContext};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceType {
    Mock,
    #[cfg(feature = "rtlsdr")]
    Rtlsdr,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "List RTL-SDR devices", long_about = None)]
struct Args {
    /// Driver to enumerate with
    #[arg(long, default_value = "mock")]
    source: SourceType,

    /// Open each device to check it is not claimed by another process
    #[arg(long, default_value_t = false)]
    probe: bool,

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
        SourceType::Mock => run(SdrContext::init(demo_driver()), args.probe),
        #[cfg(feature = "rtlsdr")]
        SourceType::Rtlsdr => run(
            SdrContext::init(rtlsdr_session::rtlsdr::RtlSdrDriver::new()),
            args.probe,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn demo_driver() -> MockDriver {
    MockDriver::new()
        .with_device(MockDevice::new("Realtek", "RTL2838UHIDIR", "00000001"))
        .with_device(
            MockDevice::new("NooElec", "NESDR SMArt v5", "32871").with_name("Generic RTL2832U"),
        )
}

fn run<D: Driver>(context: SdrContext<D>, probe: bool) -> rtlsdr_session::Result<()> {
    let devices = context.list_devices()?;

    if devices.is_empty() {
        println!("No supported devices found.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    for dev in &devices {
        println!(
            "  {}:  {}, {}, SN: {} ({})",
            dev.index, dev.vendor, dev.product, dev.serial, dev.name
        );

        if probe {
            match context.open(dev.index) {
                Ok(session) => {
                    println!("      available");
                    session.close();
                }
                Err(e) => println!("      unavailable: {}", e),
            }
        }
    }

    Ok(())
}
