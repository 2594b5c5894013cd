use anyhow::Result;
use clap::Parser;
use depthlink_cli::{Camera, CommonArgs, StreamArgs, dump_sink};
use depthlink_lib::clock::{ClockContext, MonotonicClock};
use depthlink_lib::constants::PARAM_DEPTH_FORMAT;
use depthlink_lib::observer::FpsCalculator;
use depthlink_lib::reassembler::EndpointReassembler;
use depthlink_lib::stream::{FirmwareStreamMode, StreamKind};
use depthlink_lib::transport::StreamTransport;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Stream frames from the camera and report rate and loss once a second.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    stream: StreamArgs,
    /// Duration in seconds
    #[arg(short, long, default_value = "5")]
    duration: u64,
    /// Size of each bulk read
    #[arg(long, default_value_t = 16 * 1024)]
    chunk_size: usize,
    /// Write packet and timestamp CSV dumps into this directory
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = args.common.setup_logging()?;
    let config = args.common.load_config()?;

    let camera = Camera::open(&config)?;
    let caps = camera.commands.capabilities().clone();
    let kind = args.stream.kind;

    let dump = dump_sink(args.dump_dir.as_deref())?;
    let clock = ClockContext::new(Arc::new(MonotonicClock::new()), config.device_frequency)
        .with_dump(dump.clone())
        .shared();
    let fps = Arc::new(FpsCalculator::default());
    let (processor, mut frames) = args.stream.processor(&config, &caps, clock, dump)?;
    let processor = processor.with_observer(fps.clone());

    // Stop whatever the channel was doing before switching formats
    camera.commands.set_param(kind.mode_param(), FirmwareStreamMode::Off.into())?;
    if kind == StreamKind::Depth {
        if let Some(format) = args.stream.input.depth_format_value() {
            camera.commands.set_param(PARAM_DEPTH_FORMAT, format)?;
        }
    }

    let reassembler = Arc::new(EndpointReassembler::for_capabilities(kind.endpoint(), &caps));
    let ignore = if caps.ignore_first_chunk { args.chunk_size } else { 0 };
    reassembler.arm(processor, ignore);
    let mut handle = camera
        .streams
        .start_stream(kind.endpoint(), args.chunk_size, reassembler.callback())?;
    camera.commands.set_param(kind.mode_param(), kind.firmware_mode().into())?;
    info!(stream = %kind, endpoint = format!("{:#04x}", kind.endpoint()), "Streaming");

    println!(
        "{:>8} {:>8} {:>10} {:>8} {:>8} {:>10}",
        "Frames", "FPS", "Packets", "Lost", "Corrupt", "Center"
    );
    println!("{}", "-".repeat(58));

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(args.duration) && handle.is_running() {
        std::thread::sleep(Duration::from_secs(1));

        let center = frames.latest().map(|frame| {
            if let Err(e) = frame.check() {
                warn!(frame = frame.id, error = %e, "Latest frame is damaged");
            }
            let pixels = frame.data.len() / 2;
            frame.data.samples().nth(pixels / 2).unwrap_or_default()
        });
        let stats = reassembler.stats().unwrap_or_default();
        println!(
            "{:>8} {:>8.1} {:>10} {:>8} {:>8} {:>10}",
            fps.frames(),
            fps.fps(),
            stats.packets,
            stats.lost,
            stats.corrupted,
            center.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
        );
    }

    if let Err(e) = camera.commands.set_param(kind.mode_param(), FirmwareStreamMode::Off.into()) {
        warn!(error = %e, "Failed to switch the stream off");
    }
    handle.stop();
    if let Some(processor) = reassembler.stop() {
        let stats = processor.stats();
        println!("{}", "-".repeat(58));
        println!("\nStatistics:");
        println!("  Bytes:            {}", stats.bytes);
        println!("  Packets:          {}", stats.packets);
        println!("  Lost packets:     {}", stats.lost);
        println!("  Frames:           {}", stats.frames);
        println!("  Corrupted frames: {}", stats.corrupted);
    }

    Ok(())
}
