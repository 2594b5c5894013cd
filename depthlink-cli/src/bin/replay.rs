use anyhow::{Context, Result};
use clap::Parser;
use depthlink_cli::{CommonArgs, StreamArgs, dump_sink};
use depthlink_lib::capabilities::capabilities_for;
use depthlink_lib::clock::{ClockContext, ManualClock};
use depthlink_lib::observer::{FpsCalculator, FrameObserver};
use depthlink_lib::reassembler::EndpointReassembler;
use depthlink_lib::version::FirmwareVersion;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Reassemble frames from a raw capture of one bulk endpoint, without a camera.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    stream: StreamArgs,
    /// Captured endpoint bytes, concatenated in arrival order
    capture: PathBuf,
    /// Firmware that produced the capture
    #[arg(short, long, default_value = "5.8.22")]
    firmware: FirmwareVersion,
    /// Bytes fed per simulated bulk read
    #[arg(long, default_value_t = 16 * 1024)]
    chunk_size: usize,
    /// Simulated host time between bulk reads, in microseconds
    #[arg(long, default_value_t = 500)]
    chunk_interval_us: u64,
    /// Write packet and timestamp CSV dumps into this directory
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

/// Prints a line per completed frame and keeps the rate.
struct FrameLog {
    fps: FpsCalculator,
}

impl FrameObserver for FrameLog {
    fn on_frame(&self, frame_id: u32, timestamp_us: u64) {
        self.fps.on_frame(frame_id, timestamp_us);
        println!("{frame_id:>8} {timestamp_us:>14} {:>8.1}", self.fps.fps());
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = args.common.setup_logging()?;
    let config = args.common.load_config()?;

    let capture = std::fs::read(&args.capture).with_context(|| format!("Failed to read {:?}", args.capture))?;
    let caps = capabilities_for(args.firmware);
    info!(bytes = capture.len(), firmware = %args.firmware, "Replaying capture");

    let host = Arc::new(ManualClock::new(0));
    let dump = dump_sink(args.dump_dir.as_deref())?;
    let clock = ClockContext::new(host.clone(), config.device_frequency)
        .with_dump(dump.clone())
        .shared();
    let log = Arc::new(FrameLog {
        fps: FpsCalculator::default(),
    });
    let (processor, _frames) = args.stream.processor(&config, &caps, clock, dump)?;
    let processor = processor.with_observer(log.clone());

    let reassembler = EndpointReassembler::for_capabilities(args.stream.kind.endpoint(), &caps);
    let ignore = if caps.ignore_first_chunk { args.chunk_size } else { 0 };
    reassembler.arm(processor, ignore);

    println!("{:>8} {:>14} {:>8}", "Frame", "Time (us)", "FPS");
    println!("{}", "-".repeat(32));
    for chunk in capture.chunks(args.chunk_size.max(1)) {
        host.advance(Duration::from_micros(args.chunk_interval_us));
        reassembler.feed(chunk);
    }
    println!("{}", "-".repeat(32));

    if let Some(processor) = reassembler.stop() {
        let stats = processor.stats();
        println!("\nStatistics:");
        println!("  Bytes:            {}", stats.bytes);
        println!("  Packets:          {}", stats.packets);
        println!("  Lost packets:     {}", stats.lost);
        println!("  Frames:           {}", stats.frames);
        println!("  Corrupted frames: {}", stats.corrupted);
        println!("  Left undecoded:   {}", processor.pending());
    }

    Ok(())
}
