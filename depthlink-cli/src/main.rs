use anyhow::Result;
use clap::Parser;
use depthlink_cli::{Camera, CommonArgs};
use depthlink_lib::capabilities::Opcode;
use depthlink_lib::error::ProtocolError;
use tracing::warn;

/// Connect to a depth camera and print what it reports about itself.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
    /// Also list every opcode the firmware understands
    #[arg(long)]
    opcodes: bool,
}

/// Optional queries: missing support is not an error for this tool.
fn optional<T>(what: &str, result: Result<T, ProtocolError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(ProtocolError::UnsupportedOpcode { .. }) => None,
        Err(e) => {
            warn!(error = %e, "Failed to read {what}");
            None
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = args.common.setup_logging()?;
    let config = args.common.load_config()?;

    let camera = Camera::open(&config)?;
    let caps = camera.commands.capabilities();
    let versions = camera.versions;

    println!("============================================================");
    println!("DEVICE INFORMATION");
    println!("============================================================");
    println!("Firmware Version:   {}", versions.firmware);
    println!("Chip:               {:#010x}", versions.chip);
    println!("FPGA:               {}", versions.fpga);
    println!("System Version:     {}", versions.system_version);
    if let Some(serial) = optional("serial number", camera.commands.get_serial_number()) {
        println!("Serial Number:      {serial}");
    }
    if let Some(platform) = optional("platform string", camera.commands.get_platform_string()) {
        if !platform.is_empty() {
            println!("Platform:           {platform}");
        }
    }
    if let Some(core) = optional("USB core type", camera.commands.get_usb_core_type()) {
        println!("USB Core:           {core}");
    }
    if let Some(mode) = optional("firmware mode", camera.commands.get_mode()) {
        println!("Mode:               {mode}");
    }

    println!();
    println!("Protocol:           {} header, magic {:#06x}/{:#06x}", caps.header, caps.host_magic, caps.device_magic);
    println!("Max Packet Size:    {}", caps.max_packet_size);
    println!("SOF Padding:        {}", caps.sof_padding);
    println!("Skip First Chunk:   {}", caps.ignore_first_chunk);
    println!("Filesystem Lock:    {}", caps.has_filesystem_lock);

    if args.opcodes {
        println!();
        println!("{:<28} {:>6} {:>10}", "Opcode", "Wire", "Timeout");
        println!("{}", "-".repeat(46));
        for opcode in Opcode::ALL {
            if let Some(wire) = caps.opcode(opcode) {
                println!(
                    "{:<28} {:>6} {:>9}s",
                    opcode.to_string(),
                    wire,
                    caps.response_timeout(opcode).as_secs()
                );
            }
        }
    }

    Ok(())
}
