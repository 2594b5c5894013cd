use anyhow::{Result, bail};
use clap::Parser;
use depthlink_cli::{Camera, CommonArgs, parse_u16};
use tracing::info;

/// Read or write firmware parameters.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
    /// Parameter to read, decimal or 0x-prefixed; repeatable
    #[arg(short, long, value_parser = parse_u16)]
    get: Vec<u16>,
    /// Parameter to write as ID=VALUE; repeatable, applied in order before reads
    #[arg(short, long, value_parser = parse_assignment)]
    set: Vec<(u16, u16)>,
    /// Send all writes in a single command
    #[arg(long)]
    batch: bool,
}

fn parse_assignment(value: &str) -> Result<(u16, u16), String> {
    let (param, v) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=VALUE, got {value:?}"))?;
    Ok((parse_u16(param.trim())?, parse_u16(v.trim())?))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = args.common.setup_logging()?;
    if args.get.is_empty() && args.set.is_empty() {
        bail!("nothing to do, pass --get and/or --set");
    }

    let config = args.common.load_config()?;
    let camera = Camera::open(&config)?;

    if args.batch && !args.set.is_empty() {
        camera.commands.set_multiple_params(&args.set)?;
        info!(count = args.set.len(), "Parameters written");
    } else {
        for &(param, value) in &args.set {
            camera.commands.set_param(param, value)?;
            println!("{param:#06x} <- {value} ({value:#06x})");
        }
    }

    for &param in &args.get {
        let value = camera.commands.get_param(param)?;
        println!("{param:#06x} = {value} ({value:#06x})");
    }

    Ok(())
}
