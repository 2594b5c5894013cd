use anyhow::Result;
use clap::Parser;
use depthlink_cli::{CommonArgs, parse_serde_name};
use depthlink_lib::shift_to_depth::ShiftToDepthTable;
use depthlink_lib::stream::OutputMode;
use std::io::{BufWriter, Write};
use tracing::info;

/// Print the shift to depth table built from the config's calibration block.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
    /// shift, depth-1mm or depth-100um
    #[arg(short, long, default_value = "depth-1mm", value_parser = parse_serde_name::<OutputMode>)]
    output: OutputMode,
    /// Print the inverse depth to shift table instead
    #[arg(long)]
    inverse: bool,
    /// Emit a JSON array instead of CSV lines
    #[arg(long)]
    json: bool,
    /// Skip entries that map to no-data
    #[arg(long)]
    valid_only: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = args.common.setup_logging()?;
    let config = args.common.load_config()?;

    let table = ShiftToDepthTable::for_output(args.output, &config.shift_to_depth)?;
    let (values, header) = if args.inverse {
        (table.depth_to_shift(), "depth,shift")
    } else {
        (table.shift_to_depth(), "shift,depth")
    };
    info!(output = %args.output, entries = values.len(), "Table built");

    let mut out = BufWriter::new(std::io::stdout().lock());
    if args.json {
        serde_json::to_writer(&mut out, values)?;
        writeln!(out)?;
    } else {
        writeln!(out, "{header}")?;
        for (index, &value) in values.iter().enumerate() {
            if args.valid_only && !args.inverse && value == table.no_data() {
                continue;
            }
            writeln!(out, "{index},{value}")?;
        }
    }
    out.flush()?;
    Ok(())
}
