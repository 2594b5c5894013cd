//! Shared plumbing of the command line tools: logging, config loading and
//! connecting to the camera.

use anyhow::{Context, Result};
use clap::Args;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use depthlink_lib::capabilities::ProtocolCapabilities;
use depthlink_lib::clock::{SharedClock, StreamClock};
use depthlink_lib::codec::SampleMap;
use depthlink_lib::command::CommandTransport;
use depthlink_lib::config::DeviceConfig;
use depthlink_lib::dump::{DumpSink, FileDump, NullDump};
use depthlink_lib::frame::{FrameReader, triple_buffer};
use depthlink_lib::reassembler::FrameProcessor;
use depthlink_lib::stream::{InputFormat, OutputMode, StreamConfig, StreamKind};
use depthlink_lib::usb::{UsbStreams, UsbTransport};
use depthlink_lib::version::DeviceVersions;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Options every tool accepts.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// JSON device config; defaults apply when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl CommonArgs {
    /// Install the tracing subscriber. Keep the guard alive until exit.
    pub fn setup_logging(&self) -> Result<Option<WorkerGuard>> {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time();

        let (file_layer, guard) = match &self.log_file {
            Some(path) => {
                let log_file =
                    File::create(path).with_context(|| format!("Failed to create log file at: {path:?}"))?;
                let (writer, guard) = tracing_appender::non_blocking(log_file);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        // RUST_LOG wins over -v/-q
        let filter = EnvFilter::builder()
            .with_default_directive(self.verbose.tracing_level_filter().into())
            .from_env_lossy();

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        if let Some(path) = &self.log_file {
            info!("Logging to file: {:?}", path);
        }
        Ok(guard)
    }

    pub fn load_config(&self) -> Result<DeviceConfig> {
        match &self.config {
            Some(path) => DeviceConfig::from_json_file(path).with_context(|| format!("Failed to load config {path:?}")),
            None => Ok(DeviceConfig::default()),
        }
    }
}

/// Which stream to assemble and how its bytes are encoded.
#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    /// depth, ir or image
    #[arg(short, long, default_value = "depth", value_parser = parse_serde_name::<StreamKind>)]
    pub kind: StreamKind,
    /// Depth input encoding: uncompressed16, packed11, packed12 or ps-compressed
    #[arg(long, default_value = "packed11", value_parser = parse_serde_name::<InputFormat>)]
    pub input: InputFormat,
    /// Depth output: shift, depth-1mm or depth-100um
    #[arg(long, default_value = "depth-1mm", value_parser = parse_serde_name::<OutputMode>)]
    pub output: OutputMode,
    #[arg(long, default_value_t = 640)]
    pub width: u16,
    #[arg(long, default_value_t = 480)]
    pub height: u16,
    /// Bytes per pixel of image streams
    #[arg(long, default_value_t = 2)]
    pub bytes_per_pixel: u8,
    /// Stamp frames with host time instead of device ticks
    #[arg(long)]
    pub host_timestamps: bool,
}

impl StreamArgs {
    pub fn stream_config(&self, config: &DeviceConfig) -> StreamConfig {
        let stream = match self.kind {
            StreamKind::Depth => StreamConfig::depth(self.width, self.height, self.input, self.output),
            StreamKind::Ir => StreamConfig::ir(self.width, self.height),
            StreamKind::Image => StreamConfig::image(self.width, self.height, self.bytes_per_pixel),
        };
        stream.with_host_timestamps(self.host_timestamps || config.host_timestamps)
    }

    /// Processor for this stream, publishing into a triple buffer.
    pub fn processor(
        &self,
        config: &DeviceConfig,
        caps: &ProtocolCapabilities,
        clock: SharedClock,
        dump: Arc<dyn DumpSink>,
    ) -> Result<(FrameProcessor, FrameReader)> {
        let stream = self.stream_config(config);
        let map = SampleMap::for_stream(&stream, &config.shift_to_depth)?;
        let (writer, reader) = triple_buffer(stream.expected_frame_size());
        let clock = StreamClock::new(clock, self.kind.to_string(), config.timestamp_tolerance());
        let processor = FrameProcessor::new(stream, caps, map, Box::new(writer), clock)?.with_dump(dump);
        Ok((processor, reader))
    }
}

/// Dump sink writing CSV files into `dir`, or discarding everything.
pub fn dump_sink(dir: Option<&Path>) -> Result<Arc<dyn DumpSink>> {
    Ok(match dir {
        Some(dir) => Arc::new(FileDump::create(dir, "depthlink-")?),
        None => Arc::new(NullDump),
    })
}

/// An open camera: the command channel plus its bulk endpoints.
pub struct Camera {
    pub commands: CommandTransport<UsbTransport>,
    pub streams: UsbStreams,
    pub versions: DeviceVersions,
}

impl Camera {
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let usb = UsbTransport::from_config(config).context("Failed to open camera")?;
        let streams = usb.streams();
        let (commands, versions) =
            CommandTransport::connect(usb, config.retry_policy()).context("Failed to query firmware version")?;
        Ok(Self {
            commands,
            streams,
            versions,
        })
    }
}

/// Parse a command line value through its serde name, e.g. `packed11`.
pub fn parse_serde_name<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(|e| e.to_string())
}

/// Parse a number given in decimal or with a `0x` prefix.
pub fn parse_u16(value: &str) -> Result<u16, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("{value:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_names() {
        assert_eq!(parse_serde_name::<InputFormat>("packed11"), Ok(InputFormat::Packed11));
        assert_eq!(parse_serde_name::<OutputMode>("depth-100um"), Ok(OutputMode::Depth100Um));
        assert!(parse_serde_name::<OutputMode>("meters").is_err());
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_u16("0x12"), Ok(0x12));
        assert_eq!(parse_u16("18"), Ok(18));
        assert!(parse_u16("0xfffff").is_err());
    }
}
