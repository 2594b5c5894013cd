//! Diagnostic mirrors of packet arrival and timestamp conversion.
//!
//! Dumps are fire-and-forget: write failures are dropped and never reach the
//! protocol code.

use crate::error::ProtocolError;
use std::io::Write;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Arrival of one streaming mini-packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    pub host_us: u64,
    pub packet_type: u16,
    pub packet_id: u16,
    pub size: usize,
    pub timestamp: u32,
}

/// One device tick to host time conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampRecord<'a> {
    pub host_us: u64,
    pub stream: &'a str,
    pub device_tick: u32,
    pub result_us: u64,
    pub comment: &'a str,
}

pub trait DumpSink: Send + Sync {
    fn packet(&self, record: &PacketRecord);

    fn timestamp(&self, record: &TimestampRecord<'_>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDump;

impl DumpSink for NullDump {
    fn packet(&self, _record: &PacketRecord) {}

    fn timestamp(&self, _record: &TimestampRecord<'_>) {}
}

/// CSV dump files written from a background worker.
pub struct FileDump {
    packets: NonBlocking,
    timestamps: NonBlocking,
    _guards: [WorkerGuard; 2],
}

impl FileDump {
    /// Create `<dir>/<prefix>packets.csv` and `<dir>/<prefix>timestamps.csv`.
    pub fn create(dir: impl AsRef<Path>, prefix: &str) -> Result<Self, ProtocolError> {
        let open = |name: &str| -> Result<(NonBlocking, WorkerGuard), ProtocolError> {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(format!("{prefix}{name}"))
                .build(dir.as_ref())
                .map_err(|e| ProtocolError::Config(format!("cannot open dump file: {e}")))?;
            Ok(tracing_appender::non_blocking(appender))
        };
        let (mut packets, packets_guard) = open("packets.csv")?;
        let (mut timestamps, timestamps_guard) = open("timestamps.csv")?;
        let _ = packets.write_all(b"host_us,type,packet_id,size,timestamp\n");
        let _ = timestamps.write_all(b"host_us,stream,device_tick,result_us,comment\n");
        Ok(Self {
            packets,
            timestamps,
            _guards: [packets_guard, timestamps_guard],
        })
    }
}

impl DumpSink for FileDump {
    fn packet(&self, r: &PacketRecord) {
        let line = format!(
            "{},{:#06x},{},{},{}\n",
            r.host_us, r.packet_type, r.packet_id, r.size, r.timestamp
        );
        let _ = self.packets.clone().write_all(line.as_bytes());
    }

    fn timestamp(&self, r: &TimestampRecord<'_>) {
        let line = format!(
            "{},{},{},{},{}\n",
            r.host_us, r.stream, r.device_tick, r.result_us, r.comment
        );
        let _ = self.timestamps.clone().write_all(line.as_bytes());
    }
}
