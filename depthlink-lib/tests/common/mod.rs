//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use depthlink_lib::capabilities::{HeaderLayout, Opcode, ProtocolCapabilities, capabilities_for};
#[allow(unused_imports)]
pub use depthlink_lib::constants::{DEVICE_MAGIC_V25, DEVICE_MAGIC_V26, HOST_MAGIC_V25};
#[allow(unused_imports)]
pub use depthlink_lib::clock::{ClockContext, HostClock, ManualClock, SharedClock, StreamClock};
#[allow(unused_imports)]
pub use depthlink_lib::command::{CommandTransport, RetryPolicy};
#[allow(unused_imports)]
pub use depthlink_lib::error::{CorruptionReason, MismatchKind, NackCode, ProtocolError};
#[allow(unused_imports)]
pub use depthlink_lib::header::{CommandHeader, StreamPacketHeader, StreamPacketType};
#[allow(unused_imports)]
pub use depthlink_lib::transport::RawTransport;
#[allow(unused_imports)]
pub use depthlink_lib::version::FirmwareVersion;
#[allow(unused_imports)]
pub use hex;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zerocopy::IntoBytes;

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Route library logs to the test harness; set RUST_LOG to see them.
#[allow(dead_code)]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Firmware with the short settle delays, so command tests run fast
#[allow(dead_code)]
pub fn modern_caps() -> ProtocolCapabilities {
    capabilities_for(FirmwareVersion::new(5, 8, 22))
}

#[allow(dead_code)]
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        send_backoff: Duration::from_millis(1),
        not_ready_backoff: Duration::from_millis(1),
        bad_magic_window: Duration::from_millis(200),
        bad_magic_backoff: Duration::from_millis(1),
    }
}

/// A decoded request as the mock device saw it.
#[derive(Debug, Clone)]
pub struct Request {
    pub layout: HeaderLayout,
    pub opcode: u16,
    pub id: u16,
    pub payload: Vec<u8>,
}

#[allow(dead_code)]
impl Request {
    /// Reply to this request with its own opcode and id.
    pub fn reply(&self, status: NackCode, payload: &[u8]) -> Vec<u8> {
        reply_with_id(self.layout, self.opcode, self.id, status, payload)
    }
}

/// Build a reply the way the device frames it: header, status, payload.
#[allow(dead_code)]
pub fn reply_with_id(layout: HeaderLayout, opcode: u16, id: u16, status: NackCode, payload: &[u8]) -> Vec<u8> {
    let magic = match layout {
        HeaderLayout::V25 => DEVICE_MAGIC_V25,
        HeaderLayout::V26 => DEVICE_MAGIC_V26,
    };
    let header = CommandHeader {
        magic,
        size_words: (1 + payload.len() / 2) as u16,
        opcode,
        id,
    };
    let mut bytes = header.encode(layout);
    bytes.extend_from_slice(&u16::from(status).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

type Responder = Box<dyn FnMut(&Request) -> Vec<Vec<u8>> + Send>;

/// Scripted device: every request is answered by the responder, whose
/// packets are then handed out one per receive call. The header layout of
/// each request is told apart by its magic.
pub struct MockTransport {
    responder: Responder,
    queued: VecDeque<Vec<u8>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new(responder: impl FnMut(&Request) -> Vec<Vec<u8>> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            queued: VecDeque::new(),
            sent: Arc::default(),
        }
    }

    /// Device that acknowledges everything with an empty payload.
    pub fn acking() -> Self {
        Self::new(|req| vec![req.reply(NackCode::Ack, &[])])
    }

    /// Everything written to the device so far.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.sent.clone()
    }
}

impl RawTransport for MockTransport {
    fn send(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), ProtocolError> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        let layout = if bytes.starts_with(&HOST_MAGIC_V25.to_le_bytes()) {
            HeaderLayout::V25
        } else {
            HeaderLayout::V26
        };
        let header = CommandHeader::decode(bytes, layout)?;
        let request = Request {
            layout,
            opcode: header.opcode,
            id: header.id,
            payload: bytes[layout.size()..].to_vec(),
        };
        let replies = (self.responder)(&request);
        self.queued.extend(replies);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, ProtocolError> {
        match self.queued.pop_front() {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Err(ProtocolError::TransportTimeout),
        }
    }
}

/// One streaming mini-packet: header plus data.
#[allow(dead_code)]
pub fn stream_packet(magic: u16, kind: StreamPacketType, id: u16, timestamp: u32, data: &[u8]) -> Vec<u8> {
    let header = StreamPacketHeader::new(magic, kind, id, data.len(), timestamp);
    let mut bytes = header.as_bytes().to_vec();
    bytes.extend_from_slice(data);
    bytes
}

/// Shared clock driven by a manual host clock, 60 ticks per microsecond.
#[allow(dead_code)]
pub fn manual_clock(start_us: u64) -> (Arc<ManualClock>, SharedClock) {
    let host = Arc::new(ManualClock::new(start_us));
    let context = ClockContext::new(host.clone(), 60.0).shared();
    (host, context)
}
