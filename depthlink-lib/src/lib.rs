pub mod capabilities;
pub mod clock;
pub mod codec;
pub mod command;
pub mod config;
pub mod constants;
pub mod dump;
pub mod error;
pub mod frame;
pub mod header;
pub mod observer;
pub mod reassembler;
pub mod shift_to_depth;
pub mod stream;
pub mod transport;
pub mod usb;
pub mod version;

// Re-export the types most callers need
pub use capabilities::{Opcode, ProtocolCapabilities, capabilities_for};
pub use clock::{ClockContext, SharedClock, StreamClock};
pub use command::CommandTransport;
pub use config::DeviceConfig;
pub use error::ProtocolError;
pub use reassembler::{EndpointReassembler, FrameProcessor};
pub use usb::{UsbStreams, UsbTransport};
pub use version::FirmwareVersion;
