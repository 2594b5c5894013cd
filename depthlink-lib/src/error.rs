use num_enum::{FromPrimitive, IntoPrimitive};
use nusb::transfer::TransferError;
use std::array::TryFromSliceError;
use std::io;
use strum_macros::Display;
use thiserror::Error;

/// Status codes carried in the reply header of every command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum NackCode {
    Ack = 0,
    UnknownError = 1,
    InvalidCommand = 2,
    BadPacketCrc = 3,
    BadPacketSize = 4,
    BadParams = 5,
    I2cTransactionFailed = 6,
    FileNotFound = 7,
    FileCreateFailure = 8,
    FileWriteFailure = 9,
    FileDeleteFailure = 10,
    FileReadFailure = 11,
    BadCommandSize = 12,
    NotReady = 13,
    Overflow = 14,
    OverlayNotLoaded = 15,
    FileSystemLocked = 16,

    #[num_enum(catch_all)]
    Unknown(u16),
}

impl NackCode {
    /// Codes above `FileReadFailure` were introduced together with the V26
    /// header; older firmware reports them as a generic failure.
    pub fn for_legacy_header(self) -> Self {
        let raw: u16 = self.into();
        if raw > u16::from(NackCode::FileReadFailure) {
            NackCode::UnknownError
        } else {
            self
        }
    }
}

/// Reason a command reply was rejected while waiting for a specific response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    BadMagic,
    WrongId { expected: u16, actual: u16 },
    WrongOpcode { expected: u16, actual: u16 },
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MismatchKind::BadMagic => write!(f, "bad magic"),
            MismatchKind::WrongId { expected, actual } => {
                write!(f, "wrong id: expected {expected}, got {actual}")
            }
            MismatchKind::WrongOpcode { expected, actual } => {
                write!(f, "wrong opcode: expected {expected}, got {actual}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionReason {
    PacketLost,
    SizeMismatch { expected: usize, actual: usize },
    StrayContinuation { bytes: usize },
    Overflow,
}

impl std::fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptionReason::PacketLost => write!(f, "packet lost"),
            CorruptionReason::SizeMismatch { expected, actual } => {
                write!(f, "size is {actual} (!= {expected})")
            }
            CorruptionReason::StrayContinuation { bytes } => {
                write!(f, "{bytes} undecoded bytes left at end of frame")
            }
            CorruptionReason::Overflow => write!(f, "write buffer overflow"),
        }
    }
}

/// The primary error type for the `depthlink` library.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("USB device not found. Is the depth camera connected?")]
    DeviceNotFound,

    #[error("Device disconnected")]
    Disconnected,

    /// Opening or claiming the device failed
    #[error("USB error: {0}")]
    Usb(nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport timeout")]
    TransportTimeout,

    #[error("Transport stall")]
    TransportStall,

    #[error("Opcode {opcode:?} is not supported by this firmware")]
    UnsupportedOpcode { opcode: crate::capabilities::Opcode },

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(MismatchKind),

    #[error("Device not ready")]
    DeviceNotReady,

    #[error("Device rejected command: {0}")]
    DeviceRejected(NackCode),

    #[error("Output buffer overflow: need {needed} bytes, {available} available")]
    OutputBufferOverflow { needed: usize, available: usize },

    #[error("Frame corrupted: {0}")]
    FrameCorrupted(CorruptionReason),

    #[error("Device clock lost synchronisation")]
    ClockDesync,

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProtocolError {
    /// Transport-level failures that the raw send/receive loop retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::TransportTimeout | ProtocolError::TransportStall)
    }
}

impl From<TryFromSliceError> for ProtocolError {
    fn from(_: TryFromSliceError) -> Self {
        ProtocolError::InvalidPacket("Failed to convert slice to array".to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Config(e.to_string())
    }
}
