use crate::capabilities::{HeaderLayout, ProtocolCapabilities};
use crate::error::ProtocolError;
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use zerocopy::byteorder::big_endian::U16 as BeU16;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CommandHeaderV25 {
    pub magic: U16,
    /// Payload length in 16-bit words
    pub size: U16,
    pub opcode: U16,
    pub id: U16,
    pub crc16: U16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CommandHeaderV26 {
    pub magic: U16,
    /// Payload length in 16-bit words
    pub size: U16,
    pub opcode: U16,
    pub id: U16,
}

/// Header fields shared by both layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub magic: u16,
    pub size_words: u16,
    pub opcode: u16,
    pub id: u16,
}

impl CommandHeader {
    /// Serialise for the given layout. The V25 checksum is always sent as zero.
    pub fn encode(&self, layout: HeaderLayout) -> Vec<u8> {
        match layout {
            HeaderLayout::V25 => CommandHeaderV25 {
                magic: U16::new(self.magic),
                size: U16::new(self.size_words),
                opcode: U16::new(self.opcode),
                id: U16::new(self.id),
                crc16: U16::new(0),
            }
            .as_bytes()
            .to_vec(),
            HeaderLayout::V26 => CommandHeaderV26 {
                magic: U16::new(self.magic),
                size: U16::new(self.size_words),
                opcode: U16::new(self.opcode),
                id: U16::new(self.id),
            }
            .as_bytes()
            .to_vec(),
        }
    }

    pub fn decode(bytes: &[u8], layout: HeaderLayout) -> Result<Self, ProtocolError> {
        let short = || ProtocolError::InsufficientData {
            expected: layout.size(),
            actual: bytes.len(),
        };
        match layout {
            HeaderLayout::V25 => {
                let (raw, _) = CommandHeaderV25::ref_from_prefix(bytes).map_err(|_| short())?;
                Ok(Self {
                    magic: raw.magic.get(),
                    size_words: raw.size.get(),
                    opcode: raw.opcode.get(),
                    id: raw.id.get(),
                })
            }
            HeaderLayout::V26 => {
                let (raw, _) = CommandHeaderV26::ref_from_prefix(bytes).map_err(|_| short())?;
                Ok(Self {
                    magic: raw.magic.get(),
                    size_words: raw.size.get(),
                    opcode: raw.opcode.get(),
                    id: raw.id.get(),
                })
            }
        }
    }
}

/// Build a full request frame: header followed by the payload.
pub fn frame_request(caps: &ProtocolCapabilities, opcode: u16, id: u16, payload: &[u8]) -> Vec<u8> {
    let header = CommandHeader {
        magic: caps.host_magic,
        size_words: (payload.len() / 2) as u16,
        opcode,
        id,
    };
    let mut frame = header.encode(caps.header);
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum StreamPacketType {
    DepthStart = 0x7100,
    DepthBody = 0x7200,
    DepthEnd = 0x7500,
    ImageStart = 0x8100,
    ImageBody = 0x8200,
    ImageEnd = 0x8500,
    Audio = 0x9200,
    Gmc = 0xa200,
    GmcDebug = 0xb100,
    WavelengthCorrection = 0xb200,
    TecDebug = 0xb300,
    AhbDebug = 0xb400,
    GmcDebugEnd = 0xb500,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// Position of a packet inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePart {
    Start,
    Body,
    End,
}

impl StreamPacketType {
    pub fn depth_part(self) -> Option<FramePart> {
        match self {
            StreamPacketType::DepthStart => Some(FramePart::Start),
            StreamPacketType::DepthBody => Some(FramePart::Body),
            StreamPacketType::DepthEnd => Some(FramePart::End),
            _ => None,
        }
    }

    pub fn image_part(self) -> Option<FramePart> {
        match self {
            StreamPacketType::ImageStart => Some(FramePart::Start),
            StreamPacketType::ImageBody => Some(FramePart::Body),
            StreamPacketType::ImageEnd => Some(FramePart::End),
            _ => None,
        }
    }
}

/// 12-byte header of a streaming mini-packet.
///
/// `buf_size` is big-endian on the wire and counts the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct StreamPacketHeader {
    pub magic: U16,
    pub packet_type: U16,
    pub packet_id: U16,
    pub buf_size: BeU16,
    pub timestamp: U32,
}

impl StreamPacketHeader {
    pub fn new(magic: u16, packet_type: StreamPacketType, packet_id: u16, data_size: usize, timestamp: u32) -> Self {
        Self {
            magic: U16::new(magic),
            packet_type: U16::new(packet_type.into()),
            packet_id: U16::new(packet_id),
            buf_size: BeU16::new((data_size + size_of::<Self>()) as u16),
            timestamp: U32::new(timestamp),
        }
    }

    pub fn kind(&self) -> StreamPacketType {
        StreamPacketType::from_primitive(self.packet_type.get())
    }

    /// Number of payload bytes following the header.
    pub fn data_size(&self) -> usize {
        usize::from(self.buf_size.get()).saturating_sub(size_of::<Self>())
    }

    pub fn padding(&self) -> FramePadding {
        FramePadding::from_bytes(self.timestamp.get().to_le_bytes())
    }
}

/// Overload of the SOF timestamp field: padding sample counts.
#[bitfield(bytes = 4)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramePadding {
    pub trailing: B16,
    pub leading: B16,
}
