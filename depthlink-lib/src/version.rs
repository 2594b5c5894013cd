use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Firmware version triple, ordered major, then minor, then build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, build: u16) -> Self {
        Self { major, minor, build }
    }

    /// The oldest protocol generation, used to talk to a device before its
    /// version is known.
    pub const BASELINE: FirmwareVersion = FirmwareVersion::new(0, 17, 0);
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

impl FromStr for FirmwareVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let missing = |name: &str| ProtocolError::Config(format!("version '{s}' is missing the {name} part"));
        let major = parts.next().ok_or_else(|| missing("major"))?;
        let minor = parts.next().ok_or_else(|| missing("minor"))?;
        let build = parts.next().unwrap_or("0");
        let parse_err = |_| ProtocolError::Config(format!("invalid version '{s}'"));
        Ok(Self {
            major: major.parse().map_err(parse_err)?,
            minor: minor.parse().map_err(parse_err)?,
            build: build.parse().map_err(parse_err)?,
        })
    }
}

/// Raw GetVersion reply block.
///
/// The first two bytes arrive swapped: minor before major.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RawVersionReply {
    pub minor: u8,
    pub major: u8,
    pub build: U16,
    pub chip: U32,
    pub fpga: U16,
    pub system_version: U16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceVersions {
    pub firmware: FirmwareVersion,
    pub chip: u32,
    pub fpga: u16,
    pub system_version: u16,
}

impl TryFrom<&[u8]> for DeviceVersions {
    type Error = ProtocolError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let (raw, _) = RawVersionReply::read_from_prefix(bytes).map_err(|_| ProtocolError::InsufficientData {
            expected: size_of::<RawVersionReply>(),
            actual: bytes.len(),
        })?;

        let mut build = raw.build.get();
        // From 5.0 the build number is reported as hex digits meant to be read as decimal
        if raw.major >= 5 {
            build = format!("{build:x}").parse().unwrap_or(build);
        }

        Ok(Self {
            firmware: FirmwareVersion::new(raw.major, raw.minor, build),
            chip: raw.chip.get(),
            fpga: raw.fpga.get(),
            system_version: raw.system_version.get(),
        })
    }
}
