use crate::constants::{PARAM_STREAM0_MODE, PARAM_STREAM1_MODE};
use crate::error::ProtocolError;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamKind {
    Depth,
    Image,
    Ir,
}

impl StreamKind {
    /// Firmware parameter selecting what the stream's channel carries.
    pub fn mode_param(self) -> u16 {
        match self {
            StreamKind::Image => PARAM_STREAM0_MODE,
            StreamKind::Depth | StreamKind::Ir => PARAM_STREAM1_MODE,
        }
    }

    pub fn firmware_mode(self) -> FirmwareStreamMode {
        match self {
            StreamKind::Depth => FirmwareStreamMode::Depth,
            StreamKind::Image => FirmwareStreamMode::Color,
            StreamKind::Ir => FirmwareStreamMode::Ir,
        }
    }

    /// Bulk endpoint that carries this stream.
    pub fn endpoint(self) -> u8 {
        match self {
            StreamKind::Depth | StreamKind::Ir => 0x81,
            StreamKind::Image => 0x82,
        }
    }
}

/// Values of the stream mode parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum FirmwareStreamMode {
    Off = 0,
    Color = 1,
    Depth = 2,
    Ir = 3,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// Encoding of the bytes arriving on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputFormat {
    /// 16-bit little-endian shifts
    Uncompressed16,
    /// 11-bit MSB-first packed shifts
    Packed11,
    /// 12-bit MSB-first packed shifts
    Packed12,
    /// Nibble-coded differential shifts
    PsCompressed,
    /// 10-bit MSB-first packed IR
    Packed10,
    /// Image bytes copied as-is
    PassThrough,
}

impl InputFormat {
    /// Firmware value of the depth format parameter.
    pub fn depth_format_value(self) -> Option<u16> {
        match self {
            InputFormat::Uncompressed16 => Some(0),
            InputFormat::PsCompressed => Some(1),
            InputFormat::Packed10 => Some(2),
            InputFormat::Packed11 => Some(3),
            InputFormat::Packed12 => Some(4),
            InputFormat::PassThrough => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Raw shift values, no-data is 2047
    Shift,
    #[serde(rename = "depth-1mm")]
    Depth1Mm,
    #[serde(rename = "depth-100um")]
    Depth100Um,
    /// Bytes or samples exactly as decoded
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropWindow {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub kind: StreamKind,
    pub input: InputFormat,
    pub output: OutputMode,
    pub width: u16,
    pub height: u16,
    #[serde(default)]
    pub crop: Option<CropWindow>,
    /// Stamp frames with host time instead of device ticks
    #[serde(default)]
    pub host_timestamps: bool,
    /// Bytes per output pixel; 2 for depth and IR, set for image formats
    #[serde(default = "default_bytes_per_pixel")]
    pub bytes_per_pixel: u8,
}

fn default_bytes_per_pixel() -> u8 {
    2
}

impl StreamConfig {
    pub fn depth(width: u16, height: u16, input: InputFormat, output: OutputMode) -> Self {
        Self {
            kind: StreamKind::Depth,
            input,
            output,
            width,
            height,
            crop: None,
            host_timestamps: false,
            bytes_per_pixel: 2,
        }
    }

    pub fn ir(width: u16, height: u16) -> Self {
        Self {
            kind: StreamKind::Ir,
            input: InputFormat::Packed10,
            output: OutputMode::Raw,
            width,
            height,
            crop: None,
            host_timestamps: false,
            bytes_per_pixel: 2,
        }
    }

    pub fn image(width: u16, height: u16, bytes_per_pixel: u8) -> Self {
        Self {
            kind: StreamKind::Image,
            input: InputFormat::PassThrough,
            output: OutputMode::Raw,
            width,
            height,
            crop: None,
            host_timestamps: false,
            bytes_per_pixel,
        }
    }

    pub fn with_crop(mut self, crop: CropWindow) -> Self {
        self.crop = Some(crop);
        self
    }

    pub fn with_host_timestamps(mut self, enabled: bool) -> Self {
        self.host_timestamps = enabled;
        self
    }

    /// Pixels in a complete frame: the crop window when cropping.
    pub fn pixel_count(&self) -> usize {
        match self.crop {
            Some(crop) => usize::from(crop.width) * usize::from(crop.height),
            None => usize::from(self.width) * usize::from(self.height),
        }
    }

    /// Bytes in a complete frame.
    pub fn expected_frame_size(&self) -> usize {
        self.pixel_count() * usize::from(self.bytes_per_pixel)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.width == 0 || self.height == 0 || self.bytes_per_pixel == 0 {
            return Err(ProtocolError::Config(format!(
                "{} stream needs a non-zero resolution",
                self.kind
            )));
        }
        if let Some(crop) = self.crop {
            if u32::from(crop.x) + u32::from(crop.width) > u32::from(self.width)
                || u32::from(crop.y) + u32::from(crop.height) > u32::from(self.height)
            {
                return Err(ProtocolError::Config(format!(
                    "crop window {}x{}+{}+{} exceeds {}x{}",
                    crop.width, crop.height, crop.x, crop.y, self.width, self.height
                )));
            }
        }
        let depth_output = matches!(
            self.output,
            OutputMode::Shift | OutputMode::Depth1Mm | OutputMode::Depth100Um
        );
        match self.kind {
            StreamKind::Depth if !depth_output => Err(ProtocolError::Config(
                "depth streams need a shift or depth output".to_string(),
            )),
            StreamKind::Depth if matches!(self.input, InputFormat::Packed10 | InputFormat::PassThrough) => Err(
                ProtocolError::Config(format!("{} is not a depth input format", self.input)),
            ),
            StreamKind::Image | StreamKind::Ir if depth_output => Err(ProtocolError::Config(format!(
                "{} streams have raw output only",
                self.kind
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_drives_expected_size() {
        let config = StreamConfig::depth(640, 480, InputFormat::Packed11, OutputMode::Depth1Mm);
        assert_eq!(config.expected_frame_size(), 640 * 480 * 2);
        let cropped = config.with_crop(CropWindow {
            x: 10,
            y: 20,
            width: 100,
            height: 50,
        });
        assert_eq!(cropped.expected_frame_size(), 100 * 50 * 2);
        assert!(cropped.validate().is_ok());
    }

    #[test]
    fn rejects_mismatched_kind_and_output() {
        let mut config = StreamConfig::ir(640, 480);
        config.output = OutputMode::Depth1Mm;
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_from_json() {
        let config: StreamConfig = serde_json::from_str(
            r#"{"kind":"depth","input":"packed12","output":"depth-1mm","width":320,"height":240}"#,
        )
        .unwrap();
        assert_eq!(config.input, InputFormat::Packed12);
        assert_eq!(config.output, OutputMode::Depth1Mm);
        assert_eq!(config.bytes_per_pixel, 2);
        assert!(config.crop.is_none());
    }
}
