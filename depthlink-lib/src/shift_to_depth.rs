use crate::constants::{MAX_DEPTH_100_UM, NO_DEPTH_SHIFT, NO_DEPTH_VALUE};
use crate::error::ProtocolError;
use crate::stream::OutputMode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Const shift value flagging a projector mounted right of the CMOS sensor.
const PROJECTOR_RIGHT_OF_CMOS: u32 = 201;
const PROJECTOR_RIGHT_SHIFT_ORIGIN: i32 = 1603;

/// Optics calibration used to derive the shift to depth tables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftToDepthConfig {
    /// Distance to the reference plane, in mm
    pub zero_plane_distance: u16,
    /// Pixel size at the reference plane, in mm
    pub zero_plane_pixel_size: f64,
    /// Emitter to CMOS baseline, in cm
    pub emitter_dcmos_distance: f64,
    pub device_max_shift: u32,
    pub device_max_depth: u32,
    pub const_shift: u32,
    pub pixel_size_factor: u32,
    pub param_coeff: u32,
    pub shift_scale: u32,
    pub min_depth_cutoff: u32,
    pub max_depth_cutoff: u32,
}

impl Default for ShiftToDepthConfig {
    fn default() -> Self {
        Self {
            zero_plane_distance: 120,
            zero_plane_pixel_size: 0.1042,
            emitter_dcmos_distance: 7.5,
            device_max_shift: 2047,
            device_max_depth: 10000,
            const_shift: 200,
            pixel_size_factor: 1,
            param_coeff: 4,
            shift_scale: 10,
            min_depth_cutoff: 0,
            max_depth_cutoff: 10000,
        }
    }
}

impl ShiftToDepthConfig {
    /// Adjust units for the requested output. 100 µm output scales depth by 10.
    pub fn for_output(mut self, mode: OutputMode) -> Self {
        if mode == OutputMode::Depth100Um {
            self.shift_scale *= 10;
            self.device_max_depth = MAX_DEPTH_100_UM;
            self.max_depth_cutoff = (self.max_depth_cutoff * 10).min(MAX_DEPTH_100_UM);
            self.min_depth_cutoff *= 10;
        }
        self
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.pixel_size_factor == 0 || self.param_coeff == 0 {
            return Err(ProtocolError::Config(
                "pixel size factor and parameter coefficient must be non-zero".to_string(),
            ));
        }
        if self.device_max_shift == 0
            || self.device_max_shift > u32::from(u16::MAX)
            || self.device_max_depth > u32::from(u16::MAX)
        {
            return Err(ProtocolError::Config(format!(
                "invalid table bounds: max shift {}, max depth {}",
                self.device_max_shift, self.device_max_depth
            )));
        }
        Ok(())
    }
}

/// Shift to depth lookup plus its inverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftToDepthTable {
    shift_to_depth: Vec<u16>,
    depth_to_shift: Vec<u16>,
    no_data: u16,
}

impl ShiftToDepthTable {
    /// Build the tables from optics calibration.
    ///
    /// Shifts whose depth falls outside the cut-offs stay at zero; gaps in the
    /// inverse table repeat the last valid shift.
    pub fn build(config: &ShiftToDepthConfig) -> Result<Self, ProtocolError> {
        config.validate()?;

        let shifts = config.device_max_shift as usize + 1;
        let depths = config.device_max_depth as usize + 1;
        let mut shift_to_depth = vec![0u16; shifts];
        let mut depth_to_shift = vec![0u16; depths];

        let right_of_cmos = config.const_shift == PROJECTOR_RIGHT_OF_CMOS;
        let const_shift = if right_of_cmos {
            config.param_coeff * (config.const_shift - 1) / config.pixel_size_factor
        } else {
            config.param_coeff * config.const_shift / config.pixel_size_factor
        };

        let pixel_size = config.zero_plane_pixel_size * f64::from(config.pixel_size_factor);
        let dsr = f64::from(config.zero_plane_distance);
        let dcl = config.emitter_dcmos_distance;
        let max_depth = config.device_max_depth.min(config.max_depth_cutoff);

        let mut last_depth = 0usize;
        let mut last_index = 0u16;
        for index in 1..config.device_max_shift {
            let mut shift = index as i32;
            if right_of_cmos {
                shift = PROJECTOR_RIGHT_SHIFT_ORIGIN - shift;
            }
            let ref_x = f64::from(shift - const_shift as i32) / f64::from(config.param_coeff) - 0.375;
            let metric = ref_x * pixel_size;
            let depth = f64::from(config.shift_scale) * ((metric * dsr / (dcl - metric)) + dsr);

            if depth > f64::from(config.min_depth_cutoff) && depth < f64::from(max_depth) {
                shift_to_depth[index as usize] = depth as u16;
                let end = (depth.ceil() as usize).min(depths);
                if last_depth < end {
                    depth_to_shift[last_depth..end].fill(last_index);
                }
                last_index = index as u16;
                last_depth = depth as usize;
            }
        }
        if last_depth < depths {
            depth_to_shift[last_depth..].fill(last_index);
        }

        debug!(shifts, depths, last_index, last_depth, "Shift to depth table built");
        Ok(Self {
            shift_to_depth,
            depth_to_shift,
            no_data: NO_DEPTH_VALUE,
        })
    }

    /// Identity table for raw shift output; no-data is the max shift.
    pub fn identity(max_shift: usize) -> Self {
        Self {
            shift_to_depth: (0..max_shift).map(|s| s as u16).collect(),
            depth_to_shift: Vec::new(),
            no_data: NO_DEPTH_SHIFT,
        }
    }

    /// Table matching an output mode.
    pub fn for_output(mode: OutputMode, config: &ShiftToDepthConfig) -> Result<Self, ProtocolError> {
        match mode {
            OutputMode::Shift => Ok(Self::identity(crate::constants::MAX_SHIFT_VALUE)),
            OutputMode::Depth1Mm | OutputMode::Depth100Um => Self::build(&config.for_output(mode)),
            OutputMode::Raw => Err(ProtocolError::Config("raw output has no depth table".to_string())),
        }
    }

    #[inline]
    pub fn lookup(&self, shift: u16) -> u16 {
        self.shift_to_depth
            .get(usize::from(shift))
            .copied()
            .unwrap_or(self.no_data)
    }

    /// Shift producing `depth`, or `None` past the table end.
    pub fn shift_for_depth(&self, depth: u16) -> Option<u16> {
        self.depth_to_shift.get(usize::from(depth)).copied()
    }

    pub fn no_data(&self) -> u16 {
        self.no_data
    }

    pub fn shift_count(&self) -> usize {
        self.shift_to_depth.len()
    }

    pub fn shift_to_depth(&self) -> &[u16] {
        &self.shift_to_depth
    }

    pub fn depth_to_shift(&self) -> &[u16] {
        &self.depth_to_shift
    }
}
