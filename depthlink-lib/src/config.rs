use crate::command::RetryPolicy;
use crate::constants::{CONTROL_REQUEST, DEFAULT_DEVICE_FREQUENCY, PRIMESENSE_VID, PS1080_PID};
use crate::error::ProtocolError;
use crate::shift_to_depth::ShiftToDepthConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Connection settings. Loaded from JSON; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bRequest of the vendor control transfers carrying commands
    pub control_request: u8,
    /// Wait between raw send retries, in ms
    pub send_backoff_ms: u64,
    /// Wait before re-sending after a NotReady reply, in ms
    pub not_ready_backoff_ms: u64,
    /// How long bad-magic replies are skipped, in ms
    pub bad_magic_window_ms: u64,
    /// Device clock, in ticks per microsecond
    pub device_frequency: f64,
    /// Largest accepted forward jump of a stream timestamp, in ms
    pub timestamp_tolerance_ms: u64,
    /// Stamp frames with host time instead of device ticks
    pub host_timestamps: bool,
    pub shift_to_depth: ShiftToDepthConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            vendor_id: PRIMESENSE_VID,
            product_id: PS1080_PID,
            control_request: CONTROL_REQUEST,
            send_backoff_ms: policy.send_backoff.as_millis() as u64,
            not_ready_backoff_ms: policy.not_ready_backoff.as_millis() as u64,
            bad_magic_window_ms: policy.bad_magic_window.as_millis() as u64,
            device_frequency: DEFAULT_DEVICE_FREQUENCY,
            timestamp_tolerance_ms: 10_000,
            host_timestamps: false,
            shift_to_depth: ShiftToDepthConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading device config");
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(self.device_frequency.is_finite() && self.device_frequency > 0.0) {
            return Err(ProtocolError::Config(format!(
                "device frequency must be positive, got {}",
                self.device_frequency
            )));
        }
        Ok(())
    }

    pub fn with_device(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }

    pub fn with_device_frequency(mut self, ticks_per_us: f64) -> Self {
        self.device_frequency = ticks_per_us;
        self
    }

    pub fn with_timestamp_tolerance(mut self, tolerance: Duration) -> Self {
        self.timestamp_tolerance_ms = tolerance.as_millis() as u64;
        self
    }

    pub fn with_host_timestamps(mut self, enabled: bool) -> Self {
        self.host_timestamps = enabled;
        self
    }

    pub fn with_shift_to_depth(mut self, calibration: ShiftToDepthConfig) -> Self {
        self.shift_to_depth = calibration;
        self
    }

    pub fn timestamp_tolerance(&self) -> Duration {
        Duration::from_millis(self.timestamp_tolerance_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            send_backoff: Duration::from_millis(self.send_backoff_ms),
            not_ready_backoff: Duration::from_millis(self.not_ready_backoff_ms),
            bad_magic_window: Duration::from_millis(self.bad_magic_window_ms),
            ..RetryPolicy::default()
        }
    }
}
