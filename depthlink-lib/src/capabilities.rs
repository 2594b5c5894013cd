use crate::constants::*;
use crate::version::FirmwareVersion;
use std::time::Duration;
use strum_macros::Display;
use tracing::warn;

/// Logical command opcodes. The wire value of each one depends on the
/// firmware generation and is looked up in [`ProtocolCapabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Opcode {
    GetVersion,
    KeepAlive,
    GetParam,
    SetParam,
    GetFixedParams,
    GetMode,
    SetMode,
    GetLog,
    Reset,
    GetCmosRegister,
    SetCmosRegister,
    WriteI2c,
    ReadI2c,
    ReadAhb,
    WriteAhb,
    AlgorithmParams,
    ReadFlash,
    Bist,
    SetGmcParams,
    GetCpuStats,
    CalibrateTec,
    GetTecData,
    CalibrateEmitter,
    GetEmitterData,
    CalibrateProjectorFault,
    SetCmosBlanking,
    GetCmosBlanking,
    GetCmosPresets,
    GetSerialNumber,
    GetFastConvergenceTec,
    GetPlatformString,
    GetUsbCoreType,
    SetLedState,
    EnableEmitter,
}

impl Opcode {
    pub const ALL: [Opcode; 34] = [
        Opcode::GetVersion,
        Opcode::KeepAlive,
        Opcode::GetParam,
        Opcode::SetParam,
        Opcode::GetFixedParams,
        Opcode::GetMode,
        Opcode::SetMode,
        Opcode::GetLog,
        Opcode::Reset,
        Opcode::GetCmosRegister,
        Opcode::SetCmosRegister,
        Opcode::WriteI2c,
        Opcode::ReadI2c,
        Opcode::ReadAhb,
        Opcode::WriteAhb,
        Opcode::AlgorithmParams,
        Opcode::ReadFlash,
        Opcode::Bist,
        Opcode::SetGmcParams,
        Opcode::GetCpuStats,
        Opcode::CalibrateTec,
        Opcode::GetTecData,
        Opcode::CalibrateEmitter,
        Opcode::GetEmitterData,
        Opcode::CalibrateProjectorFault,
        Opcode::SetCmosBlanking,
        Opcode::GetCmosBlanking,
        Opcode::GetCmosPresets,
        Opcode::GetSerialNumber,
        Opcode::GetFastConvergenceTec,
        Opcode::GetPlatformString,
        Opcode::GetUsbCoreType,
        Opcode::SetLedState,
        Opcode::EnableEmitter,
    ];

    pub const COUNT: usize = Self::ALL.len();

    fn index(self) -> usize {
        self as usize
    }

    /// Time the device may take to answer this command.
    fn response_timeout(self) -> Duration {
        match self {
            Opcode::Bist => Duration::from_secs(300),
            Opcode::ReadFlash | Opcode::GetLog => Duration::from_secs(180),
            Opcode::GetEmitterData | Opcode::CalibrateEmitter => Duration::from_secs(60),
            _ => Duration::from_millis(5000),
        }
    }
}

/// Command header layout on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum HeaderLayout {
    /// magic, size, opcode, id, crc16 (10 bytes)
    V25,
    /// magic, size, opcode, id (8 bytes)
    V26,
}

impl HeaderLayout {
    pub fn size(self) -> usize {
        match self {
            HeaderLayout::V25 => COMMAND_HEADER_V25_SIZE,
            HeaderLayout::V26 => COMMAND_HEADER_V26_SIZE,
        }
    }
}

/// Waits the device needs around USB traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDelays {
    /// Sleep between empty polls of the control pipe
    pub receive_poll: Duration,
    pub pre_send: Duration,
    pub post_send: Duration,
    pub soft_reset: Duration,
}

/// Settling time after changing specific firmware parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetParamDelays {
    pub flicker: Duration,
    pub stream0_mode: Duration,
    pub stream1_mode: Duration,
    pub stream2_mode: Duration,
}

/// Everything the host needs to know about one firmware generation.
///
/// Built once by [`capabilities_for`] and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCapabilities {
    pub version: FirmwareVersion,
    pub header: HeaderLayout,
    pub host_magic: u16,
    pub device_magic: u16,
    pub max_packet_size: usize,
    /// Size in bytes of the block returned by chunked GetFixedParams reads
    pub fixed_params_size: usize,
    opcodes: [Option<u16>; Opcode::COUNT],
    timeouts: [Duration; Opcode::COUNT],
    pub usb_delays: UsbDelays,
    pub set_param_delays: SetParamDelays,
    /// SOF packets carry leading/trailing padding counts in their timestamp
    pub sof_padding: bool,
    /// The first bulk chunk of a stream after arming is stale and must be skipped
    pub ignore_first_chunk: bool,
    pub has_filesystem_lock: bool,
}

impl ProtocolCapabilities {
    /// Wire opcode for `opcode`, or `None` when this firmware does not know it.
    pub fn opcode(&self, opcode: Opcode) -> Option<u16> {
        self.opcodes[opcode.index()]
    }

    pub fn supports(&self, opcode: Opcode) -> bool {
        self.opcode(opcode).is_some()
    }

    pub fn response_timeout(&self, opcode: Opcode) -> Duration {
        self.timeouts[opcode.index()]
    }

    /// Pre-receive wait for a SetParam exchange touching `param`.
    pub fn set_param_delay(&self, param: u16) -> Duration {
        match param {
            PARAM_IMAGE_FLICKER_DETECTION => self.set_param_delays.flicker,
            PARAM_STREAM0_MODE => self.set_param_delays.stream0_mode,
            PARAM_STREAM1_MODE => self.set_param_delays.stream1_mode,
            PARAM_STREAM2_MODE => self.set_param_delays.stream2_mode,
            _ => Duration::ZERO,
        }
    }

    fn baseline() -> Self {
        Self {
            version: FirmwareVersion::BASELINE,
            header: HeaderLayout::V25,
            host_magic: HOST_MAGIC_V25,
            device_magic: DEVICE_MAGIC_V25,
            max_packet_size: MAX_PACKET_SIZE_V0_17,
            fixed_params_size: FIXED_PARAMS_SIZE_V0_17,
            opcodes: [None; Opcode::COUNT],
            timeouts: Opcode::ALL.map(Opcode::response_timeout),
            usb_delays: UsbDelays {
                receive_poll: Duration::from_millis(100),
                pre_send: Duration::from_millis(1),
                post_send: Duration::from_millis(10),
                soft_reset: Duration::from_millis(800),
            },
            set_param_delays: SetParamDelays {
                flicker: Duration::from_millis(3000),
                stream0_mode: Duration::from_millis(1),
                stream1_mode: Duration::from_millis(300),
                stream2_mode: Duration::from_millis(1),
            },
            sof_padding: false,
            ignore_first_chunk: true,
            has_filesystem_lock: false,
        }
    }
}

/// One entry of the version threshold table.
enum Change {
    Opcodes(&'static [(Opcode, Option<u16>)]),
    Header(HeaderLayout, u16, u16),
    MaxPacketSize(usize),
    FixedParamsSize(usize),
    UsbDelays(UsbDelays),
    SetParamDelays(SetParamDelays),
    FlickerDelay(Duration),
    SofPadding,
    KeepFirstChunk,
    FilesystemLock,
}

impl Change {
    fn apply(&self, caps: &mut ProtocolCapabilities) {
        match self {
            Change::Opcodes(table) => {
                for &(opcode, wire) in table.iter() {
                    caps.opcodes[opcode.index()] = wire;
                }
            }
            Change::Header(layout, host, device) => {
                caps.header = *layout;
                caps.host_magic = *host;
                caps.device_magic = *device;
            }
            Change::MaxPacketSize(size) => caps.max_packet_size = *size,
            Change::FixedParamsSize(size) => caps.fixed_params_size = *size,
            Change::UsbDelays(delays) => caps.usb_delays = *delays,
            Change::SetParamDelays(delays) => caps.set_param_delays = *delays,
            Change::FlickerDelay(delay) => caps.set_param_delays.flicker = *delay,
            Change::SofPadding => caps.sof_padding = true,
            Change::KeepFirstChunk => caps.ignore_first_chunk = false,
            Change::FilesystemLock => caps.has_filesystem_lock = true,
        }
    }
}

struct Threshold {
    since: FirmwareVersion,
    /// Exclusive upper bound
    until: Option<FirmwareVersion>,
    change: Change,
}

impl Threshold {
    fn covers(&self, version: FirmwareVersion) -> bool {
        version >= self.since && self.until.is_none_or(|until| version < until)
    }
}

const fn v(major: u8, minor: u8, build: u16) -> FirmwareVersion {
    FirmwareVersion::new(major, minor, build)
}

const fn at(since: FirmwareVersion, change: Change) -> Threshold {
    Threshold { since, until: None, change }
}

const fn between(since: FirmwareVersion, until: FirmwareVersion, change: Change) -> Threshold {
    Threshold { since, until: Some(until), change }
}

use Opcode as Op;

const V0_17_OPCODES: &[(Opcode, Option<u16>)] = &[
    (Op::GetVersion, Some(0)),
    (Op::KeepAlive, Some(1)),
    (Op::GetParam, Some(2)),
    (Op::SetParam, Some(3)),
    (Op::GetFixedParams, Some(4)),
    (Op::Reset, Some(5)),
    (Op::GetLog, Some(6)),
    (Op::GetCmosRegister, Some(7)),
    (Op::SetCmosRegister, Some(8)),
    (Op::ReadAhb, Some(19)),
    (Op::WriteAhb, Some(20)),
    (Op::AlgorithmParams, Some(21)),
    (Op::GetUsbCoreType, Some(40)),
];

const V1_1_OPCODES: &[(Opcode, Option<u16>)] = &[
    (Op::GetMode, Some(5)),
    (Op::SetMode, Some(6)),
    (Op::GetLog, Some(7)),
    (Op::GetCmosRegister, Some(8)),
    (Op::SetCmosRegister, Some(9)),
    (Op::ReadAhb, Some(20)),
    (Op::WriteAhb, Some(21)),
    (Op::AlgorithmParams, Some(22)),
    (Op::Reset, None),
];

const V3_0_OPCODES: &[(Opcode, Option<u16>)] = &[
    (Op::GetCmosRegister, None),
    (Op::SetCmosRegister, None),
    (Op::WriteI2c, Some(10)),
    (Op::ReadI2c, Some(11)),
    (Op::ReadFlash, Some(25)),
    (Op::Bist, Some(26)),
    (Op::GetCpuStats, Some(27)),
];

const V4_0_OPCODES: &[(Opcode, Option<u16>)] = &[(Op::Bist, Some(28)), (Op::SetGmcParams, Some(26))];

const V5_0_OPCODES: &[(Opcode, Option<u16>)] = &[
    (Op::CalibrateTec, Some(29)),
    (Op::GetTecData, Some(30)),
    (Op::CalibrateEmitter, Some(31)),
    (Op::GetEmitterData, Some(32)),
    (Op::CalibrateProjectorFault, Some(33)),
    (Op::SetCmosBlanking, Some(34)),
];

const FAST_DELAYS: UsbDelays = UsbDelays {
    receive_poll: Duration::from_millis(1),
    pre_send: Duration::ZERO,
    post_send: Duration::ZERO,
    soft_reset: Duration::from_millis(1),
};

const FAST_SET_PARAM_DELAYS: SetParamDelays = SetParamDelays {
    flicker: Duration::from_millis(1),
    stream0_mode: Duration::from_millis(1),
    stream1_mode: Duration::from_millis(1),
    stream2_mode: Duration::from_millis(1),
};

/// Ordered so that later rows override earlier ones.
const THRESHOLDS: &[Threshold] = &[
    at(v(0, 17, 0), Change::Opcodes(V0_17_OPCODES)),
    at(v(1, 1, 0), Change::Opcodes(V1_1_OPCODES)),
    at(v(1, 1, 0), Change::FixedParamsSize(FIXED_PARAMS_SIZE_V1_1)),
    at(v(1, 2, 0), Change::Header(HeaderLayout::V26, HOST_MAGIC_V26, DEVICE_MAGIC_V26)),
    at(v(3, 0, 0), Change::Opcodes(V3_0_OPCODES)),
    at(v(3, 0, 0), Change::FixedParamsSize(FIXED_PARAMS_SIZE_V3_0)),
    at(v(4, 0, 0), Change::Opcodes(V4_0_OPCODES)),
    at(v(5, 0, 0), Change::MaxPacketSize(MAX_PACKET_SIZE_V5_0)),
    at(v(5, 0, 0), Change::Opcodes(V5_0_OPCODES)),
    at(v(5, 0, 0), Change::KeepFirstChunk),
    at(v(5, 1, 0), Change::Opcodes(&[(Op::GetCmosBlanking, Some(35))])),
    at(v(5, 1, 0), Change::SofPadding),
    between(v(5, 3, 15), v(5, 3, 16), Change::FlickerDelay(Duration::from_millis(300))),
    at(v(5, 3, 16), Change::UsbDelays(FAST_DELAYS)),
    at(v(5, 3, 16), Change::SetParamDelays(FAST_SET_PARAM_DELAYS)),
    at(v(5, 3, 29), Change::Opcodes(&[(Op::GetCmosPresets, Some(36))])),
    between(v(5, 3, 31), v(5, 4, 0), Change::FilesystemLock),
    at(v(5, 4, 0), Change::Opcodes(&[(Op::GetSerialNumber, Some(37)), (Op::GetFastConvergenceTec, Some(38))])),
    at(v(5, 7, 0), Change::Opcodes(&[(Op::GetPlatformString, Some(39))])),
    at(v(5, 8, 0), Change::Opcodes(&[(Op::SetLedState, Some(41))])),
    at(v(5, 8, 2), Change::FilesystemLock),
    at(v(5, 8, 15), Change::Opcodes(&[(Op::EnableEmitter, Some(42))])),
];

/// Newest firmware line whose protocol is known.
const NEWEST_KNOWN: FirmwareVersion = v(5, 9, u16::MAX);

/// Select the capability set for a firmware version.
pub fn capabilities_for(version: FirmwareVersion) -> ProtocolCapabilities {
    let effective = if version > NEWEST_KNOWN {
        warn!(%version, "Firmware is newer than any known protocol, using 5.9");
        NEWEST_KNOWN
    } else {
        version
    };

    let mut caps = ProtocolCapabilities::baseline();
    for threshold in THRESHOLDS.iter().filter(|t| t.covers(effective)) {
        threshold.change.apply(&mut caps);
    }
    caps.version = version;
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_uses_legacy_header() {
        let caps = capabilities_for(FirmwareVersion::BASELINE);
        assert_eq!(caps.header, HeaderLayout::V25);
        assert_eq!(caps.host_magic, HOST_MAGIC_V25);
        assert_eq!(caps.max_packet_size, 64);
        assert_eq!(caps.opcode(Opcode::Reset), Some(5));
        assert_eq!(caps.opcode(Opcode::SetMode), None);
        assert!(caps.ignore_first_chunk);
    }

    #[test]
    fn fixed_params_block_grows_with_firmware() {
        assert_eq!(capabilities_for(v(0, 17, 0)).fixed_params_size, 152);
        assert_eq!(capabilities_for(v(1, 1, 0)).fixed_params_size, 156);
        assert_eq!(capabilities_for(v(2, 9, 9)).fixed_params_size, 156);
        assert_eq!(capabilities_for(v(3, 0, 0)).fixed_params_size, 168);
        assert_eq!(capabilities_for(v(5, 8, 22)).fixed_params_size, 168);
    }

    #[test]
    fn exact_match_threshold_only_hits_one_build() {
        let at = capabilities_for(v(5, 3, 15));
        let before = capabilities_for(v(5, 3, 14));
        let after = capabilities_for(v(5, 3, 16));
        assert_eq!(at.set_param_delays.flicker, Duration::from_millis(300));
        assert_eq!(before.set_param_delays.flicker, Duration::from_millis(3000));
        assert_eq!(after.set_param_delays.flicker, Duration::from_millis(1));
    }

    #[test]
    fn filesystem_lock_has_a_gap() {
        assert!(!capabilities_for(v(5, 3, 30)).has_filesystem_lock);
        assert!(capabilities_for(v(5, 3, 31)).has_filesystem_lock);
        assert!(!capabilities_for(v(5, 4, 0)).has_filesystem_lock);
        assert!(!capabilities_for(v(5, 8, 1)).has_filesystem_lock);
        assert!(capabilities_for(v(5, 8, 2)).has_filesystem_lock);
    }

    #[test]
    fn unknown_future_firmware_behaves_like_5_9() {
        let future = capabilities_for(v(6, 0, 0));
        let known = capabilities_for(v(5, 9, 0));
        assert_eq!(future.opcode(Opcode::EnableEmitter), known.opcode(Opcode::EnableEmitter));
        assert_eq!(future.version, v(6, 0, 0));
    }

    #[test]
    fn opcode_table_index_matches_discriminant() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op.index(), i, "{op} is out of place in Opcode::ALL");
        }
    }
}
