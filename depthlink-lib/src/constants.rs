// Protocol constants for PS1080-class depth cameras

/// Host to device magic, protocol V25 ("PS")
pub const HOST_MAGIC_V25: u16 = 0x5053;

/// Device to host magic, protocol V25 ("SP")
pub const DEVICE_MAGIC_V25: u16 = 0x5350;

/// Host to device magic, protocol V26 ("MG")
pub const HOST_MAGIC_V26: u16 = 0x4d47;

/// Device to host magic, protocol V26 ("BR")
pub const DEVICE_MAGIC_V26: u16 = 0x4252;

/// Size of the V25 command header (magic, size, opcode, id, crc16)
pub const COMMAND_HEADER_V25_SIZE: usize = 10;

/// Size of the V26 command header (magic, size, opcode, id)
pub const COMMAND_HEADER_V26_SIZE: usize = 8;

/// Size of the reply header that follows the command header (error code)
pub const REPLY_HEADER_SIZE: usize = 2;

/// Max control packet size before firmware 5.0
pub const MAX_PACKET_SIZE_V0_17: usize = 64;

/// Max control packet size from firmware 5.0
pub const MAX_PACKET_SIZE_V5_0: usize = 512;

/// Fixed parameters block size on firmware 0.17 (38 dwords)
pub const FIXED_PARAMS_SIZE_V0_17: usize = 152;

/// Fixed parameters block size from firmware 1.1 (39 dwords)
pub const FIXED_PARAMS_SIZE_V1_1: usize = 156;

/// Fixed parameters block size from firmware 3.0 (42 dwords)
pub const FIXED_PARAMS_SIZE_V3_0: usize = 168;

/// Upper bound for any chunked parameter read
pub const MAX_PARAMS_READ_SIZE: usize = 2048;

/// Raw send attempts on timeout or stall
pub const SEND_RETRIES: u32 = 5;

/// Command attempts while the device answers NotReady
pub const NOT_READY_RETRIES: u32 = 3;

/// Set-param attempts on failures other than rejection
pub const SET_PARAM_RETRIES: u32 = 5;

/// Size of the streaming mini-packet header
pub const STREAM_HEADER_SIZE: usize = 12;

/// Highest raw shift the depth sensor produces plus one
pub const MAX_SHIFT_VALUE: usize = 2048;

/// No-data sample in shift-to-shift output
pub const NO_DEPTH_SHIFT: u16 = 2047;

/// No-data sample in depth output
pub const NO_DEPTH_VALUE: u16 = 0;

/// Max depth in 1 mm units
pub const MAX_DEPTH_1_MM: u32 = 10000;

/// Max depth in 100 um units
pub const MAX_DEPTH_100_UM: u32 = 65534;

/// Default device clock, in ticks per microsecond
pub const DEFAULT_DEVICE_FREQUENCY: f64 = 60.0;

/// Control transfer request number used for commands
pub const CONTROL_REQUEST: u8 = 0;

/// PrimeSense vendor id
pub const PRIMESENSE_VID: u16 = 0x1d27;

/// PS1080 based sensor product id
pub const PS1080_PID: u16 = 0x0600;

// Firmware parameter ids used by the set/get parameter commands
pub const PARAM_STREAM0_MODE: u16 = 5;
pub const PARAM_STREAM1_MODE: u16 = 6;
pub const PARAM_STREAM2_MODE: u16 = 7;
pub const PARAM_IMAGE_FLICKER_DETECTION: u16 = 0x11;
pub const PARAM_DEPTH_FORMAT: u16 = 0x12;
pub const PARAM_DEPTH_AGC_BIN0_LOW: u16 = 0x54;
pub const PARAM_DEPTH_AGC_BIN_COUNT: u16 = 4;
