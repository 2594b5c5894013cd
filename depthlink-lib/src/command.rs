use crate::capabilities::{HeaderLayout, Opcode, ProtocolCapabilities, capabilities_for};
use crate::constants::*;
use crate::error::{MismatchKind, NackCode, ProtocolError};
use crate::header::{CommandHeader, frame_request};
use crate::transport::RawTransport;
use crate::version::{DeviceVersions, FirmwareVersion};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant};
use strum_macros::Display;
use tracing::{debug, info, trace, warn};

/// Back-off timings of the command retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between raw send attempts after a timeout or stall
    pub send_backoff: Duration,
    /// Wait before re-sending a command the device answered with NotReady
    pub not_ready_backoff: Duration,
    /// How long replies with a bad magic are tolerated
    pub bad_magic_window: Duration,
    /// Wait between reads while skipping bad-magic replies
    pub bad_magic_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            send_backoff: Duration::from_millis(100),
            not_ready_backoff: Duration::from_millis(1000),
            bad_magic_window: Duration::from_secs(20),
            bad_magic_backoff: Duration::from_millis(10),
        }
    }
}

/// Operating modes the firmware can be switched into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum FirmwareMode {
    Webcam = 0,
    PrimeSense = 1,
    Maintenance = 2,
    SoftReset = 3,
    Reboot = 4,
    Suspend = 5,
    Resume = 6,
    Init = 7,
    SystemRestore = 8,
    WaitForEnum = 9,
    SafeMode = 10,

    #[num_enum(catch_all)]
    Unknown(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResetKind {
    Power,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum UsbCoreType {
    Jango = 0,
    GadgetFs = 1,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// Blocks of algorithm parameters the firmware can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum AlgorithmParamsKind {
    DepthInfo = 0,
    Registration = 2,
    Padding = 3,
    Blanking = 6,
    DeviceInfo = 7,
    Frequency = 0x80,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// First part of a reply, parsed out of one raw read.
#[derive(Debug)]
struct ReplyStart {
    status: NackCode,
    total: usize,
    payload: BytesMut,
}

/// Check one raw read against the request it should answer.
///
/// Bytes before the device magic are skipped.
fn parse_reply(
    packet: &[u8],
    caps: &ProtocolCapabilities,
    opcode: u16,
    id: u16,
) -> Result<ReplyStart, ProtocolError> {
    let magic = caps.device_magic.to_le_bytes();
    let start = packet
        .windows(2)
        .position(|w| w == magic)
        .ok_or(ProtocolError::ProtocolMismatch(MismatchKind::BadMagic))?;
    let packet = &packet[start..];

    let header_size = caps.header.size();
    if packet.len() < header_size + REPLY_HEADER_SIZE {
        return Err(ProtocolError::ProtocolMismatch(MismatchKind::BadMagic));
    }
    let header = CommandHeader::decode(packet, caps.header)?;

    if header.id != id {
        return Err(ProtocolError::ProtocolMismatch(MismatchKind::WrongId {
            expected: id,
            actual: header.id,
        }));
    }
    if header.opcode != opcode {
        return Err(ProtocolError::ProtocolMismatch(MismatchKind::WrongOpcode {
            expected: opcode,
            actual: header.opcode,
        }));
    }

    let body = &packet[header_size..];
    let code = u16::from_le_bytes([body[0], body[1]]);
    let mut status = NackCode::from_primitive(code);
    if caps.header == HeaderLayout::V25 {
        status = status.for_legacy_header();
    }

    // size counts 16-bit words after the header, the error code included
    let total = usize::from(header.size_words).saturating_sub(1) * 2;
    let available = &body[REPLY_HEADER_SIZE..];
    let take = available.len().min(total);

    Ok(ReplyStart {
        status,
        total,
        payload: BytesMut::from(&available[..take]),
    })
}

/// The part of the transport that is only touched while holding the lock.
struct Link<T> {
    transport: T,
}

impl<T: RawTransport> Link<T> {
    fn send_raw(&mut self, bytes: &[u8], timeout: Duration, policy: &RetryPolicy) -> Result<(), ProtocolError> {
        let mut attempt = 1;
        loop {
            debug!(bytes = hex::encode(bytes), "USB Write");
            match self.transport.send(bytes, timeout) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < SEND_RETRIES => {
                    warn!(attempt, error = %e, "Send failed, retrying");
                    attempt += 1;
                    sleep(policy.send_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one chunk, polling until data arrives or `timeout` elapses.
    fn receive_raw(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
        caps: &ProtocolCapabilities,
    ) -> Result<usize, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut failures = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.transport.receive(buf, remaining) {
                Ok(0) => {}
                Ok(n) => {
                    debug!(bytes = hex::encode(&buf[..n]), "USB Read");
                    return Ok(n);
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= SEND_RETRIES {
                        return Err(e);
                    }
                    trace!(failures, error = %e, "Receive failed, polling again");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(ProtocolError::TransportTimeout);
            }
            sleep(caps.usb_delays.receive_poll);
        }
    }

    /// Wait for the reply to request `id`, collecting continuation packets.
    fn receive_reply(
        &mut self,
        caps: &ProtocolCapabilities,
        opcode: u16,
        id: u16,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<Bytes, ProtocolError> {
        let started = Instant::now();
        let mut buf = vec![0u8; caps.max_packet_size];

        let mut reply = loop {
            let n = self.receive_raw(&mut buf, timeout, caps)?;
            match parse_reply(&buf[..n], caps, opcode, id) {
                Ok(reply) => break reply,
                Err(ProtocolError::ProtocolMismatch(MismatchKind::BadMagic)) => {
                    if started.elapsed() >= policy.bad_magic_window {
                        return Err(ProtocolError::ProtocolMismatch(MismatchKind::BadMagic));
                    }
                    debug!("Reply without device magic, reading again");
                    sleep(policy.bad_magic_backoff);
                }
                Err(ProtocolError::ProtocolMismatch(kind @ MismatchKind::WrongId { .. })) => {
                    if started.elapsed() >= timeout {
                        return Err(ProtocolError::ProtocolMismatch(kind));
                    }
                    debug!(%kind, "Discarding reply to another request");
                }
                Err(e) => return Err(e),
            }
        };

        match reply.status {
            NackCode::Ack => {}
            NackCode::NotReady => return Err(ProtocolError::DeviceNotReady),
            code => return Err(ProtocolError::DeviceRejected(code)),
        }

        while reply.payload.len() < reply.total {
            let n = self.receive_raw(&mut buf, timeout, caps)?;
            let take = n.min(reply.total - reply.payload.len());
            reply.payload.extend_from_slice(&buf[..take]);
        }

        Ok(reply.payload.freeze())
    }
}

/// Correlated request/response channel to the device's command pipe.
///
/// Exchanges are serialised: one request and its reply hold the lock together.
pub struct CommandTransport<T> {
    link: Mutex<Link<T>>,
    caps: ProtocolCapabilities,
    next_id: AtomicU16,
    policy: RetryPolicy,
}

impl<T: RawTransport> CommandTransport<T> {
    pub fn new(transport: T, caps: ProtocolCapabilities, policy: RetryPolicy) -> Self {
        Self {
            link: Mutex::new(Link { transport }),
            caps,
            next_id: AtomicU16::new(0),
            policy,
        }
    }

    /// Probe the firmware with the oldest protocol and switch to the one it reports.
    pub fn connect(transport: T, policy: RetryPolicy) -> Result<(Self, DeviceVersions), ProtocolError> {
        let mut commands = Self::new(transport, capabilities_for(FirmwareVersion::BASELINE), policy);
        let versions = commands.get_version()?;
        info!(
            firmware = %versions.firmware,
            chip = format!("{:#x}", versions.chip),
            fpga = versions.fpga,
            "Device firmware detected"
        );
        commands.caps = capabilities_for(versions.firmware);
        info!(
            header = %commands.caps.header,
            max_packet = commands.caps.max_packet_size,
            "Protocol selected"
        );
        Ok((commands, versions))
    }

    pub fn capabilities(&self) -> &ProtocolCapabilities {
        &self.caps
    }

    pub fn into_inner(self) -> T {
        self.link.into_inner().unwrap_or_else(PoisonError::into_inner).transport
    }

    fn lock(&self) -> MutexGuard<'_, Link<T>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one command and return its reply payload.
    pub fn execute(&self, opcode: Opcode, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        self.execute_with_delay(opcode, payload, Duration::ZERO)
    }

    /// Like [`execute`](Self::execute), waiting `settle` between send and receive.
    pub fn execute_with_delay(&self, opcode: Opcode, payload: &[u8], settle: Duration) -> Result<Bytes, ProtocolError> {
        let wire = self
            .caps
            .opcode(opcode)
            .ok_or(ProtocolError::UnsupportedOpcode { opcode })?;
        let timeout = self.caps.response_timeout(opcode);
        let id = self.next_id();
        let request = frame_request(&self.caps, wire, id, payload);

        let mut attempt = 1;
        loop {
            let result = self.exchange(&request, wire, id, timeout, settle);
            match result {
                Err(ProtocolError::DeviceNotReady) if attempt < NOT_READY_RETRIES => {
                    warn!(%opcode, id, attempt, "Device not ready, retrying command");
                    attempt += 1;
                    sleep(self.policy.not_ready_backoff);
                }
                Err(ProtocolError::DeviceRejected(code)) => {
                    warn!(%opcode, id, %code, "Device rejected command");
                    return Err(ProtocolError::DeviceRejected(code));
                }
                other => return other,
            }
        }
    }

    fn exchange(
        &self,
        request: &[u8],
        opcode: u16,
        id: u16,
        timeout: Duration,
        settle: Duration,
    ) -> Result<Bytes, ProtocolError> {
        let delays = self.caps.usb_delays;
        let mut link = self.lock();
        sleep(delays.pre_send);
        link.send_raw(request, timeout, &self.policy)?;
        sleep(delays.post_send);
        if !settle.is_zero() {
            sleep(settle);
        }
        link.receive_reply(&self.caps, opcode, id, timeout, &self.policy)
    }

    pub fn get_version(&self) -> Result<DeviceVersions, ProtocolError> {
        let reply = self.execute(Opcode::GetVersion, &[])?;
        DeviceVersions::try_from(&reply[..])
    }

    pub fn keep_alive(&self) -> Result<(), ProtocolError> {
        self.execute(Opcode::KeepAlive, &[]).map(|_| ())
    }

    pub fn get_param(&self, param: u16) -> Result<u16, ProtocolError> {
        let reply = self.execute(Opcode::GetParam, &words(&[param]))?;
        reply_u16(&reply)
    }

    /// Set one firmware parameter, retrying failures the device may recover from.
    pub fn set_param(&self, param: u16, value: u16) -> Result<(), ProtocolError> {
        let payload = words(&[param, value]);
        let settle = self.caps.set_param_delay(param);
        let mut attempt = 1;
        loop {
            match self.execute_with_delay(Opcode::SetParam, &payload, settle) {
                Ok(_) => {
                    debug!(param, value, "Parameter set");
                    return Ok(());
                }
                Err(e) if attempt >= SET_PARAM_RETRIES || !set_param_retryable(&e) => return Err(e),
                Err(e) => {
                    warn!(param, value, attempt, error = %e, "Failed to set parameter, retrying");
                    attempt += 1;
                }
            }
        }
    }

    /// Set several parameters in one command.
    pub fn set_multiple_params(&self, params: &[(u16, u16)]) -> Result<(), ProtocolError> {
        let flat: Vec<u16> = params.iter().flat_map(|&(p, v)| [p, v]).collect();
        let settle = params
            .iter()
            .map(|&(p, _)| self.caps.set_param_delay(p))
            .max()
            .unwrap_or_default();
        self.execute_with_delay(Opcode::SetParam, &words(&flat), settle)
            .map(|_| ())
    }

    pub fn get_mode(&self) -> Result<FirmwareMode, ProtocolError> {
        let reply = self.execute(Opcode::GetMode, &[])?;
        Ok(FirmwareMode::from_primitive(reply_u16(&reply)?))
    }

    /// Switch firmware mode. The device may drop off the bus before it answers,
    /// so reply errors are not reported.
    pub fn set_mode(&self, mode: FirmwareMode) -> Result<(), ProtocolError> {
        match self.execute(Opcode::SetMode, &words(&[mode.into()])) {
            Err(ProtocolError::UnsupportedOpcode { opcode }) => Err(ProtocolError::UnsupportedOpcode { opcode }),
            Err(e) => {
                debug!(%mode, error = %e, "No reply to mode change");
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    pub fn reset(&self, kind: ResetKind) -> Result<(), ProtocolError> {
        info!(%kind, "Resetting device");
        if self.caps.supports(Opcode::Reset) {
            let code: u16 = match kind {
                ResetKind::Power => 0,
                ResetKind::Soft => 1,
            };
            self.execute(Opcode::Reset, &words(&[code]))?;
        } else {
            let mode = match kind {
                ResetKind::Power => FirmwareMode::Reboot,
                ResetKind::Soft => FirmwareMode::SoftReset,
            };
            self.set_mode(mode)?;
        }
        sleep(self.caps.usb_delays.soft_reset);
        Ok(())
    }

    pub fn read_ahb(&self, address: u32) -> Result<u32, ProtocolError> {
        let reply = self.execute(Opcode::ReadAhb, &address.to_le_bytes())?;
        let bytes: [u8; 4] = reply.get(..4).ok_or(insufficient(4, reply.len()))?.try_into()?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_ahb(&self, address: u32, value: u32, mask: u32) -> Result<(), ProtocolError> {
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32_le(address);
        payload.put_u32_le(value);
        payload.put_u32_le(mask);
        self.execute(Opcode::WriteAhb, &payload).map(|_| ())
    }

    pub fn get_cmos_register(&self, cmos: u16, address: u16) -> Result<u16, ProtocolError> {
        let reply = self.execute(Opcode::GetCmosRegister, &words(&[cmos, address]))?;
        reply_u16(&reply)
    }

    pub fn set_cmos_register(&self, cmos: u16, address: u16, value: u16) -> Result<(), ProtocolError> {
        self.execute(Opcode::SetCmosRegister, &words(&[cmos, address, value]))
            .map(|_| ())
    }

    /// Read the fixed parameter block, one reply at a time until the
    /// firmware's block size is reached or the device returns an empty chunk.
    pub fn get_fixed_params(&self) -> Result<Bytes, ProtocolError> {
        self.read_chunked(Opcode::GetFixedParams, self.caps.fixed_params_size, 4, |offset| {
            words(&[offset])
        })
    }

    /// Read one algorithm parameter block of `size` bytes for a stream configuration.
    pub fn algorithm_params(
        &self,
        kind: AlgorithmParamsKind,
        format: u16,
        resolution: u16,
        fps: u16,
        size: usize,
    ) -> Result<Bytes, ProtocolError> {
        self.read_chunked(Opcode::AlgorithmParams, size, 2, |offset| {
            words(&[kind.into(), format, resolution, fps, offset])
        })
    }

    /// Chunked read of at most `size` bytes. Each request carries the offset
    /// of the next chunk in `unit`-byte words.
    fn read_chunked(
        &self,
        opcode: Opcode,
        size: usize,
        unit: usize,
        payload: impl Fn(u16) -> Bytes,
    ) -> Result<Bytes, ProtocolError> {
        if size > MAX_PARAMS_READ_SIZE {
            return Err(ProtocolError::OutputBufferOverflow {
                needed: size,
                available: MAX_PARAMS_READ_SIZE,
            });
        }
        let mut data = BytesMut::with_capacity(size);
        while data.len() < size {
            let offset = u16::try_from(data.len() / unit)
                .map_err(|_| ProtocolError::InvalidPacket(format!("{opcode} offset out of range")))?;
            let chunk = self.execute(opcode, &payload(offset))?;
            if chunk.is_empty() {
                debug!(%opcode, read = data.len(), size, "Device ended chunked read early");
                break;
            }
            data.extend_from_slice(&chunk);
        }
        data.truncate(size);
        Ok(data.freeze())
    }

    pub fn get_cmos_blanking(&self, cmos: u16) -> Result<u16, ProtocolError> {
        let reply = self.execute(Opcode::GetCmosBlanking, &words(&[cmos]))?;
        reply_u16(&reply)
    }

    pub fn set_cmos_blanking(&self, units: u16, cmos: u16, frames: u16) -> Result<(), ProtocolError> {
        self.execute(Opcode::SetCmosBlanking, &words(&[units, cmos, frames]))
            .map(|_| ())
    }

    pub fn get_serial_number(&self) -> Result<String, ProtocolError> {
        let reply = self.execute(Opcode::GetSerialNumber, &[])?;
        let end = reply.iter().position(|&b| b == 0).unwrap_or(reply.len());
        Ok(String::from_utf8_lossy(&reply[..end]).into_owned())
    }

    /// Platform description, empty on firmware that cannot report it.
    pub fn get_platform_string(&self) -> Result<String, ProtocolError> {
        if !self.caps.supports(Opcode::GetPlatformString) {
            return Ok(String::new());
        }
        let reply = self.execute(Opcode::GetPlatformString, &[])?;
        // One character per 16-bit word, low byte first
        let text: Vec<u8> = reply.iter().step_by(2).copied().take_while(|&b| b != 0).collect();
        Ok(String::from_utf8_lossy(&text).into_owned())
    }

    pub fn get_usb_core_type(&self) -> Result<UsbCoreType, ProtocolError> {
        let reply = self.execute(Opcode::GetUsbCoreType, &[])?;
        Ok(UsbCoreType::from_primitive(reply_u16(&reply)?))
    }

    pub fn set_led_state(&self, led: u16, state: u16) -> Result<(), ProtocolError> {
        self.execute(Opcode::SetLedState, &words(&[led, state])).map(|_| ())
    }

    pub fn set_emitter_state(&self, active: bool) -> Result<(), ProtocolError> {
        self.execute(Opcode::EnableEmitter, &words(&[u16::from(active)]))
            .map(|_| ())
    }

    fn agc_bin_params(bin: u16) -> Result<(u16, u16), ProtocolError> {
        if bin >= PARAM_DEPTH_AGC_BIN_COUNT {
            return Err(ProtocolError::Config(format!("AGC bin {bin} out of range")));
        }
        let low = PARAM_DEPTH_AGC_BIN0_LOW + bin * 2;
        Ok((low, low + 1))
    }

    /// Returns the (min, max) shift range of a depth AGC bin.
    pub fn get_depth_agc_bin(&self, bin: u16) -> Result<(u16, u16), ProtocolError> {
        let (low, high) = Self::agc_bin_params(bin)?;
        Ok((self.get_param(low)?, self.get_param(high)?))
    }

    pub fn set_depth_agc_bin(&self, bin: u16, min: u16, max: u16) -> Result<(), ProtocolError> {
        let (low, high) = Self::agc_bin_params(bin)?;
        self.set_param(low, min)?;
        self.set_param(high, max)
    }
}

fn set_param_retryable(e: &ProtocolError) -> bool {
    !matches!(
        e,
        ProtocolError::DeviceRejected(NackCode::BadParams | NackCode::InvalidCommand)
            | ProtocolError::Disconnected
            | ProtocolError::UnsupportedOpcode { .. }
    )
}

fn words(values: &[u16]) -> Bytes {
    let mut payload = BytesMut::with_capacity(values.len() * 2);
    for &v in values {
        payload.put_u16_le(v);
    }
    payload.freeze()
}

fn insufficient(expected: usize, actual: usize) -> ProtocolError {
    ProtocolError::InsufficientData { expected, actual }
}

fn reply_u16(reply: &[u8]) -> Result<u16, ProtocolError> {
    let bytes: [u8; 2] = reply.get(..2).ok_or(insufficient(2, reply.len()))?.try_into()?;
    Ok(u16::from_le_bytes(bytes))
}
