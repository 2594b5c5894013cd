//! nusb backed transport: vendor control transfers carry commands, bulk
//! endpoints carry streams.

use crate::config::DeviceConfig;
use crate::constants::CONTROL_REQUEST;
use crate::error::ProtocolError;
use crate::transport::{ChunkCallback, RawTransport, StreamHandle, StreamTransport};
use nusb::Interface;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, RequestBuffer, TransferError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Bulk reads kept in flight per streaming endpoint
const STREAM_BUFFERS: usize = 8;

/// How often a stream reader checks whether it was stopped
const STREAM_POLL: Duration = Duration::from_millis(100);

pub struct UsbTransport {
    interface: Interface,
    runtime: Runtime,
    request: u8,
}

fn current_thread_runtime() -> Result<Runtime, ProtocolError> {
    Ok(Builder::new_current_thread().enable_time().build()?)
}

fn transfer_error(e: TransferError) -> ProtocolError {
    match e {
        TransferError::Stall => ProtocolError::TransportStall,
        TransferError::Disconnected => ProtocolError::Disconnected,
        other => ProtocolError::Transfer(other),
    }
}

impl UsbTransport {
    /// Find the first device with the given ids and claim interface 0.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self, ProtocolError> {
        info!("Searching for depth camera {:04x}:{:04x}...", vendor_id, product_id);
        let device_info = nusb::list_devices()
            .map_err(ProtocolError::Usb)?
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or(ProtocolError::DeviceNotFound)?;

        info!(
            "Found device on bus {} addr {}",
            device_info.bus_number(),
            device_info.device_address()
        );

        let device = device_info.open().map_err(ProtocolError::Usb)?;
        let interface = device.detach_and_claim_interface(0).map_err(ProtocolError::Usb)?;
        info!("Interface claimed successfully.");

        Ok(Self {
            interface,
            runtime: current_thread_runtime()?,
            request: CONTROL_REQUEST,
        })
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, ProtocolError> {
        let mut transport = Self::open(config.vendor_id, config.product_id)?;
        transport.request = config.control_request;
        Ok(transport)
    }

    /// Bulk side of the same interface, usable after the transport moved
    /// into a [`CommandTransport`](crate::command::CommandTransport).
    pub fn streams(&self) -> UsbStreams {
        UsbStreams {
            interface: self.interface.clone(),
        }
    }
}

/// Starts reader threads on the bulk endpoints of a claimed interface.
#[derive(Clone)]
pub struct UsbStreams {
    interface: Interface,
}

impl RawTransport for UsbTransport {
    fn send(&mut self, bytes: &[u8], limit: Duration) -> Result<(), ProtocolError> {
        let transfer = self.interface.control_out(ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: self.request,
            value: 0,
            index: 0,
            data: bytes,
        });
        let completion = self
            .runtime
            .block_on(timeout(limit, transfer))
            .map_err(|_| ProtocolError::TransportTimeout)?;
        completion.into_result().map_err(transfer_error)?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], limit: Duration) -> Result<usize, ProtocolError> {
        let transfer = self.interface.control_in(ControlIn {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: self.request,
            value: 0,
            index: 0,
            length: u16::try_from(buf.len()).unwrap_or(u16::MAX),
        });
        let completion = self
            .runtime
            .block_on(timeout(limit, transfer))
            .map_err(|_| ProtocolError::TransportTimeout)?;
        let data = completion.into_result().map_err(transfer_error)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

impl StreamTransport for UsbStreams {
    fn start_stream(
        &self,
        endpoint: u8,
        chunk_size: usize,
        mut on_chunk: ChunkCallback,
    ) -> Result<StreamHandle, ProtocolError> {
        let interface = self.interface.clone();
        let runtime = current_thread_runtime()?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = std::thread::Builder::new()
            .name(format!("depthlink-ep{endpoint:02x}"))
            .spawn(move || {
                let mut queue = interface.bulk_in_queue(endpoint);
                while queue.pending() < STREAM_BUFFERS {
                    queue.submit(RequestBuffer::new(chunk_size));
                }
                debug!(endpoint = format!("{endpoint:#04x}"), chunk_size, "Stream reader started");

                while flag.load(Ordering::Acquire) {
                    let Ok(completion) = runtime.block_on(timeout(STREAM_POLL, queue.next_complete())) else {
                        continue;
                    };
                    match completion.status {
                        Ok(()) => on_chunk(&completion.data),
                        Err(TransferError::Disconnected) => {
                            warn!(endpoint = format!("{endpoint:#04x}"), "Device disconnected, stream reader exiting");
                            flag.store(false, Ordering::Release);
                            break;
                        }
                        Err(e) => warn!(endpoint = format!("{endpoint:#04x}"), error = %e, "Bulk read failed"),
                    }
                    queue.submit(RequestBuffer::reuse(completion.data, chunk_size));
                }
                queue.cancel_all();
            })?;

        Ok(StreamHandle::new(endpoint, running, thread))
    }
}
