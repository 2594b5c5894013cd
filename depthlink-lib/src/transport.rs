use crate::error::ProtocolError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// Blocking byte channel to the device's control pipe.
///
/// `TransportTimeout` and `TransportStall` are retryable; `Ok(0)` from
/// `receive` means the device had nothing to say yet.
pub trait RawTransport: Send {
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ProtocolError>;

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError>;
}

impl<T: RawTransport + ?Sized> RawTransport for Box<T> {
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        (**self).send(bytes, timeout)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        (**self).receive(buf, timeout)
    }
}

/// Called from the reader context with every chunk read from a streaming endpoint.
pub type ChunkCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Source of streaming data. Each started stream gets its own reader context.
pub trait StreamTransport {
    fn start_stream(&self, endpoint: u8, chunk_size: usize, on_chunk: ChunkCallback)
    -> Result<StreamHandle, ProtocolError>;
}

/// Owns the reader thread of one streaming endpoint.
pub struct StreamHandle {
    endpoint: u8,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn new(endpoint: u8, running: Arc<AtomicBool>, thread: JoinHandle<()>) -> Self {
        Self {
            endpoint,
            running,
            thread: Some(thread),
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the reader to exit and wait for it. Safe to call more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!(endpoint = format!("{:#04x}", self.endpoint), "Stream reader stopped");
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
