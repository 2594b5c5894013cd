//! Frame buffers and the triple-buffered hand-off to consumers.

use crate::error::{CorruptionReason, ProtocolError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Fixed-capacity byte buffer a frame is decoded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Samples written so far, read back as little-endian u16.
    pub fn samples(&self) -> impl Iterator<Item = u16> + '_ {
        self.data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]))
    }

    pub fn ensure_space(&self, needed: usize) -> Result<(), ProtocolError> {
        if needed > self.remaining() {
            return Err(ProtocolError::OutputBufferOverflow {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.ensure_space(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn push_samples(&mut self, samples: &[u16]) -> Result<(), ProtocolError> {
        self.ensure_space(samples.len() * 2)?;
        for &s in samples {
            self.data.extend_from_slice(&s.to_le_bytes());
        }
        Ok(())
    }

    /// Append `count` copies of `value`.
    pub fn pad_samples(&mut self, count: usize, value: u16) -> Result<(), ProtocolError> {
        self.ensure_space(count * 2)?;
        let bytes = value.to_le_bytes();
        for _ in 0..count {
            self.data.extend_from_slice(&bytes);
        }
        Ok(())
    }
}

/// A completed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub timestamp_us: u64,
    /// First reason the frame is known to be damaged, if any
    pub corruption: Option<CorruptionReason>,
    pub data: FrameBuffer,
}

impl Frame {
    fn empty(capacity: usize) -> Self {
        Self {
            id: 0,
            timestamp_us: 0,
            corruption: None,
            data: FrameBuffer::with_capacity(capacity),
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.corruption.is_some()
    }

    /// For consumers that want to reject damaged frames.
    pub fn check(&self) -> Result<(), ProtocolError> {
        match self.corruption {
            Some(reason) => Err(ProtocolError::FrameCorrupted(reason)),
            None => Ok(()),
        }
    }
}

/// Where the reassembler writes frames.
pub trait FrameSink: Send {
    /// Buffer of the frame currently being assembled.
    fn write_buffer(&mut self) -> &mut FrameBuffer;

    /// Publish the write buffer and start a fresh one. Returns the frame id.
    fn commit(&mut self, timestamp_us: u64, corruption: Option<CorruptionReason>) -> u32;

    fn last_committed_id(&self) -> u32;
}

struct Shared {
    ready: Frame,
    fresh: bool,
    last_id: u32,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer half of a triple buffer.
pub struct FrameWriter {
    write: Frame,
    shared: Arc<Mutex<Shared>>,
    last_id: u32,
}

/// Consumer half of a triple buffer.
pub struct FrameReader {
    read: Frame,
    shared: Arc<Mutex<Shared>>,
}

/// Three frame slots: the writer fills one privately, a commit swaps it into
/// the ready slot, the reader swaps the ready slot out. A slow reader only
/// misses frames; the writer never waits on it.
pub fn triple_buffer(capacity: usize) -> (FrameWriter, FrameReader) {
    let shared = Arc::new(Mutex::new(Shared {
        ready: Frame::empty(capacity),
        fresh: false,
        last_id: 0,
    }));
    (
        FrameWriter {
            write: Frame::empty(capacity),
            shared: shared.clone(),
            last_id: 0,
        },
        FrameReader {
            read: Frame::empty(capacity),
            shared,
        },
    )
}

impl FrameSink for FrameWriter {
    fn write_buffer(&mut self) -> &mut FrameBuffer {
        &mut self.write.data
    }

    fn commit(&mut self, timestamp_us: u64, corruption: Option<CorruptionReason>) -> u32 {
        self.last_id = self.last_id.wrapping_add(1);
        self.write.id = self.last_id;
        self.write.timestamp_us = timestamp_us;
        self.write.corruption = corruption;
        {
            let mut shared = lock(&self.shared);
            std::mem::swap(&mut self.write, &mut shared.ready);
            shared.fresh = true;
            shared.last_id = self.last_id;
        }
        self.write.data.clear();
        self.write.corruption = None;
        self.last_id
    }

    fn last_committed_id(&self) -> u32 {
        self.last_id
    }
}

impl FrameReader {
    /// The newest frame committed since the last call, if any.
    pub fn latest(&mut self) -> Option<&Frame> {
        let mut shared = lock(&self.shared);
        if !shared.fresh {
            return None;
        }
        std::mem::swap(&mut self.read, &mut shared.ready);
        shared.fresh = false;
        drop(shared);
        Some(&self.read)
    }

    pub fn last_committed_id(&self) -> u32 {
        lock(&self.shared).last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_sees_only_whole_frames() {
        let (mut writer, mut reader) = triple_buffer(8);
        writer.write_buffer().push_samples(&[1, 2]).unwrap();
        assert!(reader.latest().is_none());

        let id = writer.commit(42, None);
        writer.write_buffer().push_samples(&[9]).unwrap();

        let frame = reader.latest().unwrap();
        assert_eq!(frame.id, id);
        assert_eq!(frame.timestamp_us, 42);
        assert_eq!(frame.data.samples().collect::<Vec<_>>(), vec![1, 2]);
        assert!(reader.latest().is_none());
    }

    #[test]
    fn newest_frame_overwrites_unread_one() {
        let (mut writer, mut reader) = triple_buffer(4);
        writer.write_buffer().push_samples(&[1]).unwrap();
        writer.commit(1, None);
        writer.write_buffer().push_samples(&[2]).unwrap();
        writer.commit(2, Some(CorruptionReason::PacketLost));

        let frame = reader.latest().unwrap();
        assert_eq!(frame.id, 2);
        assert!(frame.is_corrupted());
        assert!(matches!(
            frame.check(),
            Err(ProtocolError::FrameCorrupted(CorruptionReason::PacketLost))
        ));
        assert_eq!(reader.last_committed_id(), 2);
    }

    #[test]
    fn overflow_is_reported() {
        let mut buffer = FrameBuffer::with_capacity(4);
        buffer.pad_samples(2, 0).unwrap();
        let err = buffer.push_bytes(&[1]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::OutputBufferOverflow { needed: 1, available: 0 }
        ));
    }
}
