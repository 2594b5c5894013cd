//! Streaming endpoint parsing and frame reconstruction.
//!
//! A bulk endpoint delivers chunks of arbitrary size. [`PacketParser`] finds
//! the 12-byte mini-packet headers in that byte stream and hands out the data
//! of each mini-packet, possibly in several pieces. [`FrameProcessor`] turns
//! mini-packets into frames: it tracks packet ids for loss, handles the start
//! and end of frame markers, runs the stream's codec and commits the result.

use crate::capabilities::ProtocolCapabilities;
use crate::clock::StreamClock;
use crate::codec::{ChunkDecoder, SampleMap, decoder_for};
use crate::constants::STREAM_HEADER_SIZE;
use crate::dump::{DumpSink, NullDump, PacketRecord};
use crate::error::{CorruptionReason, ProtocolError};
use crate::frame::FrameSink;
use crate::header::{FramePart, StreamPacketHeader, StreamPacketType};
use crate::observer::FrameObserver;
use crate::stream::{StreamConfig, StreamKind};
use crate::transport::ChunkCallback;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};
use zerocopy::{FromBytes, FromZeros};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    /// Not armed; every byte is dropped
    AwaitingConfiguration,
    /// Skipping stale bytes left over from before the stream was armed
    IgnoringGarbage { remaining: usize },
    /// Scanning for the header magic. `partial` is set when the previous
    /// chunk ended with the magic's first byte.
    SeekingMagic { partial: bool },
    ReadingHeader { filled: usize },
    ReadingData { offset: usize, remaining: usize },
}

/// Splits an endpoint's byte stream into mini-packets.
pub struct PacketParser {
    magic: [u8; 2],
    state: AssemblyState,
    header_bytes: [u8; STREAM_HEADER_SIZE],
    header: StreamPacketHeader,
}

impl PacketParser {
    pub fn new(magic: u16) -> Self {
        Self {
            magic: magic.to_le_bytes(),
            state: AssemblyState::AwaitingConfiguration,
            header_bytes: [0; STREAM_HEADER_SIZE],
            header: StreamPacketHeader::new_zeroed(),
        }
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    /// Start accepting data, skipping the first `ignore_bytes` bytes.
    pub fn arm(&mut self, ignore_bytes: usize) {
        self.state = if ignore_bytes > 0 {
            AssemblyState::IgnoringGarbage { remaining: ignore_bytes }
        } else {
            AssemblyState::SeekingMagic { partial: false }
        };
    }

    pub fn stop(&mut self) {
        self.state = AssemblyState::AwaitingConfiguration;
    }

    /// Parse one chunk. `on_data` receives the packet header, the offset of
    /// the piece inside the packet's data and the piece itself. Packets
    /// without data are reported once with an empty piece.
    pub fn parse(&mut self, chunk: &[u8], mut on_data: impl FnMut(&StreamPacketHeader, usize, &[u8])) {
        let mut pos = 0;
        while pos < chunk.len() {
            let rest = &chunk[pos..];
            match self.state {
                AssemblyState::AwaitingConfiguration => return,
                AssemblyState::IgnoringGarbage { remaining } => {
                    let skipped = remaining.min(rest.len());
                    pos += skipped;
                    self.state = if skipped == remaining {
                        AssemblyState::SeekingMagic { partial: false }
                    } else {
                        AssemblyState::IgnoringGarbage {
                            remaining: remaining - skipped,
                        }
                    };
                }
                AssemblyState::SeekingMagic { partial } => {
                    if partial && rest[0] == self.magic[1] {
                        pos += 1;
                        self.begin_header();
                        continue;
                    }
                    match rest.windows(2).position(|w| w == self.magic) {
                        Some(at) => {
                            if at > 0 {
                                trace!(skipped = at, "Garbage before packet magic");
                            }
                            pos += at + 2;
                            self.begin_header();
                        }
                        None => {
                            self.state = AssemblyState::SeekingMagic {
                                partial: rest.last() == Some(&self.magic[0]),
                            };
                            pos = chunk.len();
                        }
                    }
                }
                AssemblyState::ReadingHeader { filled } => {
                    let n = (STREAM_HEADER_SIZE - filled).min(rest.len());
                    self.header_bytes[filled..filled + n].copy_from_slice(&rest[..n]);
                    pos += n;
                    if filled + n < STREAM_HEADER_SIZE {
                        self.state = AssemblyState::ReadingHeader { filled: filled + n };
                        continue;
                    }
                    let Ok(header) = StreamPacketHeader::read_from_bytes(&self.header_bytes[..]) else {
                        self.state = AssemblyState::SeekingMagic { partial: false };
                        continue;
                    };
                    self.header = header;
                    let size = header.data_size();
                    if size == 0 {
                        on_data(&self.header, 0, &[]);
                        self.state = AssemblyState::SeekingMagic { partial: false };
                    } else {
                        self.state = AssemblyState::ReadingData {
                            offset: 0,
                            remaining: size,
                        };
                    }
                }
                AssemblyState::ReadingData { offset, remaining } => {
                    let n = remaining.min(rest.len());
                    on_data(&self.header, offset, &rest[..n]);
                    pos += n;
                    self.state = if n == remaining {
                        AssemblyState::SeekingMagic { partial: false }
                    } else {
                        AssemblyState::ReadingData {
                            offset: offset + n,
                            remaining: remaining - n,
                        }
                    };
                }
            }
        }
    }

    fn begin_header(&mut self) {
        self.header_bytes[..2].copy_from_slice(&self.magic);
        self.state = AssemblyState::ReadingHeader { filled: 2 };
    }
}

/// Counters of one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketStats {
    pub bytes: u64,
    pub packets: u64,
    pub lost: u64,
    pub frames: u64,
    pub corrupted: u64,
}

/// Builds frames of one stream out of its mini-packets.
pub struct FrameProcessor {
    config: StreamConfig,
    name: String,
    decoder: Box<dyn ChunkDecoder>,
    sink: Box<dyn FrameSink>,
    clock: StreamClock,
    observer: Option<Arc<dyn FrameObserver>>,
    dump: Arc<dyn DumpSink>,
    sof_padding: bool,
    expected_size: usize,
    trailing_padding: usize,
    corruption: Option<CorruptionReason>,
    /// Rest of the frame is dropped after an overflow
    discarding: bool,
    last_packet_id: Option<u16>,
    frame_host_us: u64,
    stats: PacketStats,
}

impl FrameProcessor {
    pub fn new(
        config: StreamConfig,
        caps: &ProtocolCapabilities,
        map: SampleMap,
        sink: Box<dyn FrameSink>,
        clock: StreamClock,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let expected_size = config.expected_frame_size();
        Ok(Self {
            name: config.kind.to_string(),
            decoder: decoder_for(config.input, map, expected_size),
            sink,
            clock,
            observer: None,
            dump: Arc::new(NullDump),
            // The SOF timestamp overload is only defined for depth
            sof_padding: caps.sof_padding && config.kind == StreamKind::Depth,
            expected_size,
            trailing_padding: 0,
            corruption: None,
            discarding: false,
            last_packet_id: None,
            frame_host_us: 0,
            stats: PacketStats::default(),
            config,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn FrameObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_dump(mut self, dump: Arc<dyn DumpSink>) -> Self {
        self.dump = dump;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn stats(&self) -> PacketStats {
        self.stats
    }

    pub fn expected_size(&self) -> usize {
        self.expected_size
    }

    /// Undecoded bytes waiting for the next chunk.
    pub fn pending(&self) -> usize {
        self.decoder.pending()
    }

    fn part_of(&self, kind: StreamPacketType) -> Option<FramePart> {
        match self.config.kind {
            StreamKind::Depth => kind.depth_part(),
            StreamKind::Image | StreamKind::Ir => kind.image_part(),
        }
    }

    /// Handle one piece of a mini-packet's data.
    pub fn process(&mut self, header: &StreamPacketHeader, offset: usize, data: &[u8]) {
        self.stats.bytes += data.len() as u64;
        let Some(part) = self.part_of(header.kind()) else {
            trace!(stream = %self.name, packet_type = ?header.kind(), "Ignoring packet of another stream");
            return;
        };

        if offset == 0 {
            self.packet_started(header);
            if part == FramePart::Start {
                self.start_frame(header);
            }
        }

        let last_part = part == FramePart::End && offset + data.len() == header.data_size();
        if !self.discarding && !data.is_empty() {
            if let Err(err) = self.decoder.decode(data, last_part, self.sink.write_buffer()) {
                self.overflow(err);
            }
        }

        if last_part {
            self.end_frame(header);
        }
    }

    fn packet_started(&mut self, header: &StreamPacketHeader) {
        let id = header.packet_id.get();
        self.stats.packets += 1;
        if let Some(last) = self.last_packet_id {
            let expected = last.wrapping_add(1);
            // Id 0 is a legal restart of the sequence
            if id != expected && id != 0 {
                warn!(stream = %self.name, expected, got = id, "Packet lost");
                self.stats.lost += 1;
                self.mark_corrupted(CorruptionReason::PacketLost);
            }
        }
        self.last_packet_id = Some(id);

        self.dump.packet(&PacketRecord {
            host_us: self.clock.context().now_us(),
            packet_type: header.packet_type.get(),
            packet_id: id,
            size: usize::from(header.buf_size.get()),
            timestamp: header.timestamp.get(),
        });
    }

    fn start_frame(&mut self, header: &StreamPacketHeader) {
        self.sink.write_buffer().clear();
        self.decoder.reset();
        self.corruption = None;
        self.discarding = false;
        self.trailing_padding = 0;

        if self.config.host_timestamps {
            self.frame_host_us = self.clock.context().host_only_time();
        }

        if self.sof_padding && header.timestamp.get() != 0 {
            let padding = header.padding();
            self.trailing_padding = usize::from(padding.trailing());
            self.pad(usize::from(padding.leading()));
        }
    }

    fn end_frame(&mut self, header: &StreamPacketHeader) {
        if !self.discarding {
            let pending = self.decoder.pending();
            if pending != 0 {
                warn!(stream = %self.name, bytes = pending, "Undecoded bytes left at end of frame");
                self.mark_corrupted(CorruptionReason::StrayContinuation { bytes: pending });
            }
            let trailing = std::mem::take(&mut self.trailing_padding);
            if trailing != 0 {
                self.pad(trailing);
            }
        }
        if !self.discarding {
            let actual = self.sink.write_buffer().len();
            if actual != self.expected_size {
                warn!(
                    stream = %self.name,
                    size = actual,
                    expected = self.expected_size,
                    "Frame buffer is corrupt"
                );
                self.mark_corrupted(CorruptionReason::SizeMismatch {
                    expected: self.expected_size,
                    actual,
                });
            }
        }

        let timestamp_us = if self.config.host_timestamps {
            self.frame_host_us
        } else {
            self.clock.to_host_time(header.timestamp.get())
        };
        let corruption = self.corruption.take();
        let id = self.sink.commit(timestamp_us, corruption);
        self.stats.frames += 1;
        if corruption.is_some() {
            self.stats.corrupted += 1;
        }
        debug!(stream = %self.name, frame = id, timestamp_us, corrupted = corruption.is_some(), "Frame ready");

        if let Some(observer) = &self.observer {
            observer.on_frame(id, timestamp_us);
        }
        self.decoder.reset();
        self.discarding = false;
        self.trailing_padding = 0;
    }

    fn pad(&mut self, samples: usize) {
        let no_data = self.decoder.no_data();
        if let Err(err) = self.sink.write_buffer().pad_samples(samples, no_data) {
            self.overflow(err);
        }
    }

    fn overflow(&mut self, err: ProtocolError) {
        warn!(stream = %self.name, %err, "Frame overflow, dropping the rest of the frame");
        self.mark_corrupted(CorruptionReason::Overflow);
        self.sink.write_buffer().clear();
        self.decoder.reset();
        self.discarding = true;
    }

    fn mark_corrupted(&mut self, reason: CorruptionReason) {
        self.corruption.get_or_insert(reason);
    }
}

struct EndpointState {
    parser: PacketParser,
    processor: Option<FrameProcessor>,
}

/// Routes one endpoint's chunks into the stream currently armed on it.
///
/// `feed` and `stop` take the same lock, so once `stop` returns no chunk
/// reaches the processor any more.
pub struct EndpointReassembler {
    endpoint: u8,
    state: Mutex<EndpointState>,
}

impl EndpointReassembler {
    pub fn new(endpoint: u8, magic: u16) -> Self {
        Self {
            endpoint,
            state: Mutex::new(EndpointState {
                parser: PacketParser::new(magic),
                processor: None,
            }),
        }
    }

    pub fn for_capabilities(endpoint: u8, caps: &ProtocolCapabilities) -> Self {
        Self::new(endpoint, caps.device_magic)
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Install `processor` and start parsing. `ignore_bytes` stale bytes are
    /// skipped first.
    pub fn arm(&self, processor: FrameProcessor, ignore_bytes: usize) {
        let mut state = self.lock();
        debug!(endpoint = self.endpoint, stream = %processor.name, ignore_bytes, "Arming endpoint");
        state.parser.arm(ignore_bytes);
        state.processor = Some(processor);
    }

    /// Tear down and hand back the processor, if one was armed.
    pub fn stop(&self) -> Option<FrameProcessor> {
        let mut state = self.lock();
        state.parser.stop();
        let processor = state.processor.take();
        if let Some(processor) = &processor {
            debug!(endpoint = self.endpoint, stream = %processor.name, stats = ?processor.stats, "Endpoint stopped");
        }
        processor
    }

    pub fn feed(&self, chunk: &[u8]) {
        let mut guard = self.lock();
        let EndpointState { parser, processor } = &mut *guard;
        let Some(processor) = processor.as_mut() else {
            return;
        };
        parser.parse(chunk, |header, offset, data| processor.process(header, offset, data));
    }

    pub fn state(&self) -> AssemblyState {
        self.lock().parser.state()
    }

    pub fn stats(&self) -> Option<PacketStats> {
        self.lock().processor.as_ref().map(FrameProcessor::stats)
    }

    /// Callback feeding this reassembler, for a streaming transport.
    pub fn callback(self: &Arc<Self>) -> ChunkCallback {
        let this = Arc::clone(self);
        Box::new(move |chunk: &[u8]| this.feed(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    const MAGIC: u16 = 0x4252;

    fn packet(kind: StreamPacketType, id: u16, data: &[u8]) -> Vec<u8> {
        let header = StreamPacketHeader::new(MAGIC, kind, id, data.len(), 0);
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(data);
        bytes
    }

    fn collect(parser: &mut PacketParser, chunks: &[&[u8]]) -> Vec<(u16, usize, Vec<u8>)> {
        let mut seen = Vec::new();
        for chunk in chunks {
            parser.parse(chunk, |h, offset, data| seen.push((h.packet_id.get(), offset, data.to_vec())));
        }
        seen
    }

    #[test]
    fn unarmed_parser_drops_everything() {
        let mut parser = PacketParser::new(MAGIC);
        let bytes = packet(StreamPacketType::DepthBody, 1, &[1, 2]);
        assert!(collect(&mut parser, &[&bytes]).is_empty());
        assert_eq!(parser.state(), AssemblyState::AwaitingConfiguration);
    }

    #[test]
    fn magic_split_across_chunks() {
        let mut parser = PacketParser::new(MAGIC);
        parser.arm(0);
        let mut bytes = vec![0xaa, 0xbb];
        bytes.extend(packet(StreamPacketType::DepthBody, 3, &[9, 8, 7, 6]));
        // Cut right after the magic's first byte
        let (a, b) = bytes.split_at(3);
        let seen = collect(&mut parser, &[a, b]);
        assert_eq!(seen, vec![(3, 0, vec![9, 8, 7, 6])]);
        assert_eq!(parser.state(), AssemblyState::SeekingMagic { partial: false });
    }

    #[test]
    fn data_spanning_chunks_keeps_offsets() {
        let mut parser = PacketParser::new(MAGIC);
        parser.arm(0);
        let bytes = packet(StreamPacketType::DepthBody, 1, &[0, 1, 2, 3, 4, 5]);
        let (a, b) = bytes.split_at(14);
        let seen = collect(&mut parser, &[a, b]);
        assert_eq!(seen, vec![(1, 0, vec![0, 1]), (1, 2, vec![2, 3, 4, 5])]);
    }

    #[test]
    fn ignores_first_bytes_after_arming() {
        let mut parser = PacketParser::new(MAGIC);
        let stale = packet(StreamPacketType::DepthBody, 1, &[1; 4]);
        parser.arm(stale.len());
        let fresh = packet(StreamPacketType::DepthBody, 2, &[2; 4]);
        let seen = collect(&mut parser, &[&stale, &fresh]);
        assert_eq!(seen, vec![(2, 0, vec![2; 4])]);
    }

    #[test]
    fn header_only_packet_is_reported() {
        let mut parser = PacketParser::new(MAGIC);
        parser.arm(0);
        let bytes = packet(StreamPacketType::DepthEnd, 5, &[]);
        let seen = collect(&mut parser, &[&bytes]);
        assert_eq!(seen, vec![(5, 0, vec![])]);
    }
}
