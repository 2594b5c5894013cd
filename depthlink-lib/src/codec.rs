//! Sample codecs: bit-packed shift and IR formats, the nibble-coded
//! compressed depth format and plain byte copies.
//!
//! Packed formats decode whole elements only. Bytes left over at the end of
//! a chunk wait in a [`ContinuationBuffer`] until the next chunk completes
//! the element.

use crate::constants::{MAX_SHIFT_VALUE, NO_DEPTH_VALUE};
use crate::error::ProtocolError;
use crate::frame::FrameBuffer;
use crate::shift_to_depth::{ShiftToDepthConfig, ShiftToDepthTable};
use crate::stream::{InputFormat, StreamConfig, StreamKind};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// MSB-first bit reader.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit
    }

    /// Read `bits` (at most 16) bits, or `None` if the input runs out.
    pub fn read(&mut self, bits: usize) -> Option<u16> {
        if bits > 16 || bits > self.remaining_bits() {
            return None;
        }
        let mut value = 0u16;
        for _ in 0..bits {
            let byte = self.data[self.bit / 8];
            let bit = (byte >> (7 - self.bit % 8)) & 1;
            value = (value << 1) | u16::from(bit);
            self.bit += 1;
        }
        Some(value)
    }
}

/// MSB-first bit writer, the inverse of [`BitReader`].
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    pending: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the low `bits` bits of `value`.
    pub fn write(&mut self, value: u16, bits: usize) {
        for i in (0..bits).rev() {
            self.acc = (self.acc << 1) | u32::from((value >> i) & 1);
            self.pending += 1;
            if self.pending == 8 {
                self.out.push(self.acc as u8);
                self.acc = 0;
                self.pending = 0;
            }
        }
    }

    /// Flush, zero-padding the last byte.
    pub fn finish(mut self) -> Vec<u8> {
        if self.pending > 0 {
            self.out.push((self.acc << (8 - self.pending)) as u8);
        }
        self.out
    }
}

/// A fixed-ratio packed sample format.
pub trait PackedFormat: Send + 'static {
    const BITS: usize;
    /// Samples per element
    const SAMPLES: usize;
    /// Bytes per element, checked at compile time to be whole
    const ELEMENT_BYTES: usize = {
        assert!(Self::BITS <= 16, "samples must fit in 16 bits");
        assert!(Self::BITS * Self::SAMPLES % 8 == 0, "element must be whole bytes");
        Self::BITS * Self::SAMPLES / 8
    };

    /// Decode one element of exactly `ELEMENT_BYTES` bytes into `SAMPLES` samples.
    fn decode_element(element: &[u8], out: &mut Vec<u16>);
}

/// 10-bit IR, 5 bytes to 4 samples.
pub struct Packed10;

impl PackedFormat for Packed10 {
    const BITS: usize = 10;
    const SAMPLES: usize = 4;

    fn decode_element(e: &[u8], out: &mut Vec<u16>) {
        let b = |i: usize| u16::from(e[i]);
        out.extend_from_slice(&[
            (b(0) << 2) | (b(1) >> 6),
            ((b(1) & 0x3f) << 4) | (b(2) >> 4),
            ((b(2) & 0x0f) << 6) | (b(3) >> 2),
            ((b(3) & 0x03) << 8) | b(4),
        ]);
    }
}

/// 11-bit shifts, 22 bytes to 16 samples.
pub struct Packed11;

impl PackedFormat for Packed11 {
    const BITS: usize = 11;
    const SAMPLES: usize = 16;

    fn decode_element(e: &[u8], out: &mut Vec<u16>) {
        for half in e.chunks_exact(11) {
            let b = |i: usize| u16::from(half[i]);
            out.extend_from_slice(&[
                (b(0) << 3) | (b(1) >> 5),
                ((b(1) & 0x1f) << 6) | (b(2) >> 2),
                ((b(2) & 0x03) << 9) | (b(3) << 1) | (b(4) >> 7),
                ((b(4) & 0x7f) << 4) | (b(5) >> 4),
                ((b(5) & 0x0f) << 7) | (b(6) >> 1),
                ((b(6) & 0x01) << 10) | (b(7) << 2) | (b(8) >> 6),
                ((b(8) & 0x3f) << 5) | (b(9) >> 3),
                ((b(9) & 0x07) << 8) | b(10),
            ]);
        }
    }
}

/// 12-bit shifts, 24 bytes to 16 samples.
pub struct Packed12;

impl PackedFormat for Packed12 {
    const BITS: usize = 12;
    const SAMPLES: usize = 16;

    fn decode_element(e: &[u8], out: &mut Vec<u16>) {
        for triple in e.chunks_exact(3) {
            let (b0, b1, b2) = (u16::from(triple[0]), u16::from(triple[1]), u16::from(triple[2]));
            out.push((b0 << 4) | (b1 >> 4));
            out.push(((b1 & 0x0f) << 8) | b2);
        }
    }
}

/// 16-bit little-endian shifts.
pub struct Unpacked16;

impl PackedFormat for Unpacked16 {
    const BITS: usize = 16;
    const SAMPLES: usize = 1;

    fn decode_element(e: &[u8], out: &mut Vec<u16>) {
        out.push(u16::from_le_bytes([e[0], e[1]]));
    }
}

/// Decode the whole elements at the start of `input`.
///
/// Returns the bytes consumed; anything shorter than one element is left.
pub fn unpack<F: PackedFormat>(input: &[u8], out: &mut Vec<u16>) -> usize {
    let mut consumed = 0;
    for element in input.chunks_exact(F::ELEMENT_BYTES) {
        F::decode_element(element, out);
        consumed += F::ELEMENT_BYTES;
    }
    consumed
}

/// Re-pack samples with [`BitWriter`]. Only whole elements round-trip.
pub fn pack<F: PackedFormat>(samples: &[u16]) -> Vec<u8> {
    if F::BITS == 16 {
        return samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    }
    let mut writer = BitWriter::new();
    for &s in samples {
        writer.write(s, F::BITS);
    }
    writer.finish()
}

/// Holds the tail of a chunk that did not make up a whole element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl ContinuationBuffer {
    pub fn new(capacity: usize) -> Self {
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

    pub fn is_full(&self) -> bool {
        self.data.len() == self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Take as many bytes as fit; returns how many were taken.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.capacity - self.data.len());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }
}

/// Maps decoded codes to output samples.
#[derive(Debug, Clone)]
pub enum SampleMap {
    /// Through a shift to depth table; codes past the table become no-data
    Table(Arc<ShiftToDepthTable>),
    /// Codes are the output
    Direct,
}

impl SampleMap {
    /// Depth streams go through the table for their output mode; IR and
    /// image samples are used as decoded.
    pub fn for_stream(config: &StreamConfig, calibration: &ShiftToDepthConfig) -> Result<Self, ProtocolError> {
        match config.kind {
            StreamKind::Depth => Ok(SampleMap::Table(Arc::new(ShiftToDepthTable::for_output(
                config.output,
                calibration,
            )?))),
            StreamKind::Image | StreamKind::Ir => Ok(SampleMap::Direct),
        }
    }

    #[inline]
    pub fn map(&self, code: u16) -> u16 {
        match self {
            SampleMap::Table(table) => table.lookup(code),
            SampleMap::Direct => code,
        }
    }

    pub fn no_data(&self) -> u16 {
        match self {
            SampleMap::Table(table) => table.no_data(),
            SampleMap::Direct => NO_DEPTH_VALUE,
        }
    }
}

/// Per-stream decoder fed with the data part of each mini-packet.
pub trait ChunkDecoder: Send {
    /// Decode a chunk into `out`. `last_part` marks the final chunk of a frame.
    fn decode(&mut self, data: &[u8], last_part: bool, out: &mut FrameBuffer) -> Result<(), ProtocolError>;

    /// Undecoded bytes carried to the next chunk.
    fn pending(&self) -> usize;

    fn reset(&mut self);

    /// Sample written for padding pixels.
    fn no_data(&self) -> u16;
}

/// Decoder for [`PackedFormat`]s with continuation handling.
pub struct PackedDecoder<F: PackedFormat> {
    carry: ContinuationBuffer,
    map: SampleMap,
    scratch: Vec<u16>,
    _format: PhantomData<F>,
}

impl<F: PackedFormat> PackedDecoder<F> {
    pub fn new(map: SampleMap) -> Self {
        Self {
            carry: ContinuationBuffer::new(F::ELEMENT_BYTES),
            map,
            scratch: Vec::new(),
            _format: PhantomData,
        }
    }

    fn emit(&mut self, input: &[u8], out: &mut FrameBuffer) -> Result<usize, ProtocolError> {
        let elements = input.len() / F::ELEMENT_BYTES;
        out.ensure_space(elements * F::SAMPLES * 2)?;
        self.scratch.clear();
        let consumed = unpack::<F>(input, &mut self.scratch);
        for s in self.scratch.iter_mut() {
            *s = self.map.map(*s);
        }
        out.push_samples(&self.scratch)?;
        Ok(consumed)
    }
}

impl<F: PackedFormat> ChunkDecoder for PackedDecoder<F> {
    fn decode(&mut self, mut data: &[u8], _last_part: bool, out: &mut FrameBuffer) -> Result<(), ProtocolError> {
        if !self.carry.is_empty() {
            let taken = self.carry.fill(data);
            data = &data[taken..];
            if self.carry.is_full() {
                let element = std::mem::replace(&mut self.carry, ContinuationBuffer::new(F::ELEMENT_BYTES));
                self.emit(element.as_slice(), out)?;
            }
        }

        let consumed = self.emit(data, out)?;
        self.carry.fill(&data[consumed..]);
        Ok(())
    }

    fn pending(&self) -> usize {
        self.carry.len()
    }

    fn reset(&mut self) {
        self.carry.reset();
    }

    fn no_data(&self) -> u16 {
        self.map.no_data()
    }
}

/// Nibble reader over a byte slice, high nibble first.
struct Nibbles<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Nibbles<'_> {
    fn next(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos / 2)?;
        let nibble = if self.pos % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        self.pos += 1;
        Some(nibble)
    }

    fn at_byte_boundary(&self) -> bool {
        self.pos % 2 == 0
    }

    fn bytes_read(&self) -> usize {
        self.pos.div_ceil(2)
    }
}

/// Result of decompressing one buffer of compressed depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decompressed {
    pub consumed: usize,
    pub codes: Vec<u16>,
}

/// Decompress nibble-coded depth.
///
/// Unless `last_part` is set, decoding is cut back to the last point where a
/// full value starts on a byte boundary, so the rest can be retried with the
/// next chunk appended. Fails if more than `max_samples` would be produced.
pub fn decompress_ps(input: &[u8], last_part: bool, max_samples: usize) -> Result<Decompressed, ProtocolError> {
    let mut nibbles = Nibbles { data: input, pos: 0 };
    let mut codes = Vec::new();
    let mut last: u16 = 0;
    let mut stop = (0usize, 0usize);

    let emit = |codes: &mut Vec<u16>, value: &mut u16| -> Result<(), ProtocolError> {
        if codes.len() >= max_samples {
            return Err(ProtocolError::OutputBufferOverflow {
                needed: (codes.len() + 1) * 2,
                available: max_samples * 2,
            });
        }
        if usize::from(*value) >= MAX_SHIFT_VALUE {
            *value = NO_DEPTH_VALUE;
        }
        codes.push(*value);
        Ok(())
    };

    'decode: loop {
        let can_stop = nibbles.at_byte_boundary();
        let Some(op) = nibbles.next() else { break };
        match op {
            // dummy
            0xd => {}
            0xe => {
                let Some(count) = nibbles.next() else { break };
                for _ in 0..=count {
                    emit(&mut codes, &mut last)?;
                }
            }
            0xf => {
                let Some(first) = nibbles.next() else { break };
                if first & 0x8 != 0 {
                    let Some(low) = nibbles.next() else { break };
                    let large = (i16::from(first - 0x8) << 4) | i16::from(low);
                    last = last.wrapping_add_signed(large - 64);
                } else {
                    if can_stop {
                        stop = ((nibbles.pos - 2) / 2, codes.len());
                    }
                    let mut value = u16::from(first) << 12;
                    for shift in [8, 4, 0] {
                        let Some(n) = nibbles.next() else { break 'decode };
                        value |= u16::from(n) << shift;
                    }
                    last = value;
                }
                emit(&mut codes, &mut last)?;
            }
            diff => {
                last = last.wrapping_add_signed(i16::from(diff) - 6);
                emit(&mut codes, &mut last)?;
            }
        }
    }

    if last_part {
        Ok(Decompressed {
            consumed: nibbles.bytes_read().min(input.len()),
            codes,
        })
    } else {
        codes.truncate(stop.1);
        Ok(Decompressed { consumed: stop.0, codes })
    }
}

/// Decoder for nibble-coded compressed depth.
pub struct PsCompressedDecoder {
    raw: Vec<u8>,
    capacity: usize,
    map: SampleMap,
}

impl PsCompressedDecoder {
    /// `capacity` bounds how many undecoded bytes may pile up.
    pub fn new(map: SampleMap, capacity: usize) -> Self {
        Self {
            raw: Vec::new(),
            capacity,
            map,
        }
    }
}

impl ChunkDecoder for PsCompressedDecoder {
    fn decode(&mut self, data: &[u8], last_part: bool, out: &mut FrameBuffer) -> Result<(), ProtocolError> {
        if !self.raw.is_empty() {
            if self.raw.len() + data.len() > self.capacity {
                let needed = self.raw.len() + data.len();
                warn!(pending = self.raw.len(), "Compressed depth carry-over overflow");
                self.raw.clear();
                return Err(ProtocolError::OutputBufferOverflow {
                    needed,
                    available: self.capacity,
                });
            }
            self.raw.extend_from_slice(data);
        }
        let input: &[u8] = if self.raw.is_empty() { data } else { &self.raw };

        let decoded = decompress_ps(input, last_part, out.remaining() / 2)?;
        let samples: Vec<u16> = decoded.codes.iter().map(|&c| self.map.map(c)).collect();
        out.push_samples(&samples)?;

        let rest = input[decoded.consumed..].to_vec();
        self.raw = rest;
        Ok(())
    }

    fn pending(&self) -> usize {
        self.raw.len()
    }

    fn reset(&mut self) {
        self.raw.clear();
    }

    fn no_data(&self) -> u16 {
        self.map.no_data()
    }
}

/// Copies image bytes as they arrive.
#[derive(Debug, Default)]
pub struct PassThroughDecoder;

impl ChunkDecoder for PassThroughDecoder {
    fn decode(&mut self, data: &[u8], _last_part: bool, out: &mut FrameBuffer) -> Result<(), ProtocolError> {
        out.push_bytes(data)
    }

    fn pending(&self) -> usize {
        0
    }

    fn reset(&mut self) {}

    fn no_data(&self) -> u16 {
        0
    }
}

/// Build the decoder for an input format.
pub fn decoder_for(format: InputFormat, map: SampleMap, frame_capacity: usize) -> Box<dyn ChunkDecoder> {
    match format {
        InputFormat::Uncompressed16 => Box::new(PackedDecoder::<Unpacked16>::new(map)),
        InputFormat::Packed11 => Box::new(PackedDecoder::<Packed11>::new(map)),
        InputFormat::Packed12 => Box::new(PackedDecoder::<Packed12>::new(map)),
        InputFormat::Packed10 => Box::new(PackedDecoder::<Packed10>::new(map)),
        InputFormat::PsCompressed => Box::new(PsCompressedDecoder::new(map, frame_capacity)),
        InputFormat::PassThrough => Box::new(PassThroughDecoder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_unpack(input: &[u8], bits: usize) -> Vec<u16> {
        let mut reader = BitReader::new(input);
        std::iter::from_fn(|| reader.read(bits)).collect()
    }

    fn pattern(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (x >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn element_sizes() {
        assert_eq!(Packed10::ELEMENT_BYTES, 5);
        assert_eq!(Packed11::ELEMENT_BYTES, 22);
        assert_eq!(Packed12::ELEMENT_BYTES, 24);
        assert_eq!(Unpacked16::ELEMENT_BYTES, 2);
    }

    #[test]
    fn unrolled_unpackers_match_bit_reader() {
        for seed in 0..32 {
            let input = pattern(22 * 24 * 5, seed);
            let mut out = Vec::new();
            unpack::<Packed11>(&input, &mut out);
            assert_eq!(out, reference_unpack(&input, 11), "11-bit seed {seed}");

            out.clear();
            unpack::<Packed12>(&input, &mut out);
            assert_eq!(out, reference_unpack(&input, 12), "12-bit seed {seed}");

            out.clear();
            unpack::<Packed10>(&input, &mut out);
            assert_eq!(out, reference_unpack(&input, 10), "10-bit seed {seed}");
        }
    }

    #[test]
    fn twelve_bit_layout() {
        let mut out = Vec::new();
        let consumed = unpack::<Packed12>(&[0xab, 0xcd, 0xef, 0x12], &mut out);
        assert_eq!(consumed, 0);
        assert!(out.is_empty());

        let mut element = vec![0xab, 0xcd, 0xef];
        element.resize(24, 0);
        unpack::<Packed12>(&element, &mut out);
        assert_eq!(&out[..2], &[0xabc, 0xdef]);
    }

    #[test]
    fn continuation_fills_to_capacity() {
        let mut carry = ContinuationBuffer::new(5);
        assert_eq!(carry.fill(&[1, 2, 3]), 3);
        assert_eq!(carry.fill(&[4, 5, 6, 7]), 2);
        assert!(carry.is_full());
        assert_eq!(carry.as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn decompresses_each_opcode() {
        // full 0x0123, diff +1, dummy, rle x3, large diff -64+0x50=+16
        let input = [0xf0, 0x12, 0x37, 0xde, 0x2f, 0xd0];
        let out = decompress_ps(&input, true, 64).unwrap();
        assert_eq!(out.codes, vec![0x123, 0x124, 0x124, 0x124, 0x124, 0x134]);
        assert_eq!(out.consumed, input.len());
    }

    #[test]
    fn partial_compressed_chunk_stops_at_full_value() {
        // 0x010, diff +1, then a full value cut after its first two nibbles
        let out = decompress_ps(&[0xf0, 0x01, 0x07, 0xf0], false, 64).unwrap();
        assert_eq!(out.codes, vec![0x010, 0x011]);
        assert_eq!(out.consumed, 3);

        // The second full value starts mid-byte, so only the first is a stop point
        let out = decompress_ps(&[0xf0, 0x01, 0x0f, 0x00, 0x20, 0xf8], false, 64).unwrap();
        assert!(out.codes.is_empty());
        assert_eq!(out.consumed, 0);

        let out = decompress_ps(&[0xf0, 0x01, 0x0f, 0x00, 0x20, 0xf8], true, 64).unwrap();
        assert_eq!(out.codes, vec![0x010, 0x020]);
    }

    #[test]
    fn compressed_overflow_is_an_error() {
        let input = [0xef];
        assert!(decompress_ps(&input, true, 4).is_err());
    }
}
