//! Sample codecs driven through the per-stream decoders

use depthlink_lib::codec::{
    ChunkDecoder, PackedDecoder, Packed11, Packed12, PsCompressedDecoder, SampleMap, decoder_for, pack,
};
use depthlink_lib::constants::{MAX_SHIFT_VALUE, NO_DEPTH_SHIFT};
use depthlink_lib::frame::FrameBuffer;
use depthlink_lib::shift_to_depth::ShiftToDepthTable;
use depthlink_lib::stream::InputFormat;
use std::sync::Arc;

fn shift_map() -> SampleMap {
    SampleMap::Table(Arc::new(ShiftToDepthTable::identity(MAX_SHIFT_VALUE)))
}

fn decode_in_pieces(decoder: &mut dyn ChunkDecoder, input: &[u8], split: usize, capacity: usize) -> Vec<u16> {
    let mut out = FrameBuffer::with_capacity(capacity);
    decoder.decode(&input[..split], split == input.len(), &mut out).unwrap();
    decoder.decode(&input[split..], true, &mut out).unwrap();
    out.samples().collect()
}

/// Minimal encoder for the nibble-coded format: small and large diffs,
/// otherwise a full value.
fn compress(values: &[u16]) -> Vec<u8> {
    let mut nibbles = Vec::new();
    let mut last: i32 = 0;
    for &v in values {
        let diff = i32::from(v) - last;
        match diff {
            -6..=6 => nibbles.push((diff + 6) as u8),
            -64..=63 => {
                let x = (diff + 64) as u8;
                nibbles.extend([0xf, 0x8 | (x >> 4), x & 0xf]);
            }
            _ => nibbles.extend([0xf, (v >> 12) as u8, (v >> 8 & 0xf) as u8, (v >> 4 & 0xf) as u8, (v & 0xf) as u8]),
        }
        last = i32::from(v);
    }
    if nibbles.len() % 2 == 1 {
        nibbles.push(0xd);
    }
    nibbles.chunks(2).map(|p| (p[0] << 4) | p[1]).collect()
}

#[test]
fn eleven_bit_roundtrips_every_shift() {
    let codes: Vec<u16> = (0..MAX_SHIFT_VALUE as u16).collect();
    let packed = pack::<Packed11>(&codes);
    assert_eq!(packed.len(), codes.len() / 16 * 22);

    let mut decoder = PackedDecoder::<Packed11>::new(shift_map());
    let out = decode_in_pieces(&mut decoder, &packed, 1_001, codes.len() * 2);
    assert_eq!(out, codes);
}

#[test]
fn twelve_bit_codes_past_max_shift_are_no_data() {
    let codes: Vec<u16> = (2_032..2_032 + 32).collect();
    let packed = pack::<Packed12>(&codes);

    let mut decoder = PackedDecoder::<Packed12>::new(shift_map());
    let out = decode_in_pieces(&mut decoder, &packed, 24, 64);
    for (code, sample) in codes.iter().zip(&out) {
        if *code < NO_DEPTH_SHIFT {
            assert_eq!(sample, code);
        } else {
            assert_eq!(*sample, NO_DEPTH_SHIFT, "code {code}");
        }
    }
}

#[test]
fn every_split_point_decodes_the_same() {
    let codes: Vec<u16> = (0..64).map(|i| (i * 29 % 2000) as u16).collect();
    let packed = pack::<Packed12>(&codes);
    for split in 0..=packed.len() {
        let mut decoder = decoder_for(InputFormat::Packed12, shift_map(), 128);
        assert_eq!(decode_in_pieces(decoder.as_mut(), &packed, split, 128), codes, "split {split}");
        assert_eq!(decoder.pending(), 0);
    }
}

#[test]
fn compressed_depth_survives_any_split() {
    let mut values = Vec::new();
    for i in 0..200u16 {
        values.push(match i % 10 {
            0 => 1_800 - i,
            1..=4 => 1_000 + i % 7,
            5 => 400 + i,
            _ => 1_000 + 2 * (i % 30),
        });
    }
    let compressed = compress(&values);
    let capacity = values.len() * 2;

    let mut whole = PsCompressedDecoder::new(shift_map(), capacity);
    let mut out = FrameBuffer::with_capacity(capacity);
    whole.decode(&compressed, true, &mut out).unwrap();
    assert_eq!(out.samples().collect::<Vec<_>>(), values);

    for split in 0..=compressed.len() {
        let mut decoder = PsCompressedDecoder::new(shift_map(), capacity);
        assert_eq!(decode_in_pieces(&mut decoder, &compressed, split, capacity), values, "split {split}");
        assert_eq!(decoder.pending(), 0);
    }
}

#[test]
fn depth_table_maps_unknown_codes_to_zero() {
    let table = Arc::new(ShiftToDepthTable::build(&Default::default()).unwrap());
    let mut decoder = PackedDecoder::<Packed12>::new(SampleMap::Table(table.clone()));
    let codes: Vec<u16> = vec![600, 4_095, 2_047, 900, 3_000, 2_048, 700, 800, 0, 0, 0, 0, 0, 0, 0, 0];
    let mut out = FrameBuffer::with_capacity(32);
    decoder.decode(&pack::<Packed12>(&codes), true, &mut out).unwrap();

    let samples: Vec<u16> = out.samples().collect();
    assert_eq!(samples[1], 0);
    assert_eq!(samples[2], 0);
    assert_eq!(samples[4], 0);
    assert_eq!(samples[5], 0);
    assert_eq!(samples[0], table.lookup(600));
    assert_eq!(samples[3], table.lookup(900));
}

#[test]
fn packed_decoder_overflow_is_reported() {
    let mut decoder = PackedDecoder::<Packed11>::new(shift_map());
    let mut out = FrameBuffer::with_capacity(16);
    let packed = pack::<Packed11>(&[1; 16]);
    assert!(decoder.decode(&packed, true, &mut out).is_err());
}
