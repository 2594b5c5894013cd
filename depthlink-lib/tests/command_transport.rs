//! Request/response behaviour of the command transport against a scripted device

mod common;

use common::*;
use depthlink_lib::command::AlgorithmParamsKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn transport(mock: MockTransport) -> CommandTransport<MockTransport> {
    init_logging();
    CommandTransport::new(mock, modern_caps(), fast_policy())
}

fn wire(opcode: Opcode) -> u16 {
    modern_caps().opcode(opcode).unwrap()
}

#[test]
fn unsupported_opcode_sends_nothing() {
    let mock = MockTransport::acking();
    let sent = mock.sent_log();
    let commands = transport(mock);

    // Reset went away with firmware 1.1
    let err = commands.execute(Opcode::Reset, &[]).unwrap_err();
    assert!(matches!(err, ProtocolError::UnsupportedOpcode { opcode: Opcode::Reset }));
    assert!(sent.lock().unwrap().is_empty());
}

#[test]
fn reply_with_other_id_is_discarded() {
    let get_param = wire(Opcode::GetParam);
    let mock = MockTransport::new(move |req| {
        if req.opcode == get_param {
            vec![
                reply_with_id(req.layout, req.opcode, req.id + 1, NackCode::Ack, &[0xad, 0xde]),
                req.reply(NackCode::Ack, &[0x42, 0x00]),
            ]
        } else {
            vec![req.reply(NackCode::Ack, &[])]
        }
    });
    let sent = mock.sent_log();
    let commands = transport(mock);

    for _ in 0..7 {
        commands.keep_alive().unwrap();
    }
    // Eighth command carries id 7; the stray reply claims id 8
    assert_eq!(commands.get_param(0x12).unwrap(), 0x42);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 8);
    let header = CommandHeader::decode(&sent[7], HeaderLayout::V26).unwrap();
    assert_eq!(header.id, 7);
}

#[test]
fn not_ready_is_retried_with_the_same_request() {
    let mock = MockTransport::new(|req| vec![req.reply(NackCode::NotReady, &[])]);
    let sent = mock.sent_log();
    let commands = transport(mock);

    let err = commands.execute(Opcode::KeepAlive, &[]).unwrap_err();
    assert!(matches!(err, ProtocolError::DeviceNotReady));

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|s| s == &sent[0]));
}

#[test]
fn bad_params_fails_without_retry() {
    let mock = MockTransport::new(|req| vec![req.reply(NackCode::BadParams, &[])]);
    let sent = mock.sent_log();
    let commands = transport(mock);

    let err = commands.execute(Opcode::SetParam, &[0x05, 0x00, 0x01, 0x00]).unwrap_err();
    assert!(matches!(err, ProtocolError::DeviceRejected(NackCode::BadParams)));
    assert_eq!(sent.lock().unwrap().len(), 1);

    // set_param's own retry loop stops on rejection as well
    let err = commands.set_param(0x05, 1).unwrap_err();
    assert!(matches!(err, ProtocolError::DeviceRejected(NackCode::BadParams)));
    assert_eq!(sent.lock().unwrap().len(), 2);
}

#[test]
fn set_param_outlasts_a_busy_device() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mock = MockTransport::new(move |req| {
        let status = if counter.fetch_add(1, Ordering::SeqCst) < 4 {
            NackCode::NotReady
        } else {
            NackCode::Ack
        };
        vec![req.reply(status, &[])]
    });
    let commands = transport(mock);

    commands.set_param(0x11, 1).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[test]
fn multi_packet_reply_after_garbage() {
    let caps = capabilities_for(FirmwareVersion::BASELINE);
    let payload: Vec<u8> = (0..100u8).collect();
    let expected = payload.clone();
    let mock = MockTransport::new(move |req| {
        let full = req.reply(NackCode::Ack, &payload);
        let mut first = vec![0xff, 0xee];
        first.extend_from_slice(&full[..62]);
        vec![first, full[62..].to_vec()]
    });
    let commands = CommandTransport::new(mock, caps, fast_policy());

    let reply = commands.execute(Opcode::AlgorithmParams, &[0x00, 0x00]).unwrap();
    assert_eq!(&reply[..], &expected[..]);
}

#[test]
fn wrong_opcode_is_fatal() {
    let mock = MockTransport::new(|req| {
        vec![reply_with_id(req.layout, req.opcode + 1, req.id, NackCode::Ack, &[])]
    });
    let commands = transport(mock);

    let err = commands.keep_alive().unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::ProtocolMismatch(MismatchKind::WrongOpcode { .. })
    ));
}

#[test]
fn garbage_only_gives_up_after_window() {
    let mock = MockTransport::new(|_| vec![vec![0u8; 16]; 10_000]);
    let commands = transport(mock);

    let err = commands.keep_alive().unwrap_err();
    assert!(matches!(err, ProtocolError::ProtocolMismatch(MismatchKind::BadMagic)));
}

#[test]
fn silent_device_times_out() {
    let mock = MockTransport::new(|_| Vec::new());
    let commands = transport(mock);
    assert!(matches!(commands.keep_alive(), Err(ProtocolError::TransportTimeout)));
}

#[test]
fn connect_switches_to_reported_firmware() {
    let mock = MockTransport::new(|req| {
        // minor, major, build (hex digits), chip, fpga, system version
        let version = [0x08, 0x05, 0x22, 0x00, 0x20, 0x20, 0x20, 0x00, 0x03, 0x00, 0x01, 0x00];
        match (req.layout, req.opcode) {
            (HeaderLayout::V25, 0) => vec![req.reply(NackCode::Ack, &version)],
            _ => vec![req.reply(NackCode::Ack, &[])],
        }
    });
    let sent = mock.sent_log();

    let (commands, versions) = CommandTransport::connect(mock, fast_policy()).unwrap();
    assert_eq!(versions.firmware, FirmwareVersion::new(5, 8, 22));
    assert_eq!(commands.capabilities().header, HeaderLayout::V26);
    assert_eq!(commands.capabilities().max_packet_size, 512);

    commands.keep_alive().unwrap();
    let sent = sent.lock().unwrap();
    assert_eq!(hex::encode(&sent[0][..2]), "5350");
    assert_eq!(hex::encode(&sent[1][..2]), "474d");
}

/// Device answering chunked reads: each reply is `chunk` bytes whose value is
/// the requested offset, until `available` bytes have been served.
fn chunked_device(opcode: Opcode, chunk: usize, unit: usize, available: usize) -> MockTransport {
    let wire_opcode = wire(opcode);
    MockTransport::new(move |req| {
        if req.opcode != wire_opcode {
            return vec![req.reply(NackCode::Ack, &[])];
        }
        let offset_at = req.payload.len() - 2;
        let offset = u16::from_le_bytes([req.payload[offset_at], req.payload[offset_at + 1]]);
        let start = usize::from(offset) * unit;
        let len = chunk.min(available.saturating_sub(start));
        vec![req.reply(NackCode::Ack, &vec![offset as u8; len])]
    })
}

#[test]
fn fixed_params_are_assembled_from_chunks() {
    let mock = chunked_device(Opcode::GetFixedParams, 64, 4, usize::MAX);
    let sent = mock.sent_log();
    let commands = transport(mock);

    let data = commands.get_fixed_params().unwrap();
    assert_eq!(data.len(), 168);
    // Offsets are in dwords: 0, 16, 32
    assert!(data[..64].iter().all(|&b| b == 0));
    assert!(data[64..128].iter().all(|&b| b == 16));
    assert!(data[128..].iter().all(|&b| b == 32));
    assert_eq!(sent.lock().unwrap().len(), 3);
}

#[test]
fn endless_chunks_stop_at_block_size() {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let get_fixed_params = wire(Opcode::GetFixedParams);
    let mock = MockTransport::new(move |req| {
        if req.opcode == get_fixed_params {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        vec![req.reply(NackCode::Ack, &[0xaa; 64])]
    });
    let commands = transport(mock);

    let data = commands.get_fixed_params().unwrap();
    assert_eq!(data.len(), commands.capabilities().fixed_params_size);
    assert!(data.len() <= 2048);
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn empty_chunk_ends_read_early() {
    let mock = chunked_device(Opcode::GetFixedParams, 64, 4, 100);
    let sent = mock.sent_log();
    let commands = transport(mock);

    let data = commands.get_fixed_params().unwrap();
    assert_eq!(data.len(), 100);
    // 64 + 36 bytes, then the empty reply
    assert_eq!(sent.lock().unwrap().len(), 3);
}

#[test]
fn algorithm_params_read_requested_size() {
    let mock = chunked_device(Opcode::AlgorithmParams, 32, 2, usize::MAX);
    let sent = mock.sent_log();
    let commands = transport(mock);

    let data = commands
        .algorithm_params(AlgorithmParamsKind::Padding, 0, 1, 30, 80)
        .unwrap();
    assert_eq!(data.len(), 80);
    // Offsets are in words: 0, 16, 32
    assert_eq!(data[0], 0);
    assert_eq!(data[32], 16);
    assert_eq!(data[79], 32);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    let payload = &sent[2][HeaderLayout::V26.size()..];
    assert_eq!(hex::encode(payload), "0300000001001e002000");
}

#[test]
fn oversized_chunked_read_is_refused() {
    let mock = MockTransport::acking();
    let sent = mock.sent_log();
    let commands = transport(mock);

    let err = commands
        .algorithm_params(AlgorithmParamsKind::DepthInfo, 0, 0, 30, 4096)
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::OutputBufferOverflow { needed: 4096, available: 2048 }
    ));
    assert!(sent.lock().unwrap().is_empty());
}
