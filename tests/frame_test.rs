mod common;

use bytes::{BufMut, BytesMut};
use common::setup;
use framenet::{
    decode, encode, encode_into, AppError, ControlKind, Frame, HeartBeat, StreamReassembler,
    DATA_TAG, HEADER_LEN,
};
use rstest::rstest;

fn stream_of(payloads: &[&[u8]]) -> BytesMut {
    let mut stream = BytesMut::new();
    for payload in payloads {
        encode_into(&mut stream, payload, DATA_TAG);
    }
    stream
}

fn collect(reassembler: &mut StreamReassembler, chunks: &[&[u8]]) -> Vec<Frame> {
    let mut frames = Vec::new();
    for chunk in chunks {
        reassembler
            .feed(chunk, |frame| frames.push(frame))
            .expect("well formed stream");
    }
    frames
}

#[rstest]
fn test_header_layout(_setup: ()) {
    let encoded = encode(b"abc", DATA_TAG);
    assert_eq!(encoded.len(), HEADER_LEN + 3);
    assert_eq!(&encoded[..4], &11u32.to_be_bytes());
    assert_eq!(&encoded[4..8], &DATA_TAG.to_ne_bytes());

    let decoded = decode(&encoded);
    assert!(decoded.complete);
    assert_eq!(decoded.total_len, 11);
    assert_eq!(decoded.payload, b"abc");
}

#[rstest]
fn test_decode_partial_input(_setup: ()) {
    let encoded = encode(b"hello world", DATA_TAG);
    assert!(!decode(&encoded[..5]).complete);

    let partial = decode(&encoded[..12]);
    assert!(!partial.complete);
    assert_eq!(partial.total_len, 19);
    assert_eq!(partial.payload, b"hell");

    // a length smaller than the header is never complete
    let mut bogus = BytesMut::new();
    bogus.put_u32(3);
    bogus.put_u32_ne(DATA_TAG);
    assert!(!decode(&bogus).complete);
}

#[rstest]
fn test_control_tags_are_recognized(_setup: ()) {
    for kind in [ControlKind::Hello, ControlKind::Heart, ControlKind::Quit] {
        let encoded = encode(&[], kind.tag());
        assert_eq!(ControlKind::from_tag(decode(&encoded).tag), Some(kind));
    }
    assert_eq!(ControlKind::from_tag(DATA_TAG), None);
}

#[rstest]
fn test_heart_payload(_setup: ()) -> Result<(), AppError> {
    let beat = HeartBeat {
        sender: 0xdead_beef,
        sequence: 41,
        fail_count: 2,
    };
    let payload = beat.encode();
    assert_eq!(payload.len(), 12);
    assert_eq!(&payload[4..8], &41u32.to_be_bytes());
    assert_eq!(HeartBeat::decode(&payload)?, beat);
    assert_eq!(beat.echo().sequence, 42);
    assert!(HeartBeat::decode(&payload[..8]).is_err());
    Ok(())
}

/// Any split of a valid stream yields the same frames as feeding it whole.
#[rstest]
fn test_every_split_point_yields_same_frames(_setup: ()) {
    let payloads: [&[u8]; 4] = [b"first", b"", b"a somewhat longer third payload", b"4"];
    let stream = stream_of(&payloads);

    let whole = collect(&mut StreamReassembler::new(1024), &[&stream]);
    assert_eq!(whole.len(), payloads.len());
    for (frame, payload) in whole.iter().zip(payloads) {
        assert_eq!(frame.tag, DATA_TAG);
        assert_eq!(&frame.payload[..], payload);
    }

    for first in 0..=stream.len() {
        for second in first..=stream.len() {
            let mut reassembler = StreamReassembler::new(1024);
            let frames = collect(
                &mut reassembler,
                &[&stream[..first], &stream[first..second], &stream[second..]],
            );
            assert_eq!(frames, whole, "split at {} and {}", first, second);
            assert_eq!(reassembler.cached_len(), 0);
        }
    }
}

#[rstest]
fn test_byte_at_a_time(_setup: ()) {
    let stream = stream_of(&[b"one", b"two"]);
    let mut reassembler = StreamReassembler::new(1024);
    let chunks: Vec<&[u8]> = stream.chunks(1).collect();
    let frames = collect(&mut reassembler, &chunks);
    assert_eq!(frames.len(), 2);
    assert_eq!(&frames[1].payload[..], b"two");
}

#[rstest]
fn test_oversized_header_drops_cache(_setup: ()) {
    let mut reassembler = StreamReassembler::new(64);
    let good = encode(b"ok", DATA_TAG);
    let mut input = BytesMut::new();
    input.extend_from_slice(&good);
    input.put_u32(1 << 20);
    input.put_u32_ne(DATA_TAG);
    input.extend_from_slice(b"garbage after the corrupt header");

    let mut frames = Vec::new();
    let result = reassembler.feed(&input, |frame| frames.push(frame));
    assert!(matches!(&result, Err(e) if e.is_corruption()));
    // frames before the corruption were still delivered
    assert_eq!(frames.len(), 1);
    assert_eq!(reassembler.cached_len(), 0);
    assert!(reassembler.dropped_bytes() > 0);

    // the next read starts from a clean slate
    let frames = collect(&mut reassembler, &[&encode(b"again", DATA_TAG)]);
    assert_eq!(&frames[0].payload[..], b"again");
}

#[rstest]
fn test_cache_never_exceeds_bound(_setup: ()) {
    let max = 128;
    let mut reassembler = StreamReassembler::new(max);
    let payload = vec![7u8; max - HEADER_LEN];
    let stream = stream_of(&[&payload, &payload]);
    for chunk in stream.chunks(13) {
        reassembler
            .feed(chunk, |_| {})
            .expect("frames fit the cache");
        assert!(reassembler.cached_len() <= max);
    }
    assert_eq!(reassembler.cached_len(), 0);
}
