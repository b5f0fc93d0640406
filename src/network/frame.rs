// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire framing.
//!
//! Every message travels as
//!
//! ```text
//! offset 0: u32 total_len  (network byte order, includes the 8 header bytes)
//! offset 4: u32 tag        (host byte order, 0 = application data)
//! offset 8: payload        (total_len - 8 bytes)
//! ```
//!
//! The asymmetric byte order of the two header fields is part of the format and
//! must be kept for peers speaking the same wire protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::AppError::{FrameTooLarge, Incomplete, MalformedFrame};
use crate::AppResult;

pub const HEADER_LEN: usize = 8;
/// default bound of a node's partial frame cache, also the largest accepted frame
pub const DEFAULT_MAX_CACHE_SIZE: usize = 64 * 1024 * 1024;
pub const DATA_TAG: u32 = 0;

/// The three in-band control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Hello,
    Heart,
    Quit,
}

impl ControlKind {
    // "NIH", "NIX", "NIQ" packed into the low three bytes
    pub const HELLO_TAG: u32 = (b'N' as u32) << 16 | (b'I' as u32) << 8 | b'H' as u32;
    pub const HEART_TAG: u32 = (b'N' as u32) << 16 | (b'I' as u32) << 8 | b'X' as u32;
    pub const QUIT_TAG: u32 = (b'N' as u32) << 16 | (b'I' as u32) << 8 | b'Q' as u32;

    pub fn from_tag(tag: u32) -> Option<ControlKind> {
        match tag {
            Self::HELLO_TAG => Some(ControlKind::Hello),
            Self::HEART_TAG => Some(ControlKind::Heart),
            Self::QUIT_TAG => Some(ControlKind::Quit),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            ControlKind::Hello => Self::HELLO_TAG,
            ControlKind::Heart => Self::HEART_TAG,
            ControlKind::Quit => Self::QUIT_TAG,
        }
    }
}

/// A complete frame with its header stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(payload: impl Into<Bytes>) -> Frame {
        Frame {
            tag: DATA_TAG,
            payload: payload.into(),
        }
    }

    pub fn control(kind: ControlKind, payload: impl Into<Bytes>) -> Frame {
        Frame {
            tag: kind.tag(),
            payload: payload.into(),
        }
    }

    pub fn control_kind(&self) -> Option<ControlKind> {
        ControlKind::from_tag(self.tag)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> BytesMut {
        encode(&self.payload, self.tag)
    }

    /// Splits one frame off the front of `buffer`, leaving any trailing bytes in place.
    ///
    /// Returns `Ok(None)` until the whole frame is buffered. A header announcing a frame
    /// shorter than the header itself, or longer than `max_size`, is an error and the
    /// buffer is left untouched.
    pub fn parse(buffer: &mut BytesMut, max_size: usize) -> AppResult<Option<Frame>> {
        match FrameHeader::check(buffer, max_size) {
            Ok(header) => {
                let mut raw = buffer.split_to(header.total_len as usize);
                raw.advance(HEADER_LEN);
                Ok(Some(Frame {
                    tag: header.tag,
                    payload: raw.freeze(),
                }))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_len: u32,
    pub tag: u32,
}

impl FrameHeader {
    /// Reads the header at the start of `buf`, `None` when fewer than 8 bytes are available.
    pub fn peek(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut header = &buf[..HEADER_LEN];
        let total_len = header.get_u32();
        let tag = header.get_u32_ne();
        Some(FrameHeader { total_len, tag })
    }

    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(HEADER_LEN)
    }

    /// Rejects lengths that can never describe a valid frame.
    pub fn validate(&self, max_size: usize) -> AppResult<()> {
        let total_len = self.total_len as usize;
        if total_len < HEADER_LEN {
            return Err(MalformedFrame(format!(
                "frame length {} is smaller than the {} byte header",
                total_len, HEADER_LEN
            )));
        }
        if total_len > max_size {
            return Err(FrameTooLarge(format!(
                "frame of length {} exceeds the limit of {}",
                total_len, max_size
            )));
        }
        Ok(())
    }

    /// Checks that `buffer` starts with a valid, fully buffered frame.
    pub fn check(buffer: &mut BytesMut, max_size: usize) -> AppResult<FrameHeader> {
        let header = FrameHeader::peek(buffer).ok_or(Incomplete)?;
        header.validate(max_size)?;
        if buffer.len() < header.total_len as usize {
            buffer.reserve(header.total_len as usize - buffer.len());
            return Err(Incomplete);
        }
        Ok(header)
    }
}

/// Result of [`decode`]: the header fields plus the payload bytes available so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded<'a> {
    pub complete: bool,
    pub total_len: u32,
    pub tag: u32,
    pub payload: &'a [u8],
}

/// Prepends the 8 byte header to `payload`.
pub fn encode(payload: &[u8], tag: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(&mut buf, payload, tag);
    buf
}

pub fn encode_into(dst: &mut BytesMut, payload: &[u8], tag: u32) {
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32((HEADER_LEN + payload.len()) as u32);
    dst.put_u32_ne(tag);
    dst.put_slice(payload);
}

/// Decodes the frame at the start of `buf` without consuming anything.
///
/// Never fails: fewer than 8 bytes, a truncated payload, or a length field smaller than
/// the header all report `complete == false`.
pub fn decode(buf: &[u8]) -> Decoded<'_> {
    let Some(header) = FrameHeader::peek(buf) else {
        return Decoded {
            complete: false,
            total_len: 0,
            tag: 0,
            payload: &[],
        };
    };
    let total_len = header.total_len as usize;
    let well_formed = total_len >= HEADER_LEN;
    let end = if well_formed {
        total_len.min(buf.len())
    } else {
        HEADER_LEN
    };
    Decoded {
        complete: well_formed && buf.len() >= total_len,
        total_len: header.total_len,
        tag: header.tag,
        payload: &buf[HEADER_LEN..end],
    }
}

/// Heart payload: `sender` in host order, `sequence` and `fail_count` in network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    pub sender: u32,
    pub sequence: u32,
    pub fail_count: u32,
}

impl HeartBeat {
    pub const LEN: usize = 12;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32_ne(self.sender);
        buf.put_u32(self.sequence);
        buf.put_u32(self.fail_count);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> AppResult<HeartBeat> {
        if payload.len() < Self::LEN {
            return Err(MalformedFrame(format!(
                "heart payload of {} bytes, expected {}",
                payload.len(),
                Self::LEN
            )));
        }
        Ok(HeartBeat {
            sender: payload.get_u32_ne(),
            sequence: payload.get_u32(),
            fail_count: payload.get_u32(),
        })
    }

    /// The echo a peer sends back: same sender, next sequence.
    pub fn echo(&self) -> HeartBeat {
        HeartBeat {
            sequence: self.sequence.wrapping_add(1),
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_header_byte_order() {
        let buf = encode(b"ping", ControlKind::HEART_TAG);
        assert_eq!(&buf[..4], &12u32.to_be_bytes());
        assert_eq!(&buf[4..8], &ControlKind::HEART_TAG.to_ne_bytes());
        assert_eq!(&buf[8..], b"ping");
    }

    #[rstest]
    #[case::empty_data(b"".to_vec(), DATA_TAG)]
    #[case::text_data(b"hello world".to_vec(), DATA_TAG)]
    #[case::hello(Vec::new(), ControlKind::HELLO_TAG)]
    #[case::unknown_tag(vec![0u8; 300], 0xDEAD_BEEF)]
    fn test_encode_then_decode(#[case] payload: Vec<u8>, #[case] tag: u32) {
        let buf = encode(&payload, tag);
        let decoded = decode(&buf);
        assert!(decoded.complete);
        assert_eq!(decoded.total_len as usize, HEADER_LEN + payload.len());
        assert_eq!(decoded.tag, tag);
        assert_eq!(decoded.payload, &payload[..]);
    }

    #[test]
    fn test_decode_short_input_is_incomplete() {
        let decoded = decode(&[0, 0, 0]);
        assert!(!decoded.complete);
        assert_eq!(decoded.total_len, 0);

        let buf = encode(b"abcdef", DATA_TAG);
        let decoded = decode(&buf[..10]);
        assert!(!decoded.complete);
        assert_eq!(decoded.total_len, 14);
        assert_eq!(decoded.payload, b"ab");
    }

    #[test]
    fn test_decode_undersized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u32_ne(DATA_TAG);
        let decoded = decode(&buf);
        assert!(!decoded.complete);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() -> AppResult<()> {
        let mut buffer = encode(b"one", DATA_TAG);
        buffer.extend_from_slice(&encode(b"two", ControlKind::QUIT_TAG)[..5]);

        let frame = Frame::parse(&mut buffer, DEFAULT_MAX_CACHE_SIZE)?.unwrap();
        assert_eq!(frame, Frame::data(&b"one"[..]));
        assert_eq!(buffer.len(), 5);
        assert!(Frame::parse(&mut buffer, DEFAULT_MAX_CACHE_SIZE)?.is_none());
        Ok(())
    }

    #[test]
    fn test_parse_rejects_oversized_frame() {
        let mut buffer = encode(&[7u8; 64], DATA_TAG);
        let result = Frame::parse(&mut buffer, 32);
        assert!(matches!(result, Err(FrameTooLarge(_))));
        assert_eq!(buffer.len(), 72);
    }

    #[test]
    fn test_heartbeat_layout() -> AppResult<()> {
        let beat = HeartBeat {
            sender: 0x0102_0304,
            sequence: 7,
            fail_count: 1,
        };
        let bytes = beat.encode();
        assert_eq!(&bytes[..4], &0x0102_0304u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &[0, 0, 0, 7]);
        assert_eq!(&bytes[8..], &[0, 0, 0, 1]);
        assert_eq!(HeartBeat::decode(&bytes)?, beat);
        assert_eq!(beat.echo().sequence, 8);
        assert!(HeartBeat::decode(&bytes[..11]).is_err());
        Ok(())
    }

    #[test]
    fn test_heartbeat_sequence_wraps() {
        let beat = HeartBeat {
            sender: 1,
            sequence: u32::MAX,
            fail_count: 0,
        };
        assert_eq!(beat.echo().sequence, 0);
    }

    #[test]
    fn test_control_tags_are_distinct() {
        for kind in [ControlKind::Hello, ControlKind::Heart, ControlKind::Quit] {
            assert_ne!(kind.tag(), DATA_TAG);
            assert_eq!(ControlKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(ControlKind::from_tag(DATA_TAG), None);
    }
}
