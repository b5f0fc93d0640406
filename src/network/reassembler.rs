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

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::network::frame::{Frame, FrameHeader, HEADER_LEN};
use crate::AppResult;

/// Turns an arbitrarily fragmented TCP byte stream back into frames.
///
/// Bytes that do not yet form a complete frame are carried over in `cache` between
/// reads. The cache never holds more than `max_cache_size` bytes: a header announcing a
/// larger frame is treated as corruption, the cache is dropped and the rest of that read
/// is discarded. No attempt is made to find the next frame boundary afterwards.
#[derive(Debug)]
pub struct StreamReassembler {
    cache: BytesMut,
    max_cache_size: usize,
    dropped_bytes: u64,
}

impl StreamReassembler {
    pub fn new(max_cache_size: usize) -> Self {
        StreamReassembler {
            cache: BytesMut::new(),
            max_cache_size,
            dropped_bytes: 0,
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }

    /// Total number of bytes thrown away because of corrupt length headers.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Consumes one read worth of bytes, handing every completed frame to `on_frame` in
    /// stream order. Returns the number of frames emitted.
    ///
    /// On a corrupt header the frames completed before it have already been emitted, the
    /// cache is empty and the error describes the offending length.
    pub fn feed<F>(&mut self, mut input: &[u8], mut on_frame: F) -> AppResult<usize>
    where
        F: FnMut(Frame),
    {
        let mut frames = 0;
        loop {
            if !self.cache.is_empty() {
                // finish the header first
                if self.cache.len() < HEADER_LEN {
                    let take = (HEADER_LEN - self.cache.len()).min(input.len());
                    self.cache.extend_from_slice(&input[..take]);
                    input = &input[take..];
                }
                let Some(header) = FrameHeader::peek(&self.cache) else {
                    return Ok(frames);
                };
                if let Err(e) = header.validate(self.max_cache_size) {
                    self.discard(input.len());
                    return Err(e);
                }

                let missing = header.total_len as usize - self.cache.len();
                if input.len() < missing {
                    self.cache.reserve(missing);
                    self.cache.extend_from_slice(input);
                    return Ok(frames);
                }
                self.cache.extend_from_slice(&input[..missing]);
                input = &input[missing..];

                let mut raw = self.cache.split();
                raw.advance(HEADER_LEN);
                on_frame(Frame {
                    tag: header.tag,
                    payload: raw.freeze(),
                });
                frames += 1;
                continue;
            }

            if input.is_empty() {
                return Ok(frames);
            }
            let Some(header) = FrameHeader::peek(input) else {
                self.cache.extend_from_slice(input);
                return Ok(frames);
            };
            if let Err(e) = header.validate(self.max_cache_size) {
                self.discard(input.len());
                return Err(e);
            }
            let total_len = header.total_len as usize;
            if input.len() < total_len {
                self.cache.reserve(total_len);
                self.cache.extend_from_slice(input);
                return Ok(frames);
            }
            on_frame(Frame {
                tag: header.tag,
                payload: Bytes::copy_from_slice(&input[HEADER_LEN..total_len]),
            });
            frames += 1;
            input = &input[total_len..];
        }
    }

    fn discard(&mut self, unread: usize) {
        let dropped = self.cache.len() + unread;
        trace!(
            "dropping {} cached and {} unread bytes after corrupt header",
            self.cache.len(),
            unread
        );
        self.dropped_bytes += dropped as u64;
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::network::frame::{encode, ControlKind, DATA_TAG};
    use crate::AppError;

    fn collect(reassembler: &mut StreamReassembler, input: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        reassembler.feed(input, |frame| out.push(frame)).unwrap();
        out
    }

    #[test]
    fn test_whole_frames_in_one_read() {
        let mut stream = encode(b"first", DATA_TAG);
        stream.extend_from_slice(&encode(b"", ControlKind::QUIT_TAG));
        stream.extend_from_slice(&encode(b"third", DATA_TAG));

        let mut reassembler = StreamReassembler::new(1024);
        let frames = collect(&mut reassembler, &stream);
        assert_eq!(
            frames,
            vec![
                Frame::data(&b"first"[..]),
                Frame::control(ControlKind::Quit, Bytes::new()),
                Frame::data(&b"third"[..]),
            ]
        );
        assert_eq!(reassembler.cached_len(), 0);
    }

    #[test]
    fn test_frame_straddling_reads() {
        let stream = encode(b"abcdefgh", DATA_TAG);
        let mut reassembler = StreamReassembler::new(1024);

        assert!(collect(&mut reassembler, &stream[..11]).is_empty());
        assert_eq!(reassembler.cached_len(), 11);
        let frames = collect(&mut reassembler, &stream[11..]);
        assert_eq!(frames, vec![Frame::data(&b"abcdefgh"[..])]);
        assert_eq!(reassembler.cached_len(), 0);
    }

    #[test]
    fn test_tail_of_cached_frame_followed_by_next_frame() {
        let mut stream = encode(b"one", DATA_TAG);
        stream.extend_from_slice(&encode(b"two", DATA_TAG));
        let mut reassembler = StreamReassembler::new(1024);

        assert!(collect(&mut reassembler, &stream[..4]).is_empty());
        let frames = collect(&mut reassembler, &stream[4..]);
        assert_eq!(
            frames,
            vec![Frame::data(&b"one"[..]), Frame::data(&b"two"[..])]
        );
    }

    #[test]
    fn test_split_header_then_single_bytes() {
        let stream = encode(b"split header", DATA_TAG);
        let mut reassembler = StreamReassembler::new(1024);

        let mut frames = collect(&mut reassembler, &stream[..3]);
        for byte in &stream[3..] {
            frames.extend(collect(&mut reassembler, std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![Frame::data(&b"split header"[..])]);
    }

    #[test]
    fn test_oversized_header_drops_cache() {
        let mut reassembler = StreamReassembler::new(64);
        let mut bogus = BytesMut::new();
        bogus.put_u32(1_000);
        bogus.put_u32_ne(DATA_TAG);

        // header arrives in two pieces so the corrupt length is seen on the cache path
        assert!(collect(&mut reassembler, &bogus[..5]).is_empty());
        let result = reassembler.feed(&bogus[5..], |_| panic!("no frame expected"));
        assert!(matches!(result, Err(AppError::FrameTooLarge(_))));
        assert_eq!(reassembler.cached_len(), 0);
        assert_eq!(reassembler.dropped_bytes(), 8);
    }

    #[test]
    fn test_corruption_keeps_earlier_frames() {
        let mut stream = encode(b"good", DATA_TAG);
        stream.put_u32(2);
        stream.put_u32_ne(DATA_TAG);
        stream.extend_from_slice(&encode(b"lost", DATA_TAG));

        let mut reassembler = StreamReassembler::new(1024);
        let mut out = Vec::new();
        let result = reassembler.feed(&stream, |frame| out.push(frame));
        assert!(matches!(result, Err(AppError::MalformedFrame(_))));
        assert_eq!(out, vec![Frame::data(&b"good"[..])]);
        assert_eq!(reassembler.cached_len(), 0);
    }
}
