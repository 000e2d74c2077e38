//! Content-Length framing codec.
//!
//! Frames are `Content-Length: <N>\r\n\r\n` followed by exactly `N` bytes of
//! UTF-8 JSON, where `N` counts bytes. Works over any AsyncRead/AsyncWrite via
//! `FramedRead`/`FramedWrite`.
//!
//! Recoverable framing problems (bad header, oversized body) are yielded as
//! [`Frame::Malformed`] rather than errors: a decoder error terminates a
//! `FramedRead` stream, and one bad frame must not end the read loop.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::bridge::protocol::{Request, encode_request};
use crate::error::BridgeError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Header sections longer than this are treated as garbage and dropped.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// One decoded unit from the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete frame body.
    Payload(Bytes),
    /// A frame that was dropped; the reason is for logging.
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Body bytes of an oversized frame still to be skipped.
    discarding: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            discarding: 0,
        }
    }

    fn skip_discarded(&mut self, src: &mut BytesMut) {
        let n = self.discarding.min(src.len());
        src.advance(n);
        self.discarding -= n;
    }
}

/// Parse the header block (without the terminator) into a content length.
fn parse_content_length(header: &[u8]) -> Result<usize, String> {
    let text =
        std::str::from_utf8(header).map_err(|_| "header section is not ASCII".to_string())?;

    let mut content_length = None;
    for line in text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            return Err(format!("malformed header line: {line:?}"));
        };
        // Other headers (e.g. Content-Type) are ignored.
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid Content-Length value: {:?}", value.trim()))?;
            content_length = Some(len);
        }
    }

    content_length.ok_or_else(|| "missing Content-Length header".to_string())
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.discarding > 0 {
            self.skip_discarded(src);
            if self.discarding > 0 {
                return Ok(None);
            }
        }

        let Some(header_end) = find_terminator(src) else {
            if src.len() > MAX_HEADER_BYTES {
                let dropped = src.len();
                src.clear();
                return Ok(Some(Frame::Malformed(format!(
                    "no header terminator within {dropped} bytes"
                ))));
            }
            return Ok(None);
        };

        let body_start = header_end + HEADER_TERMINATOR.len();
        let content_length = match parse_content_length(&src[..header_end]) {
            Ok(len) => len,
            Err(reason) => {
                src.advance(body_start);
                return Ok(Some(Frame::Malformed(reason)));
            }
        };

        if content_length > self.max_frame_bytes {
            src.advance(body_start);
            self.discarding = content_length;
            self.skip_discarded(src);
            return Ok(Some(Frame::Malformed(format!(
                "Content-Length {content_length} exceeds maximum {}",
                self.max_frame_bytes
            ))));
        }

        let frame_len = body_start + content_length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(body_start);
        let body = src.split_to(content_length).freeze();
        tracing::trace!(content_length, "Decoded frame");
        Ok(Some(Frame::Payload(body)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > self.max_frame_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds maximum {}",
                    body.len(),
                    self.max_frame_bytes
                ),
            ));
        }
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        tracing::trace!(content_length = body.len(), "Encoded frame");
        Ok(())
    }
}

/// Encode a request into a complete frame (header + body).
pub fn encode_frame(request: &Request) -> Result<BytesMut, BridgeError> {
    let body = encode_request(request)?;
    let mut codec = FrameCodec::new(usize::MAX);
    let mut dst = BytesMut::new();
    codec
        .encode(Bytes::from(body), &mut dst)
        .map_err(|e| BridgeError::transport_io("failed to frame request", e))?;
    Ok(dst)
}
