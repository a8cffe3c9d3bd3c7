//! Length-prefixed binary frame codec.
//!
//! Wire format: `opcode(2 BE) ‖ length(4 BE) ‖ body(length bytes)`. The
//! header is always exactly 6 bytes. A frame carries one `(opcode, body)`
//! pair; `body` may be empty.
//!
//! [`Codec`] encodes/decodes a single, already-complete buffer. [`Decoder`]
//! is the streaming counterpart: it owns a growable buffer that frames can
//! be fed into piecemeal (one WebSocket binary message may contain several
//! frames, or split one across messages) and extracts whole frames as they
//! become available.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header size in bytes: 2-byte opcode + 4-byte length.
pub const HEADER_LEN: usize = 6;

/// Default ceiling on a single frame's total size (header + body).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

/// Errors returned by [`Codec::decode`] and [`Decoder::next_frame`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer too small to contain a frame header: {len} < {HEADER_LEN}")]
    TooSmall { len: usize },
    #[error("frame size {len} exceeds max frame size {max}")]
    TooLarge { len: usize, max: usize },
    #[error("declared body length {declared} does not match actual buffer length {actual}")]
    LengthMismatch { declared: u32, actual: usize },
}

/// A decoded `(opcode, body)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub body: Bytes,
}

impl Frame {
    pub fn new(opcode: u16, body: impl Into<Bytes>) -> Self {
        Frame {
            opcode,
            body: body.into(),
        }
    }
}

/// Stateless encode/decode of a single complete frame buffer.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_frame_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Codec {
    pub fn new(max_frame_size: usize) -> Self {
        Codec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode `opcode`/`body` into a freshly allocated buffer of exactly
    /// `6 + body.len()` bytes. `body == None` is treated as empty.
    pub fn encode(&self, opcode: u16, body: Option<&[u8]>) -> Vec<u8> {
        let body = body.unwrap_or(&[]);
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u16(opcode);
        out.put_u32(body.len() as u32);
        out.put_slice(body);
        out.to_vec()
    }

    /// Decode a single, already-complete buffer. Fails if the buffer is
    /// shorter than the header, longer than `max_frame_size`, or the
    /// declared body length doesn't match what's actually present.
    pub fn decode(&self, buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TooSmall { len: buf.len() });
        }
        if buf.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                len: buf.len(),
                max: self.max_frame_size,
            });
        }
        let mut header = &buf[..HEADER_LEN];
        let opcode = header.get_u16();
        let declared = header.get_u32();
        let actual_body_len = buf.len() - HEADER_LEN;
        if declared as usize != actual_body_len {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: actual_body_len,
            });
        }
        Ok(Frame::new(opcode, Bytes::copy_from_slice(&buf[HEADER_LEN..])))
    }
}

/// Header fields parsed but whose body hasn't fully arrived yet.
#[derive(Debug, Clone, Copy)]
struct PartialHeader {
    opcode: u16,
    declared_len: u32,
}

/// Streaming frame decoder over an internal growable buffer.
///
/// Feed arbitrary byte chunks via [`Decoder::feed`], then call
/// [`Decoder::next_frame`] in a loop until it returns `Ok(None)` (need
/// more bytes) before feeding again. Never panics on arbitrary input;
/// malformed input surfaces as a typed [`FrameError`].
#[derive(Debug)]
pub struct Decoder {
    max_frame_size: usize,
    buf: BytesMut,
    partial: Option<PartialHeader>,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder {
    pub fn new(max_frame_size: usize) -> Self {
        Decoder {
            max_frame_size,
            buf: BytesMut::new(),
            partial: None,
        }
    }

    /// Append bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempt to extract one complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Once a header has
    /// been consumed, its declared length is remembered (`partial`) across
    /// calls until the full body arrives, so repeated small `feed`s don't
    /// re-parse the header each time.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.partial.is_none() {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let opcode = (&self.buf[0..2]).get_u16();
            let declared_len = (&self.buf[2..6]).get_u32();
            if HEADER_LEN + declared_len as usize > self.max_frame_size {
                return Err(FrameError::TooLarge {
                    len: HEADER_LEN + declared_len as usize,
                    max: self.max_frame_size,
                });
            }
            self.buf.advance(HEADER_LEN);
            self.partial = Some(PartialHeader {
                opcode,
                declared_len,
            });
        }

        let header = self.partial.expect("just ensured partial is Some");
        if self.buf.len() < header.declared_len as usize {
            return Ok(None);
        }

        let body = self.buf.split_to(header.declared_len as usize).freeze();
        self.partial = None;
        Ok(Some(Frame::new(header.opcode, body)))
    }

    /// Drop any buffered bytes and in-progress header state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.partial = None;
    }

    /// Number of bytes currently buffered (for diagnostics/tests).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}
