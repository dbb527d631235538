//! Framing for the keystore wire protocol.
//!
//! Every message on a keystore stream starts with a fixed 16 byte header,
//! all fields little endian:
//!
//! ```text
//! +-----------+-----------+----------------+------------------+
//! | frame_len | wire_type |   message_id   |     payload      |
//! |   u32     |   u32     |      u64       | frame_len - 16 B |
//! +-----------+-----------+----------------+------------------+
//! ```
//!
//! `frame_len` counts the header too. The format has no sync marker, so a
//! bad length cannot be recovered from and ends the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Default upper bound for a single decoded frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// One keystore protocol message.
///
/// The exact bytes the frame was decoded from are retained, so forwarding a
/// frame never re-serializes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u64,
    pub wire_type: u32,
    pub payload: Bytes,
    raw: Bytes,
}

impl Frame {
    /// Build a new frame, serializing the header.
    ///
    /// Fails when the frame length does not fit the header's `u32` field.
    pub fn new(
        wire_type: u32,
        message_id: u64,
        payload: impl Into<Bytes>,
    ) -> Result<Self, FrameError> {
        let payload = payload.into();
        let frame_len = encoded_frame_len(payload.len())?;
        let mut raw = BytesMut::with_capacity(HEADER_LEN + payload.len());
        raw.put_u32_le(frame_len);
        raw.put_u32_le(wire_type);
        raw.put_u64_le(message_id);
        raw.extend_from_slice(&payload);
        Ok(Self {
            message_id,
            wire_type,
            payload,
            raw: raw.freeze(),
        })
    }

    /// Parse a complete frame from exactly `raw`.
    fn from_raw(raw: Bytes) -> Self {
        let mut header = &raw[4..HEADER_LEN];
        let wire_type = header.get_u32_le();
        let message_id = header.get_u64_le();
        let payload = raw.slice(HEADER_LEN..);
        Self {
            message_id,
            wire_type,
            payload,
            raw,
        }
    }

    /// Wire bytes of this frame, header included.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_raw(self) -> Bytes {
        self.raw
    }
}

/// Header `frame_len` value for a payload of `payload_len` bytes.
fn encoded_frame_len(payload_len: usize) -> Result<u32, FrameError> {
    let too_large = || FrameError::LengthTooLarge {
        length: payload_len.saturating_add(HEADER_LEN),
        max: u32::MAX as usize,
    };
    let length = HEADER_LEN.checked_add(payload_len).ok_or_else(too_large)?;
    u32::try_from(length).map_err(|_| too_large())
}

/// Read the declared frame length, if enough bytes are buffered.
fn peek_frame_len(src: &BytesMut) -> Option<usize> {
    if src.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize)
}

/// Decoder/encoder for whole [`Frame`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(length) = peek_frame_len(src) else {
            return Ok(None);
        };
        if length < HEADER_LEN {
            return Err(FrameError::LengthTooSmall {
                length,
                header: HEADER_LEN,
            });
        }
        if length > self.max_frame_len {
            return Err(FrameError::LengthTooLarge {
                length,
                max: self.max_frame_len,
            });
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        Ok(Some(Frame::from_raw(src.split_to(length).freeze())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.raw.len() > self.max_frame_len {
            return Err(FrameError::LengthTooLarge {
                length: frame.raw.len(),
                max: self.max_frame_len,
            });
        }
        dst.extend_from_slice(frame.raw());
        Ok(())
    }
}

/// Splits a byte stream on frame boundaries without interpreting frames.
///
/// Used for the keystore to backend leg, which is relayed untouched. Chunks
/// are whole frames so an injected reply is never written into the middle
/// of one. Frames above `max_frame_len` are streamed through in pieces and
/// a length below the header size gives up on alignment; neither case is
/// an error, the bytes still pass through unchanged.
#[derive(Debug, Clone)]
pub struct RawFrameCodec {
    max_frame_len: usize,
    remaining: usize,
}

impl RawFrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            remaining: 0,
        }
    }
}

impl Decoder for RawFrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, std::io::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if self.remaining > 0 {
            let n = self.remaining.min(src.len());
            self.remaining -= n;
            return Ok(Some(src.split_to(n).freeze()));
        }
        let Some(length) = peek_frame_len(src) else {
            return Ok(None);
        };
        if length < HEADER_LEN {
            return Ok(Some(src.split().freeze()));
        }
        if length > self.max_frame_len {
            let n = length.min(src.len());
            self.remaining = length - n;
            return Ok(Some(src.split_to(n).freeze()));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, std::io::Error> {
        match self.decode(src)? {
            Some(chunk) => Ok(Some(chunk)),
            None if src.is_empty() => Ok(None),
            None => Ok(Some(src.split().freeze())),
        }
    }
}
