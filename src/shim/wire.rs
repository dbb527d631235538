//! Payload layouts for the keystore messages the shim understands.
//!
//! Only the sign-by-public-key exchange is interpreted; every other wire
//! type is opaque to the shim. Variable-length fields are prefixed with a
//! `u64` little-endian byte count.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::shim::codec::Frame;

/// Request for an Ed25519 signature by public key (intercepted).
pub const SIGN_BY_PUBLIC_KEY_REQUEST: u32 = 0x0000_0240;
/// Response carrying the 64 byte signature.
pub const SIGN_BY_PUBLIC_KEY_RESPONSE: u32 = 0x0000_0241;
/// Generic error response carrying a UTF-8 message.
pub const ERROR_RESPONSE: u32 = 0xff00_0001;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 public key identifying the signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

/// Ed25519 signature bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_LEN]);

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = FrameError;

    fn try_from(bytes: &[u8]) -> Result<Self, FrameError> {
        let array: [u8; SIGNATURE_LEN] =
            bytes.try_into().map_err(|_| FrameError::Truncated {
                wire_type: SIGN_BY_PUBLIC_KEY_RESPONSE,
                reason: format!("signature must be {SIGNATURE_LEN} bytes, got {}", bytes.len()),
            })?;
        Ok(Self(array))
    }
}

/// Decoded sign-by-public-key request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignByPublicKeyRequest {
    pub public_key: PublicKey,
    pub message: Bytes,
}

impl SignByPublicKeyRequest {
    /// Decode the request payload of `frame`.
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        if frame.wire_type != SIGN_BY_PUBLIC_KEY_REQUEST {
            return Err(FrameError::UnexpectedWireType {
                expected: SIGN_BY_PUBLIC_KEY_REQUEST,
                actual: frame.wire_type,
            });
        }
        let mut payload = frame.payload.clone();
        if payload.remaining() < PUBLIC_KEY_LEN {
            return Err(truncated(frame.wire_type, "public key"));
        }
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        payload.copy_to_slice(&mut public_key);
        let message = read_sized(&mut payload, frame.wire_type, "message")?;
        Ok(Self {
            public_key: PublicKey(public_key),
            message,
        })
    }

    /// Serialize as a request frame with the given message id.
    pub fn to_frame(&self, message_id: u64) -> Result<Frame, FrameError> {
        let mut payload = BytesMut::with_capacity(PUBLIC_KEY_LEN + 8 + self.message.len());
        payload.extend_from_slice(&self.public_key.0);
        payload.put_u64_le(self.message.len() as u64);
        payload.extend_from_slice(&self.message);
        Frame::new(SIGN_BY_PUBLIC_KEY_REQUEST, message_id, payload.freeze())
    }
}

/// Synthesized success reply for an intercepted request.
pub fn signature_response(message_id: u64, signature: &Signature) -> Result<Frame, FrameError> {
    Frame::new(
        SIGN_BY_PUBLIC_KEY_RESPONSE,
        message_id,
        Bytes::copy_from_slice(&signature.0),
    )
}

/// Synthesized error reply for an intercepted request.
pub fn error_response(message_id: u64, message: &str) -> Result<Frame, FrameError> {
    let mut payload = BytesMut::with_capacity(8 + message.len());
    payload.put_u64_le(message.len() as u64);
    payload.extend_from_slice(message.as_bytes());
    Frame::new(ERROR_RESPONSE, message_id, payload.freeze())
}

/// Decode the signature carried by a success reply.
pub fn decode_signature_response(frame: &Frame) -> Result<Signature, FrameError> {
    if frame.wire_type != SIGN_BY_PUBLIC_KEY_RESPONSE {
        return Err(FrameError::UnexpectedWireType {
            expected: SIGN_BY_PUBLIC_KEY_RESPONSE,
            actual: frame.wire_type,
        });
    }
    Signature::try_from(frame.payload.as_ref())
}

/// Decode the message carried by an error reply.
pub fn decode_error_response(frame: &Frame) -> Result<String, FrameError> {
    if frame.wire_type != ERROR_RESPONSE {
        return Err(FrameError::UnexpectedWireType {
            expected: ERROR_RESPONSE,
            actual: frame.wire_type,
        });
    }
    let mut payload = frame.payload.clone();
    let bytes = read_sized(&mut payload, frame.wire_type, "error message")?;
    String::from_utf8(bytes.to_vec()).map_err(|e| FrameError::Truncated {
        wire_type: frame.wire_type,
        reason: format!("error message is not UTF-8: {e}"),
    })
}

fn read_sized(payload: &mut Bytes, wire_type: u32, field: &str) -> Result<Bytes, FrameError> {
    if payload.remaining() < 8 {
        return Err(truncated(wire_type, field));
    }
    let len = payload.get_u64_le();
    let len = usize::try_from(len).map_err(|_| truncated(wire_type, field))?;
    if payload.remaining() < len {
        return Err(truncated(wire_type, field));
    }
    Ok(payload.split_to(len))
}

fn truncated(wire_type: u32, field: &str) -> FrameError {
    FrameError::Truncated {
        wire_type,
        reason: format!("missing {field}"),
    }
}
