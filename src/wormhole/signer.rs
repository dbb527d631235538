//! Signer identities and their text encodings.
//!
//! Agents identify themselves with a multibase string: a `u` followed by
//! unpadded base64url. Two payloads are accepted: the bare 32 byte Ed25519
//! key, or the 39 byte agent hash (3 byte type prefix, key, 4 byte
//! location). Keys are always printed in the bare form.

use std::fmt;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

use crate::error::SigningError;
use crate::shim::wire::{PUBLIC_KEY_LEN, PublicKey, SIGNATURE_LEN, Signature};

/// base64url without padding on output, padding optional on input.
pub const MULTIBASE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const MULTIBASE_PREFIX: char = 'u';

/// Type prefix of an agent hash.
pub const AGENT_HASH_PREFIX: [u8; 3] = [0x84, 0x20, 0x24];
const AGENT_HASH_LEN: usize = AGENT_HASH_PREFIX.len() + PUBLIC_KEY_LEN + 4;

/// Encode bytes as `u` + base64url.
pub fn encode_multibase(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(1 + bytes.len().div_ceil(3) * 4);
    out.push(MULTIBASE_PREFIX);
    MULTIBASE.encode_string(bytes, &mut out);
    out
}

/// Decode a `u` + base64url string. The prefix is optional.
pub fn decode_multibase(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let body = text.strip_prefix(MULTIBASE_PREFIX).unwrap_or(text);
    MULTIBASE.decode(body)
}

/// Public key of a remote signer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignerKey(PublicKey);

impl SignerKey {
    pub fn new(key: PublicKey) -> Self {
        Self(key)
    }

    /// Parse an agent id as sent by clients.
    pub fn parse(agent_id: &str) -> Result<Self, SigningError> {
        let invalid = |reason: String| SigningError::InvalidAgent {
            agent: agent_id.to_string(),
            reason,
        };
        let bytes = decode_multibase(agent_id).map_err(|e| invalid(e.to_string()))?;
        let key = match bytes.len() {
            PUBLIC_KEY_LEN => &bytes[..],
            AGENT_HASH_LEN if bytes[..3] == AGENT_HASH_PREFIX => &bytes[3..3 + PUBLIC_KEY_LEN],
            AGENT_HASH_LEN => return Err(invalid("not an agent hash".to_string())),
            n => return Err(invalid(format!("unexpected key length {n}"))),
        };
        let mut raw = [0u8; PUBLIC_KEY_LEN];
        raw.copy_from_slice(key);
        Ok(Self(PublicKey(raw)))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.0
    }
}

impl From<PublicKey> for SignerKey {
    fn from(key: PublicKey) -> Self {
        Self(key)
    }
}

impl fmt::Display for SignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_multibase(&self.0.0))
    }
}

impl fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerKey({self})")
    }
}

/// Decode a signature returned by a client.
pub fn decode_signature(text: &str) -> Result<Signature, SigningError> {
    let bytes =
        decode_multibase(text).map_err(|e| SigningError::InvalidSignature(e.to_string()))?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(SigningError::InvalidSignature(format!(
            "expected {SIGNATURE_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Signature::try_from(bytes.as_slice()).map_err(|e| SigningError::InvalidSignature(e.to_string()))
}

pub fn encode_signature(signature: &Signature) -> String {
    encode_multibase(&signature.0)
}
