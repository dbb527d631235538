//! Keystore shim: a framed relay that intercepts signing requests.

pub mod codec;
pub mod proxy;
pub mod wire;

pub use codec::{DEFAULT_MAX_FRAME_LEN, Frame, FrameCodec, HEADER_LEN, RawFrameCodec};
pub use proxy::{KeystoreFallback, Shim, SigningHandler, SigningOutcome, relay_connection};
pub use wire::{PublicKey, SignByPublicKeyRequest, Signature};
