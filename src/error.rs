//! Error types for the hosting envoy.

use std::time::Duration;

/// Top-level error type for the envoy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Shim error: {0}")]
    Shim(#[from] ShimError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Service log error: {0}")]
    ServiceLog(#[from] ServiceLogError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Keystore wire-format errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame length {length} is shorter than the {header} byte header")]
    LengthTooSmall { length: usize, header: usize },

    #[error("Frame length {length} exceeds the maximum of {max} bytes")]
    LengthTooLarge { length: usize, max: usize },

    #[error("Truncated payload for wire type {wire_type:#010x}: {reason}")]
    Truncated { wire_type: u32, reason: String },

    #[error("Unexpected wire type {actual:#010x}, expected {expected:#010x}")]
    UnexpectedWireType { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream-interception proxy errors.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("Failed to bind shim socket {path}: {reason}")]
    BindFailed { path: String, reason: String },

    #[error("Failed to connect to keystore socket {path}: {reason}")]
    KeystoreUnavailable { path: String, reason: String },
}

/// Delegated-signing errors. The display text is what the signing caller sees.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SigningError {
    #[error("Agent {agent} cannot sign requests because they are anonymous")]
    AnonymousSigner { agent: String },

    #[error("Failed to get signature for request #{request_id} within {timeout:?}")]
    Timeout { request_id: u64, timeout: Duration },

    #[error("Failed to dispatch signing request #{request_id}: {reason}")]
    Dispatch { request_id: u64, reason: String },

    #[error("Signing request #{request_id} was abandoned")]
    Abandoned { request_id: u64 },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid agent id {agent}: {reason}")]
    InvalidAgent { agent: String, reason: String },
}

/// Result of a single write to an append-only log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The log moved since the write was prepared; the write is retried.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Write failed: {0}")]
    Failure(String),

    #[error("Write queue is closed")]
    QueueClosed,
}

impl WriteError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Service logger bookkeeping errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceLogError {
    #[error("No pending confirmation for response #{0}")]
    UnknownConfirmation(u64),

    #[error("Invalid service log payload: {0}")]
    InvalidPayload(String),
}

/// Conductor backend call errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {target} is not connected: {reason}")]
    NotConnected { target: String, reason: String },

    #[error("Backend call {method} on {target} timed out after {timeout:?}")]
    Timeout {
        target: String,
        method: String,
        timeout: Duration,
    },

    #[error("Failed to get signatures from Client")]
    SigningFailed,

    #[error("Backend {target} returned error for {method}: {message}")]
    Remote {
        target: String,
        method: String,
        message: String,
    },

    #[error("Invalid response from {target}: {reason}")]
    InvalidResponse { target: String, reason: String },
}

impl BackendError {
    /// Message text returned by the conductor, if the error came from it.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Whether the conductor rejected a commit because the chain moved
    /// underneath it.
    pub fn is_head_moved(&self) -> bool {
        self.remote_message()
            .is_some_and(|m| m.contains("source chain head has moved"))
    }
}

impl From<BackendError> for WriteError {
    fn from(err: BackendError) -> Self {
        if err.is_head_moved() {
            Self::Conflict(err.to_string())
        } else {
            Self::Failure(err.to_string())
        }
    }
}

/// RPC dispatcher errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("Already registered event: {0}")]
    EventAlreadyRegistered(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Failed to start RPC server on {addr}: {reason}")]
    StartupFailed { addr: String, reason: String },
}

impl RpcError {
    /// JSON-RPC 2.0 error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => -32700,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::EventAlreadyRegistered(_)
            | Self::UnknownEvent(_)
            | Self::Internal(_)
            | Self::StartupFailed { .. } => -32000,
        }
    }
}

/// Result type alias for the envoy.
pub type Result<T> = std::result::Result<T, Error>;
