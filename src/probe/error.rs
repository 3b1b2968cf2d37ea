use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decode failures raised by the byte codec. Never panics, never reads past
/// the end of the buffer it was handed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes at offset {offset}, {available} available")]
    Short {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("{0}")]
    Malformed(&'static str),
}

/// Everything that can end a probe early.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("DNS resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("{0}")]
    ProtocolMismatch(String),

    #[error("malformed response: {0}")]
    Malformed(#[from] CodecError),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("service refused request: {0}")]
    ServiceError(String),

    #[error("adapter fault: {0}")]
    AdapterFault(String),
}

impl ProbeError {
    pub fn mismatch(message: impl Into<String>) -> Self {
        ProbeError::ProtocolMismatch(message.into())
    }

    pub fn malformed(what: &'static str) -> Self {
        ProbeError::Malformed(CodecError::Malformed(what))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ProbeError::Dns { .. } | ProbeError::ConnectionRefused { .. } | ProbeError::Transport(_) => {
                ErrorKind::TransportError
            }
            ProbeError::Timeout => ErrorKind::Timeout,
            ProbeError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            ProbeError::Malformed(_) => ErrorKind::MalformedResponse,
            ProbeError::AuthRequired(_) => ErrorKind::AuthRequired,
            ProbeError::AuthFailed(_) => ErrorKind::AuthFailed,
            ProbeError::ServiceError(_) => ErrorKind::ServiceError,
            ProbeError::AdapterFault(_) => ErrorKind::AdapterFault,
        }
    }
}

/// Stable error classification carried by every failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    TransportError,
    Timeout,
    ProtocolMismatch,
    MalformedResponse,
    AuthRequired,
    AuthFailed,
    ServiceError,
    AdapterFault,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ProtocolMismatch => "ProtocolMismatch",
            ErrorKind::MalformedResponse => "MalformedResponse",
            ErrorKind::AuthRequired => "AuthRequired",
            ErrorKind::AuthFailed => "AuthFailed",
            ErrorKind::ServiceError => "ServiceError",
            ErrorKind::AdapterFault => "AdapterFault",
        };
        write!(f, "{}", name)
    }
}
