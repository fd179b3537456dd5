use thiserror::Error;

use crate::envelope::MAX_FRAME_BYTES;

/// Errors produced by the gateway protocol layer.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("oversized frame: {0} bytes (max {MAX_FRAME_BYTES})")]
    Oversized(usize),

    #[error("rate limited")]
    RateLimited,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("transport closed")]
    Closed,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type GateResult<T> = Result<T, GateError>;
