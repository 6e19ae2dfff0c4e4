//! Error categories shared by every subsystem.
//!
//! Each variant family corresponds to one of the error categories the
//! design calls out: invalid argument, I/O, format, resource exhaustion,
//! protocol, and logic inconsistency. The transfer state machine treats
//! `Protocol` errors as locally recoverable and does not propagate them as
//! fatal unless the retry budget is exhausted.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OasisError>;

#[derive(Error, Debug)]
pub enum OasisError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("inconsistent: {0}")]
    Inconsistent(String),
}

impl OasisError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        OasisError::InvalidArgument(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        OasisError::Format(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        OasisError::ResourceExhausted(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        OasisError::Protocol(msg.into())
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        OasisError::Inconsistent(msg.into())
    }

    /// True for errors the transfer state machine should recover from
    /// locally (retry / resend ACK) rather than surface to the caller.
    pub fn is_protocol(&self) -> bool {
        matches!(self, OasisError::Protocol(_))
    }
}
