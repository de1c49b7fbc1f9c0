//! Error types for the controller.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{Opcode, Status};

/// Codec errors. Pure functions, no I/O involved.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame size: {0} (expected 4096)")]
    BadFrameSize(usize),

    #[error("payload length {0} exceeds 4088")]
    PayloadLengthOutOfRange(usize),

    #[error("payload of {0} bytes does not fit in one frame (max 4088)")]
    PayloadTooLarge(usize),

    #[error("unknown status byte 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
}

/// Errors raised by a session exchange.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A frame could not be decoded. Fatal.
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// The counterpart went away in the middle of a read. Fatal.
    #[error("connection closed by agent")]
    ConnectionClosed,

    /// A status that is not legal for the exchange in progress. Fatal.
    #[error("protocol violation: {status:?} is not legal for {opcode:?} {stage}")]
    ProtocolViolation {
        opcode: Opcode,
        status: Status,
        stage: &'static str,
    },

    /// The counterpart answered ERROR to a well-formed request. Recoverable.
    #[error("{0}")]
    CommandFailed(String),

    /// A request was refused locally before any byte went out. Recoverable.
    #[error("request not sent: {0}")]
    NotSent(FrameError),

    /// A bounded wait expired mid-exchange. Fatal.
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the session must end. Only an agent ERROR reply or a request
    /// that was never sent leaves the connection in a known state.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CommandFailed(_) | Self::NotSent(_))
    }
}

/// Why a connection did not authenticate.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("wrong secret (received {received})")]
    Mismatch { received: String },

    #[error("no secret within {0:?}")]
    Timeout(Duration),

    #[error("agent disconnected during handshake")]
    Disconnected,

    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Operator input that does not map to a command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}\nType 'help' for available commands")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("unterminated quote in command line")]
    UnterminatedQuote,

    #[error("no character after trailing backslash")]
    TrailingEscape,

    #[error("Hex pattern must have even number of characters")]
    OddHexLength,

    #[error("Invalid hex character '{0}' in pattern")]
    InvalidHexChar(char),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
