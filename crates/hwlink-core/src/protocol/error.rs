//! Transport and link errors

use thiserror::Error;

use super::{StatusCode, TransportState};

/// Failures raised by a physical link adapter
#[derive(Error, Debug)]
pub enum LinkError {
    /// Serial port driver failure
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Write attempted before connect or after disconnect
    #[error("Link is not open")]
    NotOpen,

    /// Chunk larger than the link's packet size
    #[error("Chunk of {len} bytes exceeds packet size {max}")]
    PacketTooLarge {
        /// Chunk length
        len: usize,
        /// Packet size
        max: usize,
    },

    /// Inbound channel receiver is gone
    #[error("Link channel closed")]
    Closed,

    /// Backend-specific failure
    #[error("Link error: {0}")]
    Other(String),
}

/// Errors returned to callers of the transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Physical transmission or reception failed
    #[error("Link failure: {0}")]
    Link(#[from] LinkError),

    /// Deadline elapsed before the response was reassembled
    #[error("Exchange timed out")]
    Timeout,

    /// Device answered with a non-success status
    #[error("Device returned status {code}")]
    Status {
        /// Status word as reported
        code: StatusCode,
    },

    /// Transport not ready, or the link went away mid-operation
    #[error("Not connected to device")]
    Disconnected,

    /// Framing corruption
    #[error("Malformed frame: {0}")]
    Protocol(String),

    /// Another exchange or raw read is outstanding
    #[error("Another exchange is already in flight")]
    Busy,

    /// Caller abandoned the operation (empty passcode)
    #[error("Operation cancelled")]
    Cancelled,

    /// Payload cannot be encoded for this link
    #[error("Payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Largest encodable length
        max: usize,
    },

    /// Lifecycle call made in the wrong state
    #[error("Invalid transport state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        /// State the call requires
        expected: TransportState,
        /// State the transport was in
        actual: TransportState,
    },

    /// `connect` on a transport that is not disconnected
    #[error("Already connected")]
    AlreadyConnected,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Device status carried by this error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Status { code } => Some(*code),
            _ => None,
        }
    }

    /// Whether the caller may reasonably retry the same operation
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Busy)
    }
}
