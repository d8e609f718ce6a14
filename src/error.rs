//! Error types for block transfer operations.

use thiserror::Error;

use crate::messages::MessageError;

/// Result alias for block transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors that can occur while reading a block from a storage node.
///
/// Everything is reported through this tagged channel; nothing in the
/// engine aborts the process for bad input. No retry is performed at this
/// layer, since only the caller can decide whether another replica is worth
/// trying.
#[derive(Debug, Error)]
pub enum TransferError {
    /// I/O failure on the underlying stream (reset, unexpected close).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed or out-of-sequence framing from the server.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Recomputed chunk checksum does not match the server-declared one.
    ///
    /// The session is unusable afterwards; the caller must start a fresh
    /// session, typically against a different replica.
    #[error("checksum mismatch in packet {seqno}, chunk {chunk}")]
    ChecksumMismatch { seqno: u64, chunk: usize },

    /// The server rejected the read request.
    #[error("remote error ({status}): {message}")]
    Remote { status: String, message: String },

    /// The state machine was driven out of order by the caller.
    #[error("invalid reader state: {message}")]
    InvalidState { message: String },

    /// A handshake or acknowledgement record failed to encode or decode.
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl TransferError {
    /// Build a protocol error from anything displayable.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        TransferError::Protocol {
            message: message.into(),
        }
    }

    /// Build a state-misuse error.
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        TransferError::InvalidState {
            message: message.into(),
        }
    }

    /// Whether the error indicates data corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, TransferError::ChecksumMismatch { .. })
    }

    /// Whether the error was caused by misuse of the reader.
    pub fn is_misuse(&self) -> bool {
        matches!(self, TransferError::InvalidState { .. })
    }
}
