//! Handshake and acknowledgement records for the block read protocol.
//!
//! Records travel as length-prefixed CBOR:
//!
//! ```text
//! +--------------------------+------------------+
//! | Length (4 bytes, BE)     | Payload (CBOR)   |
//! +--------------------------+------------------+
//! ```
//!
//! One `ReadBlockRequest` opens a session, the server answers with one
//! `BlockOpResponse`, and the client closes a successful session with one
//! `ReadAck`. Packet framing between response and ack lives in
//! [`crate::packet`].

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;
use tracing::{debug, warn};

use crate::checksum::ChecksumAlgorithm;
use crate::options::{CacheStrategy, EncryptionScheme};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Protocol version for forward compatibility.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum size of one handshake/acknowledgement record in bytes.
///
/// Records are small; the cap exists to reject garbage length prefixes
/// before allocating.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during record serialization/deserialization.
#[derive(Debug, Error)]
pub enum MessageError {
    /// CBOR serialization failed.
    #[error("CBOR serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization failed.
    #[error("CBOR deserialization error: {0}")]
    Deserialization(String),

    /// Record exceeds the size limit.
    #[error("record too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

// ============================================================================
// Operation Status
// ============================================================================

/// Status codes exchanged in responses and acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    /// Operation succeeded.
    Success,
    /// Client consumed the stream and all checksums verified.
    ChecksumOk,
    /// The named block does not exist on this server.
    BlockNotFound,
    /// The security token was rejected.
    AccessDenied,
    /// Unspecified server-side failure.
    Error,
}

impl OpStatus {
    /// Whether this status opens a readable session.
    pub fn is_success(&self) -> bool {
        matches!(self, OpStatus::Success | OpStatus::ChecksumOk)
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpStatus::Success => write!(f, "success"),
            OpStatus::ChecksumOk => write!(f, "checksum_ok"),
            OpStatus::BlockNotFound => write!(f, "block_not_found"),
            OpStatus::AccessDenied => write!(f, "access_denied"),
            OpStatus::Error => write!(f, "error"),
        }
    }
}

// ============================================================================
// Block Identity
// ============================================================================

/// Identity of one storage block: pool, numeric id, and generation stamp.
///
/// Opaque to the reader; it is forwarded verbatim to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    /// Storage pool the block belongs to.
    pub pool_id: String,
    /// Block number within the pool.
    pub block_id: u64,
    /// Generation stamp distinguishing rewrites of the same block number.
    pub generation_stamp: u64,
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}_{}", self.pool_id, self.block_id, self.generation_stamp)
    }
}

// ============================================================================
// Handshake Records
// ============================================================================

/// Request opening a read session for `[offset, offset + length)` of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBlockRequest {
    /// Protocol version the client speaks, [`PROTOCOL_VERSION`].
    ///
    /// Servers reject requests from a version they do not support.
    pub version: u16,
    /// Identifies the calling client to the server.
    pub client_name: String,
    /// Opaque security token, forwarded but never interpreted.
    pub token: Option<ByteBuf>,
    /// Block to read.
    pub block: BlockId,
    /// Number of bytes requested.
    pub length: u64,
    /// Starting offset within the block.
    pub offset: u64,
    /// Page-cache hints for the server.
    pub cache_strategy: CacheStrategy,
    /// Encryption scheme negotiated for the connection.
    pub encryption_scheme: EncryptionScheme,
}

/// Checksum negotiation carried in a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadChecksumInfo {
    /// Algorithm the server computes per chunk.
    pub algorithm: ChecksumAlgorithm,
    /// Fixed chunk size in bytes.
    pub bytes_per_chunk: u32,
    /// Chunk-aligned offset the packet stream actually starts at.
    ///
    /// Never greater than the requested offset; the gap is padding the
    /// reader discards before delivering data.
    pub chunk_offset: u64,
}

/// Server response to a [`ReadBlockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOpResponse {
    /// Outcome of the request.
    pub status: OpStatus,
    /// Human-readable detail, empty on success.
    pub message: String,
    /// Present when `status` opens a session.
    pub checksum_info: Option<ReadChecksumInfo>,
}

/// Final acknowledgement confirming consumption of the packet stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAck {
    /// `ChecksumOk` when verification ran, `Success` otherwise.
    pub status: OpStatus,
    /// Sequence number of the last packet, echoed back.
    pub seqno: u64,
}

// ============================================================================
// CBOR Encoding
// ============================================================================

macro_rules! cbor_record {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to CBOR bytes.
            pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
                let bytes = serde_cbor::to_vec(self).map_err(|e| {
                    warn!(error = %e, record = stringify!($ty), "Failed to serialize record");
                    MessageError::Serialization(e.to_string())
                })?;

                if bytes.len() > MAX_MESSAGE_SIZE {
                    return Err(MessageError::TooLarge {
                        size: bytes.len(),
                        max: MAX_MESSAGE_SIZE,
                    });
                }

                Ok(bytes)
            }

            /// Deserialize from CBOR bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
                if bytes.len() > MAX_MESSAGE_SIZE {
                    return Err(MessageError::TooLarge {
                        size: bytes.len(),
                        max: MAX_MESSAGE_SIZE,
                    });
                }

                serde_cbor::from_slice(bytes).map_err(|e| {
                    warn!(error = %e, record = stringify!($ty), "Failed to deserialize record");
                    MessageError::Deserialization(e.to_string())
                })
            }
        }
    };
}

cbor_record!(ReadBlockRequest);
cbor_record!(BlockOpResponse);
cbor_record!(ReadAck);

impl BlockOpResponse {
    /// Build a successful response carrying checksum negotiation.
    pub fn success(checksum_info: ReadChecksumInfo) -> Self {
        debug!(?checksum_info, "Creating success response");
        Self {
            status: OpStatus::Success,
            message: String::new(),
            checksum_info: Some(checksum_info),
        }
    }

    /// Build a failure response.
    pub fn failure(status: OpStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(%status, %message, "Creating failure response");
        Self {
            status,
            message,
            checksum_info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> BlockId {
        BlockId {
            pool_id: "pool-7".to_string(),
            block_id: 4211,
            generation_stamp: 12,
        }
    }

    fn sample_request() -> ReadBlockRequest {
        ReadBlockRequest {
            version: PROTOCOL_VERSION,
            client_name: "client-test".to_string(),
            token: Some(ByteBuf::from(b"opaque-token".to_vec())),
            block: sample_block(),
            length: 1024,
            offset: 512,
            cache_strategy: CacheStrategy::default().with_read_ahead(65536),
            encryption_scheme: EncryptionScheme::None,
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let request = sample_request();
        let bytes = request.to_bytes().unwrap();
        let restored = ReadBlockRequest::from_bytes(&bytes).unwrap();
        assert_eq!(request, restored);
    }

    #[test]
    fn test_request_without_token() {
        let mut request = sample_request();
        request.token = None;
        let bytes = request.to_bytes().unwrap();
        let restored = ReadBlockRequest::from_bytes(&bytes).unwrap();
        assert!(restored.token.is_none());
    }

    #[test]
    fn test_response_roundtrip() {
        let response = BlockOpResponse::success(ReadChecksumInfo {
            algorithm: ChecksumAlgorithm::Crc32,
            bytes_per_chunk: 512,
            chunk_offset: 0,
        });
        let bytes = response.to_bytes().unwrap();
        let restored = BlockOpResponse::from_bytes(&bytes).unwrap();
        assert_eq!(response, restored);
    }

    #[test]
    fn test_failure_response_has_no_checksum_info() {
        let response = BlockOpResponse::failure(OpStatus::BlockNotFound, "no such block");
        assert!(!response.status.is_success());
        assert!(response.checksum_info.is_none());

        let restored = BlockOpResponse::from_bytes(&response.to_bytes().unwrap()).unwrap();
        assert_eq!(response, restored);
    }

    #[test]
    fn test_ack_roundtrip() {
        let ack = ReadAck {
            status: OpStatus::ChecksumOk,
            seqno: 41,
        };
        let restored = ReadAck::from_bytes(&ack.to_bytes().unwrap()).unwrap();
        assert_eq!(ack, restored);
    }

    #[test]
    fn test_record_too_large_rejected_before_decode() {
        let huge = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            ReadBlockRequest::from_bytes(&huge),
            Err(MessageError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_record_fails() {
        let bytes = sample_request().to_bytes().unwrap();
        for cut in [1, 5, bytes.len() / 2, bytes.len() - 1] {
            assert!(ReadBlockRequest::from_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_garbage_does_not_panic() {
        for bytes in [&[][..], &[0xFF][..], &[0xBF, 0x00, 0x01][..]] {
            let _ = ReadBlockRequest::from_bytes(bytes);
            let _ = BlockOpResponse::from_bytes(bytes);
            let _ = ReadAck::from_bytes(bytes);
        }
    }

    #[test]
    fn test_op_status_display() {
        assert_eq!(OpStatus::Success.to_string(), "success");
        assert_eq!(OpStatus::ChecksumOk.to_string(), "checksum_ok");
        assert_eq!(OpStatus::BlockNotFound.to_string(), "block_not_found");
        assert_eq!(OpStatus::AccessDenied.to_string(), "access_denied");
        assert_eq!(OpStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_block_id_display() {
        assert_eq!(sample_block().to_string(), "pool-7:4211_12");
    }
}
