//! Wire framing for data packets.
//!
//! Each packet the server streams after a successful handshake is framed as:
//!
//! ```text
//! +------------------+---------------+----------------+------------+
//! | Header len (u16) | Header (CBOR) | Checksum bytes | Data bytes |
//! +------------------+---------------+----------------+------------+
//! ```
//!
//! `packet_len` in the header counts every byte after the header record,
//! so the checksum region is `packet_len - data_len` bytes long. Sequence
//! numbers increase by exactly one per packet, and exactly one packet in a
//! session carries `last_packet_in_block`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::checksum::{checksum_region_len, ChecksumAlgorithm};
use crate::error::TransferError;

/// Size of the header length prefix in bytes (u16 big-endian).
pub const HEADER_PREFIX_SIZE: usize = 2;

/// Upper bound on the encoded header record.
///
/// Real headers are a few dozen bytes; the cap rejects garbage prefixes
/// before allocating.
pub const MAX_HEADER_SIZE: usize = 512;

/// Upper bound on `packet_len` in bytes, checksum region plus data.
///
/// Servers stream in packets well below this; the cap rejects hostile
/// headers before the checksum region is allocated.
pub const MAX_PACKET_SIZE: u64 = 16 * 1024 * 1024;

/// Framing metadata for one wire packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Bytes following the header record: checksum region plus data.
    pub packet_len: u64,
    /// Offset of this packet's first data byte within the block.
    pub offset_in_block: u64,
    /// Monotonically increasing sequence number.
    pub seqno: u64,
    /// Set on the final packet of the stream.
    pub last_packet_in_block: bool,
    /// Length of the data portion.
    pub data_len: u64,
}

impl PacketHeader {
    /// Encode as a length-prefixed header record.
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        let body = serde_cbor::to_vec(self).map_err(|e| {
            warn!(error = %e, "Failed to encode packet header");
            TransferError::protocol(format!("packet header encoding failed: {e}"))
        })?;
        debug_assert!(body.len() <= MAX_HEADER_SIZE);

        let mut frame = Vec::with_capacity(HEADER_PREFIX_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a header record from its body bytes (prefix already consumed).
    pub fn decode(body: &[u8]) -> Result<Self, TransferError> {
        serde_cbor::from_slice(body).map_err(|e| {
            warn!(error = %e, len = body.len(), "Failed to decode packet header");
            TransferError::protocol(format!("malformed packet header: {e}"))
        })
    }

    /// Length of the checksum region declared by this header.
    pub fn checksum_len(&self) -> u64 {
        self.packet_len - self.data_len
    }

    /// Validate internal consistency against the negotiated parameters.
    ///
    /// `packet_len` must stay under [`MAX_PACKET_SIZE`], and the checksum
    /// region must be either empty (server sent no checksums) or exactly the
    /// size the chunk arithmetic predicts. Every declared length is checked
    /// here before any buffer is sized from it.
    pub fn validate(
        &self,
        bytes_per_chunk: u32,
        algorithm: ChecksumAlgorithm,
    ) -> Result<(), TransferError> {
        if self.packet_len > MAX_PACKET_SIZE {
            return Err(TransferError::protocol(format!(
                "packet {} declares {} bytes, maximum is {}",
                self.seqno, self.packet_len, MAX_PACKET_SIZE
            )));
        }
        if self.data_len > self.packet_len {
            return Err(TransferError::protocol(format!(
                "packet {} declares data_len {} > packet_len {}",
                self.seqno, self.data_len, self.packet_len
            )));
        }

        let checksum_len = self.checksum_len();
        let expected = checksum_region_len(self.data_len, bytes_per_chunk, algorithm) as u64;
        if checksum_len != 0 && checksum_len != expected {
            return Err(TransferError::protocol(format!(
                "packet {} declares {} checksum bytes, expected {} for {} data bytes",
                self.seqno, checksum_len, expected, self.data_len
            )));
        }

        Ok(())
    }
}
