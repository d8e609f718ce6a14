//! Client-side block read engine for a distributed-filesystem data-transfer
//! protocol.
//!
//! A [`BlockReader`] is bound to an already-connected byte stream to a storage
//! node and reads one byte range of one storage block, verifying per-chunk
//! checksums and acknowledging receipt once the final packet has been
//! consumed.
//!
//! # Protocol
//!
//! The session is a simple handshake followed by a packet stream:
//!
//! 1. Client sends a `ReadBlockRequest` naming the block and byte range.
//! 2. Server answers with a `BlockOpResponse` carrying the negotiated
//!    checksum algorithm, chunk size, and the chunk-aligned offset it will
//!    start streaming from.
//! 3. Server streams packets, each framed as:
//!
//! ```text
//! +------------------+---------------+-----------------+-------------+
//! | Header len (u16) | Header (CBOR) | Checksum bytes  | Data bytes  |
//! +------------------+---------------+-----------------+-------------+
//! ```
//!
//! 4. After the packet flagged `last_packet_in_block`, the client sends a
//!    `ReadAck` echoing the final sequence number.
//!
//! # Example
//!
//! ```ignore
//! let mut reader = BlockReader::new(BlockReaderOptions::default(), stream);
//! reader.request_block("client-1", None, &block, 128, 0).await?;
//!
//! let mut buf = vec![0u8; 128];
//! let mut filled = 0;
//! while !reader.is_finished() {
//!     filled += reader.read_packet(&mut buf[filled..]).await?;
//! }
//! ```
//!
//! The engine never assumes message framing from the transport; it imposes
//! framing itself and absorbs short reads by suspending until enough bytes
//! arrive. Retry and replica failover belong to the caller.

pub mod checksum;
pub mod error;
pub mod messages;
pub mod options;
pub mod packet;
pub mod reader;

pub use checksum::ChecksumAlgorithm;
pub use error::{Result, TransferError};
pub use messages::{
    BlockId, BlockOpResponse, MessageError, OpStatus, ReadAck, ReadBlockRequest, ReadChecksumInfo,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use options::{BlockReaderOptions, CacheStrategy, EncryptionScheme};
pub use packet::PacketHeader;
pub use reader::BlockReader;
