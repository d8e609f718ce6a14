//! Per-chunk checksum arithmetic and verification.
//!
//! A packet's data region is divided into fixed-size chunks (the size is
//! negotiated during the handshake); each chunk carries one checksum in the
//! packet's checksum region, in chunk order. The last chunk of a packet may
//! be short.
//!
//! Verification is incremental: data can be fed in arbitrary spans as it
//! arrives off the wire, and each chunk is checked the moment its final byte
//! has been seen. This lets the reader verify while copying into caller
//! buffers, without re-buffering whole packets.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Checksum algorithm negotiated for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// No checksums; the packet checksum region is empty.
    Null,
    /// CRC32 (IEEE), 4 bytes per chunk, big-endian on the wire.
    Crc32,
}

impl ChecksumAlgorithm {
    /// Width of one checksum entry in bytes.
    pub fn width(&self) -> usize {
        match self {
            ChecksumAlgorithm::Null => 0,
            ChecksumAlgorithm::Crc32 => 4,
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Null => write!(f, "null"),
            ChecksumAlgorithm::Crc32 => write!(f, "crc32"),
        }
    }
}

/// Number of chunks needed to cover `data_len` bytes.
pub fn chunk_count(data_len: u64, bytes_per_chunk: u32) -> usize {
    if data_len == 0 {
        return 0;
    }
    data_len.div_ceil(bytes_per_chunk as u64) as usize
}

/// Expected length of a packet's checksum region.
pub fn checksum_region_len(data_len: u64, bytes_per_chunk: u32, algorithm: ChecksumAlgorithm) -> usize {
    chunk_count(data_len, bytes_per_chunk) * algorithm.width()
}

/// Compute the checksum region for a packet's data.
///
/// Produces the bytes a conforming server would place between the packet
/// header and the data. Used by test fixtures and server-side emitters.
pub fn compute_packet_checksums(
    data: &[u8],
    bytes_per_chunk: u32,
    algorithm: ChecksumAlgorithm,
) -> Vec<u8> {
    if algorithm.width() == 0 {
        return Vec::new();
    }

    let mut region = Vec::with_capacity(checksum_region_len(
        data.len() as u64,
        bytes_per_chunk,
        algorithm,
    ));
    for chunk in data.chunks(bytes_per_chunk as usize) {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(chunk);
        region.extend_from_slice(&hasher.finalize().to_be_bytes());
    }
    region
}

/// A chunk whose recomputed checksum did not match the declared one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMismatch {
    /// Index of the offending chunk within the packet.
    pub chunk: usize,
}

/// Incremental verifier for one packet's data region.
///
/// Fed every data byte of the packet in wire order, including leading
/// padding bytes and any trailing slack past the requested range. Bytes the
/// caller never sees still participate in chunk checksums.
pub struct ChunkVerifier {
    bytes_per_chunk: usize,
    checksums: Vec<u8>,
    data_len: u64,
    consumed: u64,
    hasher: crc32fast::Hasher,
    chunk_filled: usize,
    chunk_index: usize,
}

impl std::fmt::Debug for ChunkVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkVerifier")
            .field("bytes_per_chunk", &self.bytes_per_chunk)
            .field("data_len", &self.data_len)
            .field("consumed", &self.consumed)
            .field("chunk_index", &self.chunk_index)
            .field("chunk_filled", &self.chunk_filled)
            .finish()
    }
}

impl ChunkVerifier {
    /// Start verifying a packet with `data_len` data bytes against the
    /// declared checksum region.
    pub fn new(bytes_per_chunk: u32, checksums: Vec<u8>, data_len: u64) -> Self {
        debug!(
            bytes_per_chunk,
            checksum_bytes = checksums.len(),
            data_len,
            "Starting chunk verification for packet"
        );
        Self {
            bytes_per_chunk: bytes_per_chunk as usize,
            checksums,
            data_len,
            consumed: 0,
            hasher: crc32fast::Hasher::new(),
            chunk_filled: 0,
            chunk_index: 0,
        }
    }

    /// Feed the next span of packet data, verifying every chunk completed by
    /// it. The final, possibly short chunk is verified when the span reaches
    /// `data_len`.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ChunkMismatch> {
        debug_assert!(
            self.consumed + data.len() as u64 <= self.data_len,
            "fed more bytes than the packet declared"
        );

        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(self.bytes_per_chunk - self.chunk_filled);
            self.hasher.update(&rest[..take]);
            self.chunk_filled += take;
            self.consumed += take as u64;
            rest = &rest[take..];

            if self.chunk_filled == self.bytes_per_chunk {
                self.verify_current()?;
            }
        }

        // Last chunk of the packet may be short.
        if self.consumed == self.data_len && self.chunk_filled > 0 {
            self.verify_current()?;
        }

        Ok(())
    }

    fn verify_current(&mut self) -> Result<(), ChunkMismatch> {
        let actual = std::mem::replace(&mut self.hasher, crc32fast::Hasher::new()).finalize();

        let start = self.chunk_index * 4;
        let declared = self
            .checksums
            .get(start..start + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));

        trace!(
            chunk = self.chunk_index,
            bytes = self.chunk_filled,
            actual,
            ?declared,
            "Verified chunk"
        );

        let mismatch = ChunkMismatch {
            chunk: self.chunk_index,
        };
        self.chunk_index += 1;
        self.chunk_filled = 0;

        match declared {
            Some(declared) if declared == actual => Ok(()),
            _ => Err(mismatch),
        }
    }
}
