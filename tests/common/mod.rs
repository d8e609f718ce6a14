//! Shared fixtures: an in-memory scripted stream standing in for a storage
//! node, and builders for the byte sequences a conforming server would send.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::io::Cursor;
use futures::{AsyncRead, AsyncWrite};

use block_transfer::checksum::compute_packet_checksums;
use block_transfer::{
    BlockId, BlockOpResponse, ChecksumAlgorithm, PacketHeader, ReadChecksumInfo,
};

/// In-memory duplex: reads are served from a pre-built script, writes are
/// captured for later assertions.
pub struct ScriptedStream {
    input: Cursor<Vec<u8>>,
    pub output: Vec<u8>,
}

impl ScriptedStream {
    pub fn new(script: Vec<u8>) -> Self {
        Self {
            input: Cursor::new(script),
            output: Vec::new(),
        }
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.input).poll_read(cx, buf)
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.output.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Wrapper that yields at most `max` bytes per read, exercising the
/// engine's short-read absorption.
pub struct ChoppyStream<S> {
    pub inner: S,
    pub max: usize,
}

impl<S: AsyncRead + Unpin> AsyncRead for ChoppyStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let limit = (rand::random::<usize>() % self.max).max(1);
        let limited = if buf.len() > limit {
            &mut buf[..limit]
        } else {
            buf
        };
        let inner = &mut self.inner;
        Pin::new(inner).poll_read(cx, limited)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ChoppyStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

pub fn sample_block() -> BlockId {
    BlockId {
        pool_id: "pool-test".to_string(),
        block_id: 1234,
        generation_stamp: 7,
    }
}

/// Frame a record the way the protocol does: u32 BE length prefix + payload.
pub fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// A successful handshake response.
pub fn handshake_ok(
    algorithm: ChecksumAlgorithm,
    bytes_per_chunk: u32,
    chunk_offset: u64,
) -> Vec<u8> {
    let response = BlockOpResponse::success(ReadChecksumInfo {
        algorithm,
        bytes_per_chunk,
        chunk_offset,
    });
    frame_record(&response.to_bytes().unwrap())
}

/// One wire packet: header frame, checksum region, data bytes.
///
/// `corrupt_checksum_byte` flips one bit in the checksum region to simulate
/// corruption in flight.
pub fn packet(
    seqno: u64,
    offset_in_block: u64,
    data: &[u8],
    bytes_per_chunk: u32,
    algorithm: ChecksumAlgorithm,
    last: bool,
    corrupt_checksum_byte: Option<usize>,
) -> Vec<u8> {
    let mut checksums = compute_packet_checksums(data, bytes_per_chunk, algorithm);
    if let Some(i) = corrupt_checksum_byte {
        checksums[i] ^= 0x01;
    }

    let header = PacketHeader {
        packet_len: (checksums.len() + data.len()) as u64,
        offset_in_block,
        seqno,
        last_packet_in_block: last,
        data_len: data.len() as u64,
    };

    let mut wire = header.encode().unwrap();
    wire.extend_from_slice(&checksums);
    wire.extend_from_slice(data);
    wire
}

/// Split the client's captured output back into length-prefixed records.
pub fn client_records(output: &[u8]) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    let mut rest = output;
    while rest.len() >= 4 {
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        assert!(rest.len() >= 4 + len, "truncated client record");
        records.push(rest[4..4 + len].to_vec());
        rest = &rest[4 + len..];
    }
    assert!(rest.is_empty(), "trailing bytes after last client record");
    records
}

/// Deterministic, non-repeating test payload.
pub fn block_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
