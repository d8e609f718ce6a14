//! The block read protocol engine.
//!
//! [`BlockReader`] drives one read session at a time over an
//! already-connected byte stream: handshake, packet stream, final
//! acknowledgement. The engine imposes all framing itself and absorbs short
//! reads by suspending at each partial read, so it works unchanged over any
//! `AsyncRead + AsyncWrite` transport.
//!
//! There is no internal locking: all operations take `&mut self`, which
//! makes the single-consumer discipline a compile-time property. Sharing one
//! reader between tasks requires external synchronization. Cancellation is
//! cooperative: dropping the reader (or closing the stream) resolves any
//! outstanding operation with a transport error.

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde_bytes::ByteBuf;
use tracing::{debug, trace, warn};

use crate::checksum::{ChecksumAlgorithm, ChunkVerifier};
use crate::error::{Result, TransferError};
use crate::messages::{
    BlockId, BlockOpResponse, OpStatus, ReadAck, ReadBlockRequest, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};
use crate::options::BlockReaderOptions;
use crate::packet::{PacketHeader, HEADER_PREFIX_SIZE, MAX_HEADER_SIZE};

/// Size of the record length prefix in bytes (u32 big-endian).
const LENGTH_PREFIX_SIZE: usize = 4;

/// Scratch size for bytes that are consumed but never delivered.
const DISCARD_CHUNK: usize = 512;

/// Protocol state of one read session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    ReadPacketHeader,
    ReadChecksum,
    ReadPadding,
    ReadData,
    Finished,
}

/// Parameters fixed by the handshake for the rest of the session.
#[derive(Debug, Clone, Copy)]
struct Negotiated {
    algorithm: ChecksumAlgorithm,
    bytes_per_chunk: u32,
}

/// The packet currently being consumed.
#[derive(Debug)]
struct InFlight {
    header: PacketHeader,
    data_consumed: u64,
    verifier: Option<ChunkVerifier>,
}

impl InFlight {
    fn remaining(&self) -> u64 {
        self.header.data_len - self.data_consumed
    }
}

/// Stateful engine reading one byte range of one storage block.
///
/// Construct it around a connected stream, open a session with
/// [`request_block`](Self::request_block), then drain it with
/// [`read_packet`](Self::read_packet) calls until
/// [`is_finished`](Self::is_finished). Each method has a blocking twin for
/// synchronous callers.
///
/// A reader is reset to a fresh session by the next `request_block` call;
/// interleaving two sessions on one instance is a caller error and is
/// reported as [`TransferError::InvalidState`].
pub struct BlockReader<S> {
    stream: S,
    options: BlockReaderOptions,
    state: State,
    negotiated: Option<Negotiated>,
    expected_seqno: u64,
    next_offset: u64,
    bytes_to_deliver: u64,
    padding_remaining: u64,
    packet: Option<InFlight>,
}

impl<S> BlockReader<S> {
    /// Bind a reader to an already-connected stream.
    pub fn new(options: BlockReaderOptions, stream: S) -> Self {
        Self {
            stream,
            options,
            state: State::Open,
            negotiated: None,
            expected_seqno: 0,
            next_offset: 0,
            bytes_to_deliver: 0,
            padding_remaining: 0,
            packet: None,
        }
    }

    /// Options this reader was built with.
    pub fn options(&self) -> &BlockReaderOptions {
        &self.options
    }

    /// Whether the current session has terminated.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Bytes of the requested range not yet delivered.
    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_to_deliver
    }

    /// Consume the reader and recover the underlying stream.
    pub fn into_stream(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> BlockReader<S> {
    // ========================================================================
    // Handshake
    // ========================================================================

    /// Open a read session for `[offset, offset + length)` of `block`.
    ///
    /// Sends the handshake identifying the caller (with an opaque security
    /// token, forwarded uninterpreted) and naming the byte range, then
    /// consumes the server's response. On success the reader is ready for
    /// [`read_packet`](Self::read_packet) calls.
    ///
    /// Offsets are validated by the server against the block's size; this
    /// layer performs no retry, since replica failover belongs to the
    /// caller.
    pub async fn request_block(
        &mut self,
        client_name: &str,
        token: Option<&[u8]>,
        block: &BlockId,
        length: u64,
        offset: u64,
    ) -> Result<()> {
        match self.state {
            State::Open | State::Finished => {}
            _ => {
                return Err(TransferError::invalid_state(
                    "request_block while a read session is in flight",
                ))
            }
        }
        if length == 0 {
            return Err(TransferError::invalid_state(
                "requested length must be greater than zero",
            ));
        }

        self.state = State::Open;
        self.packet = None;

        debug!(%block, length, offset, client = client_name, "Requesting block");

        let request = ReadBlockRequest {
            version: PROTOCOL_VERSION,
            client_name: client_name.to_string(),
            token: token.map(|t| ByteBuf::from(t.to_vec())),
            block: block.clone(),
            length,
            offset,
            cache_strategy: self.options.cache_strategy,
            encryption_scheme: self.options.encryption_scheme,
        };
        let payload = request.to_bytes()?;
        self.write_record(&payload).await?;

        let body = self.read_record().await?;
        let response = BlockOpResponse::from_bytes(&body)?;
        if !response.status.is_success() {
            return Err(TransferError::Remote {
                status: response.status.to_string(),
                message: response.message,
            });
        }

        let info = response.checksum_info.ok_or_else(|| {
            TransferError::protocol("success response is missing checksum negotiation")
        })?;
        if info.bytes_per_chunk == 0 {
            return Err(TransferError::protocol("negotiated chunk size is zero"));
        }
        if info.chunk_offset > offset {
            return Err(TransferError::protocol(format!(
                "server chunk offset {} is past the requested offset {}",
                info.chunk_offset, offset
            )));
        }
        let padding = offset - info.chunk_offset;
        if padding >= info.bytes_per_chunk as u64 {
            return Err(TransferError::protocol(format!(
                "server chunk offset {} is not chunk-aligned with requested offset {} \
                 (chunk size {})",
                info.chunk_offset, offset, info.bytes_per_chunk
            )));
        }

        self.negotiated = Some(Negotiated {
            algorithm: info.algorithm,
            bytes_per_chunk: info.bytes_per_chunk,
        });
        self.expected_seqno = 0;
        self.next_offset = info.chunk_offset;
        self.bytes_to_deliver = length;
        self.padding_remaining = padding;
        self.state = State::ReadPacketHeader;

        debug!(
            algorithm = %info.algorithm,
            bytes_per_chunk = info.bytes_per_chunk,
            padding,
            "Read session established"
        );
        Ok(())
    }

    /// Blocking form of [`request_block`](Self::request_block).
    pub fn request_block_blocking(
        &mut self,
        client_name: &str,
        token: Option<&[u8]>,
        block: &BlockId,
        length: u64,
        offset: u64,
    ) -> Result<()> {
        futures::executor::block_on(self.request_block(client_name, token, block, length, offset))
    }

    // ========================================================================
    // Packet reads
    // ========================================================================

    /// Fill `buf` with verified block data, crossing as many packets as
    /// needed.
    ///
    /// Returns the number of bytes written, which is less than the buffer's
    /// capacity only at end of block. A buffer smaller than one packet's
    /// data is resumed mid-packet on the next call without re-reading header
    /// or checksum bytes. Consuming the packet flagged
    /// `last_packet_in_block` emits the acknowledgement and finishes the
    /// session.
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.state {
            State::Open => {
                return Err(TransferError::invalid_state(
                    "read_packet before a successful request_block",
                ))
            }
            State::Finished => {
                return Err(TransferError::invalid_state(
                    "read_packet after the session finished",
                ))
            }
            _ => {}
        }

        let result = self.read_packet_inner(buf).await;
        if let Err(ref e) = result {
            // The session cannot be resumed after a failed operation; the
            // next request_block starts fresh.
            warn!(error = %e, "Read session aborted");
            self.packet = None;
            self.state = State::Finished;
        }
        result
    }

    /// Blocking form of [`read_packet`](Self::read_packet).
    pub fn read_packet_blocking(&mut self, buf: &mut [u8]) -> Result<usize> {
        futures::executor::block_on(self.read_packet(buf))
    }

    /// Fill a sequence of buffers, stopping at end of block.
    pub async fn read_packet_vectored(&mut self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut total = 0;
        for (i, buf) in bufs.iter_mut().enumerate() {
            if i > 0 && self.is_finished() {
                break;
            }
            let n = self.read_packet(buf).await?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Blocking form of [`read_packet_vectored`](Self::read_packet_vectored).
    pub fn read_packet_vectored_blocking(&mut self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        futures::executor::block_on(self.read_packet_vectored(bufs))
    }

    async fn read_packet_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0usize;

        loop {
            match self.state {
                State::ReadPacketHeader => {
                    // Stop at a packet boundary once the caller's buffer is
                    // full, unless the requested range is already delivered
                    // and only the terminator remains to be consumed.
                    if written == buf.len() && self.bytes_to_deliver > 0 {
                        break;
                    }
                    self.read_packet_header().await?;
                }
                State::ReadChecksum => self.read_checksum_region().await?,
                State::ReadPadding => self.read_padding().await?,
                State::ReadData => {
                    if self.packet_complete() {
                        self.finish_packet().await?;
                        continue;
                    }
                    if self.bytes_to_deliver > 0 && written == buf.len() {
                        // Mid-packet suspend; the next call resumes here.
                        break;
                    }
                    self.read_data_step(buf, &mut written).await?;
                }
                State::Finished => break,
                State::Open => unreachable!("session states only"),
            }
        }

        trace!(written, state = ?self.state, "read_packet returning");
        Ok(written)
    }

    // ========================================================================
    // State machine steps
    // ========================================================================

    async fn read_packet_header(&mut self) -> Result<()> {
        let mut prefix = [0u8; HEADER_PREFIX_SIZE];
        self.stream.read_exact(&mut prefix).await?;
        let header_len = u16::from_be_bytes(prefix) as usize;
        if header_len == 0 || header_len > MAX_HEADER_SIZE {
            return Err(TransferError::protocol(format!(
                "packet header length {header_len} out of range"
            )));
        }

        let mut body = vec![0u8; header_len];
        self.stream.read_exact(&mut body).await?;
        let header = PacketHeader::decode(&body)?;

        let negotiated = self
            .negotiated
            .expect("negotiation fixed before the first packet");
        header.validate(negotiated.bytes_per_chunk, negotiated.algorithm)?;

        if header.seqno != self.expected_seqno {
            return Err(TransferError::protocol(format!(
                "out-of-sequence packet: expected seqno {}, got {}",
                self.expected_seqno, header.seqno
            )));
        }
        if header.offset_in_block != self.next_offset {
            return Err(TransferError::protocol(format!(
                "packet {} starts at offset {}, expected {}",
                header.seqno, header.offset_in_block, self.next_offset
            )));
        }

        debug!(
            seqno = header.seqno,
            offset = header.offset_in_block,
            data_len = header.data_len,
            last = header.last_packet_in_block,
            "Read packet header"
        );

        self.packet = Some(InFlight {
            header,
            data_consumed: 0,
            verifier: None,
        });
        self.state = State::ReadChecksum;
        Ok(())
    }

    async fn read_checksum_region(&mut self) -> Result<()> {
        let (checksum_len, data_len) = {
            let header = &self.packet.as_ref().expect("packet in flight").header;
            (header.checksum_len() as usize, header.data_len)
        };

        // The region is consumed off the wire even when verification is
        // disabled; the framing does not change with client options.
        let mut region = vec![0u8; checksum_len];
        if checksum_len > 0 {
            self.stream.read_exact(&mut region).await?;
            trace!(bytes = checksum_len, "Read checksum region");
        }

        if self.options.verify_checksum && checksum_len > 0 {
            let negotiated = self.negotiated.expect("negotiation fixed");
            self.packet.as_mut().expect("packet in flight").verifier = Some(ChunkVerifier::new(
                negotiated.bytes_per_chunk,
                region,
                data_len,
            ));
        }

        self.state = State::ReadPadding;
        Ok(())
    }

    /// Discard the alignment slack between the chunk boundary the server
    /// started at and the first requested byte. Only the first packet of a
    /// session carries padding; the bytes still run through chunk
    /// verification.
    async fn read_padding(&mut self) -> Result<()> {
        while self.padding_remaining > 0 {
            let pkt = self.packet.as_mut().expect("packet in flight");
            let take = self
                .padding_remaining
                .min(pkt.remaining())
                .min(DISCARD_CHUNK as u64) as usize;
            if take == 0 {
                return Err(TransferError::protocol(format!(
                    "packet {} ended inside {} pending padding bytes",
                    pkt.header.seqno, self.padding_remaining
                )));
            }

            let mut scratch = [0u8; DISCARD_CHUNK];
            self.stream.read_exact(&mut scratch[..take]).await?;
            Self::feed_verifier(pkt, &scratch[..take])?;
            pkt.data_consumed += take as u64;
            self.padding_remaining -= take as u64;
            trace!(bytes = take, remaining = self.padding_remaining, "Discarded padding");
        }

        self.state = State::ReadData;
        Ok(())
    }

    /// One stream read's worth of data: either copied into the caller's
    /// buffer or, once the requested range is fully delivered, discarded as
    /// trailing slack up to the server's chunk boundary.
    async fn read_data_step(&mut self, buf: &mut [u8], written: &mut usize) -> Result<()> {
        let pkt = self.packet.as_mut().expect("packet in flight");
        let remaining = pkt.remaining();
        debug_assert!(remaining > 0, "read_data_step on a drained packet");

        if self.bytes_to_deliver == 0 {
            let take = remaining.min(DISCARD_CHUNK as u64) as usize;
            let mut scratch = [0u8; DISCARD_CHUNK];
            self.stream.read_exact(&mut scratch[..take]).await?;
            Self::feed_verifier(pkt, &scratch[..take])?;
            pkt.data_consumed += take as u64;
            trace!(bytes = take, "Discarded trailing slack");
            return Ok(());
        }

        let space = buf.len() - *written;
        let take = remaining.min(space as u64).min(self.bytes_to_deliver) as usize;
        let dst = &mut buf[*written..*written + take];
        self.stream.read_exact(dst).await?;
        Self::feed_verifier(pkt, dst)?;
        pkt.data_consumed += take as u64;
        self.bytes_to_deliver -= take as u64;
        *written += take;

        trace!(
            bytes = take,
            packet_consumed = pkt.data_consumed,
            to_deliver = self.bytes_to_deliver,
            "Copied packet data"
        );
        Ok(())
    }

    fn packet_complete(&self) -> bool {
        self.packet
            .as_ref()
            .is_some_and(|p| p.data_consumed == p.header.data_len)
    }

    async fn finish_packet(&mut self) -> Result<()> {
        let pkt = self.packet.take().expect("packet in flight");
        self.expected_seqno = pkt.header.seqno + 1;
        self.next_offset = pkt.header.offset_in_block + pkt.header.data_len;

        if pkt.header.last_packet_in_block {
            if self.bytes_to_deliver > 0 {
                return Err(TransferError::protocol(format!(
                    "stream ended {} bytes short of the requested range",
                    self.bytes_to_deliver
                )));
            }
            self.ack_read(pkt.header.seqno).await;
            self.state = State::Finished;
            debug!(last_seqno = pkt.header.seqno, "Read session finished");
        } else {
            self.state = State::ReadPacketHeader;
        }
        Ok(())
    }

    /// Acknowledge successful consumption of the packet stream.
    ///
    /// A failure to send or flush the acknowledgement is logged and not
    /// propagated; the delivered data has already been verified.
    async fn ack_read(&mut self, seqno: u64) {
        let status = if self.options.verify_checksum {
            OpStatus::ChecksumOk
        } else {
            OpStatus::Success
        };
        let ack = ReadAck { status, seqno };

        let sent = match ack.to_bytes() {
            Ok(payload) => self.write_record(&payload).await,
            Err(e) => Err(TransferError::Message(e)),
        };
        match sent {
            Ok(()) => debug!(seqno, %status, "Acknowledged read"),
            Err(e) => warn!(error = %e, seqno, "Failed to send read acknowledgement"),
        }
    }

    fn feed_verifier(pkt: &mut InFlight, bytes: &[u8]) -> Result<()> {
        if let Some(verifier) = pkt.verifier.as_mut() {
            verifier.feed(bytes).map_err(|m| TransferError::ChecksumMismatch {
                seqno: pkt.header.seqno,
                chunk: m.chunk,
            })?;
        }
        Ok(())
    }

    // ========================================================================
    // Record framing
    // ========================================================================

    async fn write_record(&mut self, payload: &[u8]) -> Result<()> {
        self.stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        trace!(bytes = payload.len(), "Wrote record");
        Ok(())
    }

    async fn read_record(&mut self) -> Result<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.stream.read_exact(&mut prefix).await?;
        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 {
            return Err(TransferError::protocol("empty record"));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(TransferError::protocol(format!(
                "record length {len} exceeds maximum {MAX_MESSAGE_SIZE}"
            )));
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        trace!(bytes = len, "Read record");
        Ok(body)
    }
}
