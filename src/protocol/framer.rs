//! Packet framing over raw byte streams.
//!
//! [`PacketWrapper`] turns a byte sink into a packet sink: every payload
//! goes out as header (3 B), payload, trailer (2 B), in that order, each
//! stage starting only after the previous one finished. [`PacketUnwrapper`]
//! does the reverse: it reads exactly one header, validates it, then reads
//! the payload and trailer and checks the payload CRC.
//!
//! Recovery policy: an invalid header (wrong sync byte, reserved length
//! bit, or CRC mismatch) is discarded whole and the 3-byte header read
//! restarts at the next byte the transport yields. There is no
//! byte-shifting resynchronization; the underlying transports either
//! deliver aligned datagrams or are polled from a ring with known
//! boundaries. A payload CRC mismatch is surfaced as [`BadFrame`] so the
//! layer above can drop the packet and keep reading.
//!
//! [`BadFrame`]: DrivelinkError::BadFrame

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire::{
    decode_frame_header, encode_frame_header, encode_frame_trailer, verify_frame_trailer,
    FRAME_HEADER_SIZE, FRAME_TRAILER_SIZE, MAX_FRAME_PAYLOAD,
};
use crate::error::{DrivelinkError, Result};
use crate::transport::{PacketSink, PacketSource};

/// Adapts a byte sink into a packet sink by framing each payload.
pub struct PacketWrapper<W> {
    sink: W,
}

impl<W: AsyncWrite + Unpin> PacketWrapper<W> {
    /// Wrap a byte sink.
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    /// Write one framed packet.
    ///
    /// Rejects payloads longer than [`MAX_FRAME_PAYLOAD`]. Dropping the
    /// returned future cancels the write; the stream is then mid-frame
    /// and should not be reused.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(DrivelinkError::BufferTooSmall(
                "payload exceeds framer MTU",
            ));
        }

        let header = encode_frame_header(payload.len() as u8);
        let trailer = encode_frame_trailer(payload);

        self.sink
            .write_all(&header)
            .await
            .map_err(DrivelinkError::from_stream_io)?;
        self.sink
            .write_all(payload)
            .await
            .map_err(DrivelinkError::from_stream_io)?;
        self.sink
            .write_all(&trailer)
            .await
            .map_err(DrivelinkError::from_stream_io)?;
        self.sink
            .flush()
            .await
            .map_err(DrivelinkError::from_stream_io)?;

        Ok(())
    }

    /// Borrow the underlying sink.
    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /// Consume the wrapper and return the inner sink.
    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// Adapts a byte source into a packet source by unframing the stream.
pub struct PacketUnwrapper<R> {
    source: R,
}

impl<R: AsyncRead + Unpin> PacketUnwrapper<R> {
    /// Wrap a byte source.
    pub fn new(source: R) -> Self {
        Self { source }
    }

    /// Read one packet into `buf`, returning the payload length.
    ///
    /// Invalid headers are skipped silently (see the module docs for the
    /// resynchronization policy). A payload that does not fit `buf`
    /// fails with `BufferTooSmall`; a trailer mismatch fails with
    /// `BadFrame`. Both leave the stream readable for the next attempt.
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            self.source
                .read_exact(&mut header)
                .await
                .map_err(DrivelinkError::from_stream_io)?;

            match decode_frame_header(&header) {
                Some(len) => break len,
                None => {
                    tracing::trace!(?header, "discarding invalid frame header");
                    continue;
                }
            }
        };

        if len > buf.len() {
            return Err(DrivelinkError::BufferTooSmall(
                "frame payload exceeds read buffer",
            ));
        }

        self.source
            .read_exact(&mut buf[..len])
            .await
            .map_err(DrivelinkError::from_stream_io)?;

        let mut trailer = [0u8; FRAME_TRAILER_SIZE];
        self.source
            .read_exact(&mut trailer)
            .await
            .map_err(DrivelinkError::from_stream_io)?;

        if !verify_frame_trailer(&buf[..len], trailer) {
            return Err(DrivelinkError::BadFrame("payload CRC mismatch"));
        }

        Ok(len)
    }

    /// Borrow the underlying source.
    pub fn get_ref(&self) -> &R {
        &self.source
    }

    /// Consume the unwrapper and return the inner source.
    pub fn into_inner(self) -> R {
        self.source
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PacketSink for PacketWrapper<W> {
    async fn send_packet(&mut self, payload: &[u8]) -> Result<()> {
        self.write_packet(payload).await
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PacketSource for PacketUnwrapper<R> {
    async fn recv_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_packet(buf).await
    }
}
