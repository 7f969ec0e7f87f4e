//! Transport seams for the endpoint engine.
//!
//! The engine consumes a datagram-oriented [`PacketSink`]/[`PacketSource`]
//! pair. Byte-stream links (UART and friends) get these by stacking the
//! framer on top of `AsyncRead`/`AsyncWrite` halves; links that already
//! carry whole datagrams (USB bulk endpoints) implement the traits
//! directly and skip the framing entirely.
//!
//! One transfer is in flight per direction per instance: the traits take
//! `&mut self`, so concurrent submissions on the same link are ruled out
//! at compile time. Dropping an in-flight future cancels the transfer.

use async_trait::async_trait;

use crate::error::Result;

/// Sends whole packets. Each call transfers exactly one packet.
#[async_trait]
pub trait PacketSink: Send {
    /// Transfer one packet. Resolves once the packet is handed to the
    /// link, with `Closed` once the link is gone.
    async fn send_packet(&mut self, payload: &[u8]) -> Result<()>;
}

/// Receives whole packets. Partial packets are never observable.
#[async_trait]
pub trait PacketSource: Send {
    /// Receive one packet into `buf`, returning its length.
    ///
    /// Per-packet decoding failures (`BadFrame`, `BufferTooSmall`) leave
    /// the source readable; `Closed` and I/O errors are terminal.
    async fn recv_packet(&mut self, buf: &mut [u8]) -> Result<usize>;
}

mod channel;

pub use channel::{packet_link, LinkEnd, PacketReceiver, PacketSender};
