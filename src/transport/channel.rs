//! In-memory packet link backed by tokio channels.
//!
//! Stands in for natively datagram-oriented transports (USB bulk
//! endpoints) in tests and loopback wiring: each send moves one whole
//! packet, no framing involved. Dropping either end closes the link in
//! both directions.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{PacketSink, PacketSource};
use crate::error::{DrivelinkError, Result};

/// Sending half of an in-memory packet link.
pub struct PacketSender {
    tx: mpsc::Sender<Bytes>,
}

/// Receiving half of an in-memory packet link.
pub struct PacketReceiver {
    rx: mpsc::Receiver<Bytes>,
}

/// One endpoint of a bidirectional packet link.
pub struct LinkEnd {
    /// Outgoing packets.
    pub tx: PacketSender,
    /// Incoming packets.
    pub rx: PacketReceiver,
}

/// Create a bidirectional in-memory packet link.
///
/// `capacity` bounds the number of packets buffered per direction.
pub fn packet_link(capacity: usize) -> (LinkEnd, LinkEnd) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        LinkEnd {
            tx: PacketSender { tx: a_tx },
            rx: PacketReceiver { rx: a_rx },
        },
        LinkEnd {
            tx: PacketSender { tx: b_tx },
            rx: PacketReceiver { rx: b_rx },
        },
    )
}

#[async_trait]
impl PacketSink for PacketSender {
    async fn send_packet(&mut self, payload: &[u8]) -> Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(payload))
            .await
            .map_err(|_| DrivelinkError::Closed)
    }
}

#[async_trait]
impl PacketSource for PacketReceiver {
    async fn recv_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        let packet = self.rx.recv().await.ok_or(DrivelinkError::Closed)?;
        if packet.len() > buf.len() {
            return Err(DrivelinkError::BufferTooSmall(
                "packet exceeds read buffer",
            ));
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }
}
