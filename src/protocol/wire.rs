//! Wire format constants and codecs.
//!
//! Every packet on a byte-stream link is framed as:
//!
//! ```text
//! ┌──────┬──────┬──────────┬─────────────────┬────────────────┐
//! │ SYNC │ LEN  │ HDR_CRC8 │ Payload         │ CRC16 (MSB 1st)│
//! │ 0xAA │ 1 B  │ 1 B      │ LEN bytes       │ 2 B            │
//! └──────┴──────┴──────────┴─────────────────┴────────────────┘
//! ```
//!
//! `LEN` is a single byte with its MSB reserved (must be 0), so payloads
//! are capped at 127 bytes. Keeping the header CRC separate from the
//! payload CRC lets a receiver reject a malformed length byte before it
//! commits to the payload read.
//!
//! Inside the framing, an endpoint request carries a 4-byte prefix and a
//! reply echoes the request's sequence number:
//!
//! ```text
//! request: [seqno lo] [seqno hi] [endpoint lo] [endpoint hi | 0x80] [payload...]
//! reply:   [seqno lo] [seqno hi] [payload...]
//! ```

use super::crc::{header_crc, payload_crc};

/// Sync byte opening every frame header.
pub const SYNC_BYTE: u8 = 0xAA;

/// Frame header size: sync (1) + length (1) + CRC-8 (1).
pub const FRAME_HEADER_SIZE: usize = 3;

/// Frame trailer size: payload CRC-16, most-significant byte first.
pub const FRAME_TRAILER_SIZE: usize = 2;

/// Largest payload a frame can carry (the length byte's MSB is reserved).
pub const MAX_FRAME_PAYLOAD: usize = 127;

/// Default MTU for framed stream links.
pub const DEFAULT_MTU: usize = MAX_FRAME_PAYLOAD;

/// Size of the seqno + endpoint id prefix on every request payload.
pub const REQUEST_HEADER_SIZE: usize = 4;

/// Size of the echoed seqno prefix on every reply payload.
pub const REPLY_HEADER_SIZE: usize = 2;

/// Endpoint id bit requesting an acknowledgement from the device.
pub const EXPECT_ACK: u16 = 0x8000;

/// Protocol version, exchanged out of band via a well-known endpoint.
pub const PROTOCOL_VERSION: u16 = 1;

/// Encode a frame header for a payload of `len` bytes.
///
/// `len` must not exceed [`MAX_FRAME_PAYLOAD`]; callers validate before
/// encoding.
pub fn encode_frame_header(len: u8) -> [u8; FRAME_HEADER_SIZE] {
    debug_assert!(len as usize <= MAX_FRAME_PAYLOAD);
    let mut header = [SYNC_BYTE, len, 0];
    header[2] = header_crc(&header[..2]);
    header
}

/// Decode and validate a frame header.
///
/// Returns the payload length, or `None` if the sync byte, the reserved
/// length MSB, or the header CRC does not check out.
pub fn decode_frame_header(header: &[u8; FRAME_HEADER_SIZE]) -> Option<usize> {
    if header[0] != SYNC_BYTE {
        return None;
    }
    if header[1] & 0x80 != 0 {
        return None;
    }
    if header_crc(&header[..2]) != header[2] {
        return None;
    }
    Some(header[1] as usize)
}

/// Encode the payload CRC trailer, most-significant byte first.
pub fn encode_frame_trailer(payload: &[u8]) -> [u8; FRAME_TRAILER_SIZE] {
    payload_crc(payload).to_be_bytes()
}

/// Verify a payload against its received trailer.
pub fn verify_frame_trailer(payload: &[u8], trailer: [u8; FRAME_TRAILER_SIZE]) -> bool {
    payload_crc(payload) == u16::from_be_bytes(trailer)
}

/// Request prefix: sequence number plus destination endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Request identifier echoed by the reply.
    pub seqno: u16,
    /// Destination endpoint (15-bit; the MSB is the expect-ack flag and
    /// is set on encode).
    pub endpoint_id: u16,
}

impl RequestHeader {
    /// Encode to the 4-byte little-endian wire prefix with the
    /// expect-ack bit set.
    pub fn encode(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.seqno.to_le_bytes());
        buf[2..4].copy_from_slice(&(self.endpoint_id | EXPECT_ACK).to_le_bytes());
        buf
    }

    /// Decode a request prefix from a packet payload.
    ///
    /// Returns the header and the remaining request payload, or `None`
    /// if the packet is too short.
    pub fn decode(packet: &[u8]) -> Option<(Self, &[u8])> {
        if packet.len() < REQUEST_HEADER_SIZE {
            return None;
        }
        let seqno = u16::from_le_bytes([packet[0], packet[1]]);
        let endpoint_id = u16::from_le_bytes([packet[2], packet[3]]);
        Some((
            Self {
                seqno,
                endpoint_id: endpoint_id & !EXPECT_ACK,
            },
            &packet[REQUEST_HEADER_SIZE..],
        ))
    }

    /// Whether the raw endpoint field in `packet` has the expect-ack bit.
    pub fn expects_ack(packet: &[u8]) -> bool {
        packet.len() >= REQUEST_HEADER_SIZE
            && u16::from_le_bytes([packet[2], packet[3]]) & EXPECT_ACK != 0
    }
}

/// Decode a reply packet into its echoed seqno and payload.
///
/// Returns `None` for packets too short to carry a seqno.
pub fn decode_reply(packet: &[u8]) -> Option<(u16, &[u8])> {
    if packet.len() < REPLY_HEADER_SIZE {
        return None;
    }
    let seqno = u16::from_le_bytes([packet[0], packet[1]]);
    Some((seqno, &packet[REPLY_HEADER_SIZE..]))
}

/// Encode a reply packet: echoed seqno followed by the reply payload.
pub fn encode_reply(seqno: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(REPLY_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&seqno.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}
