//! Wire protocol: CRC parameters, framing codec, and packet layouts.

pub mod crc;
pub mod framer;
pub mod wire;

pub use framer::{PacketUnwrapper, PacketWrapper};
pub use wire::{
    decode_reply, encode_reply, RequestHeader, DEFAULT_MTU, EXPECT_ACK, FRAME_HEADER_SIZE,
    FRAME_TRAILER_SIZE, MAX_FRAME_PAYLOAD, PROTOCOL_VERSION, REPLY_HEADER_SIZE,
    REQUEST_HEADER_SIZE, SYNC_BYTE,
};
