//! CRC parameters protecting the frame header and payload.
//!
//! Both polynomials come from Koopman's tables and give a Hamming
//! distance of 5 at the sizes used here: CRC-8/0x37 over the 2-byte
//! header prefix, CRC-16/0x3D65 (CRC-16-DNP) over payloads of up to
//! 135 bytes. Neither algorithm reflects its input or applies a final
//! XOR; the CRC-16 goes on the wire most-significant byte first.

use crc::{Algorithm, Crc};

/// CRC-8 parameters for the frame header (poly 0x37, init 0x42).
pub const HEADER_CRC8_ALG: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x37,
    init: 0x42,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x8c,
    residue: 0x00,
};

/// CRC-16 parameters for the frame payload (poly 0x3d65, init 0x1337).
pub const PAYLOAD_CRC16_ALG: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x3d65,
    init: 0x1337,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0xaa01,
    residue: 0x0000,
};

const HEADER_CRC8: Crc<u8> = Crc::<u8>::new(&HEADER_CRC8_ALG);
const PAYLOAD_CRC16: Crc<u16> = Crc::<u16>::new(&PAYLOAD_CRC16_ALG);

/// CRC-8 over the sync and length bytes of a frame header.
pub fn header_crc(data: &[u8]) -> u8 {
    HEADER_CRC8.checksum(data)
}

/// CRC-16 over a frame payload.
pub fn payload_crc(data: &[u8]) -> u16 {
    PAYLOAD_CRC16.checksum(data)
}
