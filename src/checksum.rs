//! CRC16 used to validate a written image against the value declared by the host.
//!
//! Reflected polynomial `0x8005` (`0xA001` reflected), initial value `0xFFFF`, no final XOR.
//! The host computes the same checksum over the image bytes before transferring them,
//! hence this must match bit-for-bit.

use crc::{CRC_16_MODBUS, Crc, Digest};

/// Table driven CRC16 engine.
pub static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Checksum of a complete buffer.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Start an incremental checksum, for images that cannot be read in a single go.
pub fn crc16_digest() -> Digest<'static, u16> {
    CRC16.digest()
}
