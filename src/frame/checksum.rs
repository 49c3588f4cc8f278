// RTU Checksum
// Modbus CRC-16, stored least-significant byte first at the end of a frame

use crc::{Crc, CRC_16_MODBUS};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus CRC-16 of `bytes`
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC_MODBUS.checksum(bytes)
}

/// Append the checksum of `frame` to itself, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the trailing checksum of a complete frame
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    u16::from_le_bytes([tail[0], tail[1]]) == crc16(body)
}
