// Request Descriptor
// Remembers what the last outbound request expects back and validates candidate responses

use crate::frame::crc16;
use serde::{Deserialize, Serialize};

/// Smallest outbound frame a port will forward: unit id, function code, 4 bytes
pub const MIN_REQUEST_LEN: usize = 6;

/// Size of an exception response: unit id, function code | 0x80, code, CRC
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Clears the exception bit of a response function code
pub const EXCEPTION_MASK: u8 = 0x7F;

/// Modbus function codes the ports know the response size of
pub mod function_code {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Predict the length of the RTU response to a request.
///
/// `quantity` is the big-endian word at request bytes 4..6 (bit or register
/// count for the read functions). Unknown function codes yield 0, which no
/// response can satisfy.
pub fn expected_response_len(function: u8, quantity: u16) -> usize {
    use function_code::*;

    let quantity = quantity as usize;
    match function {
        READ_COILS | READ_DISCRETE_INPUTS => 3 + quantity.div_ceil(8) + 2,
        READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => 3 + 2 * quantity + 2,
        WRITE_SINGLE_COIL | WRITE_SINGLE_REGISTER | WRITE_MULTIPLE_COILS
        | WRITE_MULTIPLE_REGISTERS => 6 + 2,
        _ => 0,
    }
}

/// The single outstanding request a response is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    unit_id: u8,
    function_code: u8,
    expected_len: usize,
}

impl RequestDescriptor {
    pub fn new(unit_id: u8, function_code: u8, expected_len: usize) -> Self {
        Self {
            unit_id,
            function_code,
            expected_len,
        }
    }

    /// Describe an outbound RTU frame, or `None` if it is too short to forward
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < MIN_REQUEST_LEN {
            return None;
        }
        let quantity = u16::from_be_bytes([frame[4], frame[5]]);
        Some(Self::new(
            frame[0],
            frame[1],
            expected_response_len(frame[1], quantity),
        ))
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn function_code(&self) -> u8 {
        self.function_code
    }

    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Whether any inbound frame can ever match this request
    pub fn is_trackable(&self) -> bool {
        self.expected_len >= MIN_REQUEST_LEN
    }

    /// Check a candidate response frame against this request.
    ///
    /// Accepts either a normal response of the expected length or a 5-byte
    /// exception response; unit id, function code (exception bit masked) and
    /// trailing CRC must all match.
    pub fn accepts(&self, candidate: &[u8]) -> bool {
        let len = candidate.len();
        if len != self.expected_len && len != EXCEPTION_FRAME_LEN {
            return false;
        }
        // A zero expected length must not let a 0..2 byte slice through
        if len < 3 {
            return false;
        }

        let crc_in = u16::from_le_bytes([candidate[len - 2], candidate[len - 1]]);

        candidate[0] == self.unit_id
            && (candidate[1] & EXCEPTION_MASK) == self.function_code
            && crc16(&candidate[..len - 2]) == crc_in
    }
}
