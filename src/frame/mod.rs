// Frame module - RTU FRAME HELPERS
// Checksum and response-size prediction shared by the ports

mod checksum;
mod request;

pub use checksum::{append_crc, crc16, verify_crc};
pub use request::{
    expected_response_len, function_code, RequestDescriptor, EXCEPTION_FRAME_LEN,
    EXCEPTION_MASK, MIN_REQUEST_LEN,
};
