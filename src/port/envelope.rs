// UDP Bridge Envelope
// Fixed 116-byte header wrapped around serial RTU frames by the UDP-to-serial gateway
//
// Layout (all fields u16 little-endian, everything else zero):
//   2   magic           600 outbound, 602 inbound
//   36  connector       RS-485 connector selector
//   38  expected length serial answer length the gateway waits for
//   102 hub             RS-485 hub selector
//   104 payload length  serial frame length
//   116 payload

/// Bytes in front of the serial payload
pub const HEADER_LEN: usize = 116;

/// Magic of a datagram sent to the bridge
pub const REQUEST_MAGIC: u16 = 600;

/// Magic of a datagram sent by the bridge
pub const RESPONSE_MAGIC: u16 = 602;

/// Header plus the smallest serial answer (an exception frame)
pub const MIN_DATAGRAM_LEN: usize = HEADER_LEN + 5;

/// UDP port the bridge listens on
pub const DEFAULT_BRIDGE_PORT: u16 = 0x7002;

const MAGIC_OFFSET: usize = 2;
const CONNECTOR_OFFSET: usize = 36;
const EXPECTED_LEN_OFFSET: usize = 38;
const HUB_OFFSET: usize = 102;
const PAYLOAD_LEN_OFFSET: usize = 104;

const FALLBACK_LEN: usize = 5;

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Wrap an RTU frame for the bridge
pub fn encode_request(frame: &[u8], connector: u16, hub: u16, expected_len: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; HEADER_LEN + frame.len()];

    put_u16(&mut buffer, MAGIC_OFFSET, REQUEST_MAGIC);
    put_u16(&mut buffer, CONNECTOR_OFFSET, connector);
    put_u16(
        &mut buffer,
        EXPECTED_LEN_OFFSET,
        u16::try_from(expected_len).unwrap_or(u16::MAX),
    );
    put_u16(&mut buffer, HUB_OFFSET, hub);
    put_u16(
        &mut buffer,
        PAYLOAD_LEN_OFFSET,
        u16::try_from(frame.len()).unwrap_or(u16::MAX),
    );
    buffer[HEADER_LEN..].copy_from_slice(frame);

    buffer
}

/// Magic value of a datagram, if it is long enough to carry one
pub fn magic(datagram: &[u8]) -> Option<u16> {
    get_u16(datagram, MAGIC_OFFSET)
}

/// Expected answer length field of an envelope
pub fn expected_len(envelope: &[u8]) -> Option<u16> {
    get_u16(envelope, EXPECTED_LEN_OFFSET)
}

/// Serial payload of an envelope, bounded by its payload length field
pub fn payload(envelope: &[u8]) -> Option<&[u8]> {
    let len = get_u16(envelope, PAYLOAD_LEN_OFFSET)? as usize;
    envelope.get(HEADER_LEN..HEADER_LEN + len)
}

/// Candidate answer frames carried at the end of a bridge datagram.
///
/// The primary candidate is the last `expected_len` bytes and is only offered
/// when it fits inside the body after the header. The fallback is the last
/// five bytes, the size of an exception answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCandidates<'a> {
    pub primary: Option<&'a [u8]>,
    pub fallback: Option<&'a [u8]>,
}

pub fn response_candidates(datagram: &[u8], expected_len: usize) -> ResponseCandidates<'_> {
    let body_len = datagram.len().saturating_sub(HEADER_LEN);
    let tail = |len: usize| {
        if len == 0 || len > body_len {
            None
        } else {
            datagram.get(datagram.len() - len..)
        }
    };

    ResponseCandidates {
        primary: tail(expected_len),
        fallback: tail(FALLBACK_LEN),
    }
}
