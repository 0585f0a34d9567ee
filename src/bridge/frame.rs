//! WebSocket bridge frame codec
//!
//! Each WebSocket binary message carries one frame: a fixed 8-byte header
//! (4 bytes big-endian stream id, 4 bytes big-endian payload length)
//! followed by exactly `length` payload bytes. Trailing bytes beyond the
//! declared length are ignored; messages shorter than the declared length
//! are malformed and dropped.

/// Length of the fixed frame header in bytes
pub const FRAME_HEADER_LEN: usize = 8;

/// Stream identifier used by every bridge today. Other ids are reserved
/// for future multiplexing and silently dropped on receive.
pub const BRIDGE_STREAM_ID: u32 = 1;

/// Encode a payload into a framed WebSocket message body
#[must_use]
pub fn encode_frame(stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&stream_id.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a framed WebSocket message body
///
/// Returns the stream id and payload slice, or `None` when the message is
/// too short for the header or truncates the declared payload.
#[must_use]
pub fn decode_frame(data: &[u8]) -> Option<(u32, &[u8])> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    let stream_id = u32::from_be_bytes(data[0..4].try_into().ok()?);
    let len = u32::from_be_bytes(data[4..8].try_into().ok()?) as usize;
    let payload = data.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len)?;
    Some((stream_id, payload))
}
