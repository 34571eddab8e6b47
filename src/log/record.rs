//! On-disk record framing.
//!
//! ```text
//! +-------------+-----------+-------------+-----------------+
//! | offset: u64 | len: u32  | crc32: u32  | payload (len B) |
//! +-------------+-----------+-------------+-----------------+
//! ```
//!
//! All integers are big-endian. The CRC covers the payload only.

use bytes::{Buf, BufMut, BytesMut};

use crate::types::Offset;

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 16;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub offset: Offset,
    pub len: u32,
    pub crc: u32,
}

impl FrameHeader {
    pub fn decode(mut buf: &[u8]) -> Self {
        let offset = buf.get_u64();
        let len = buf.get_u32();
        let crc = buf.get_u32();
        Self { offset, len, crc }
    }

    /// Total bytes occupied by the frame, header included.
    pub fn frame_len(&self) -> u64 {
        FRAME_HEADER_LEN as u64 + self.len as u64
    }

    pub fn matches(&self, payload: &[u8]) -> bool {
        checksum(payload) == self.crc
    }
}

pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a full frame for `payload` at `offset`.
pub fn encode_frame(offset: Offset, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u64(offset);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(checksum(payload));
    buf.put_slice(payload);
    buf
}

/// On-disk size of a record with a payload of `payload_len` bytes.
pub fn framed_size(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + payload_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(7, b"hello");
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 5);
        assert_eq!(&frame[0..8], &7u64.to_be_bytes());
        assert_eq!(&frame[8..12], &5u32.to_be_bytes());
        assert_eq!(&frame[16..], b"hello");

        let header = FrameHeader::decode(&frame[..FRAME_HEADER_LEN]);
        assert_eq!(header.offset, 7);
        assert_eq!(header.len, 5);
        assert!(header.matches(b"hello"));
        assert!(!header.matches(b"hellp"));
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame(0, b"");
        let header = FrameHeader::decode(&frame);
        assert_eq!(header.frame_len(), FRAME_HEADER_LEN as u64);
        assert!(header.matches(b""));
    }
}
