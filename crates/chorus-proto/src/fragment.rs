use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

pub const FRAGMENT_HEADER_SIZE: usize = 12;

/// Video frames larger than this are split into fragments by the sender.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1200;

/// 12-byte fragmentation header preceding the ciphertext of fragmented
/// video frames.
///
/// ```text
/// Bytes 0-3:  Frame id (u32)
/// Bytes 4-5:  Fragment index (u16)
/// Bytes 6-7:  Fragment count (u16)
/// Bytes 8-11: Total frame length (u32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub frame_id: u32,
    pub frag_index: u16,
    pub frag_count: u16,
    pub frame_length: u32,
}

impl FragmentHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.frame_id);
        buf.put_u16(self.frag_index);
        buf.put_u16(self.frag_count);
        buf.put_u32(self.frame_length);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::BufferTooShort {
                expected: FRAGMENT_HEADER_SIZE,
                actual: buf.remaining(),
            });
        }
        Ok(Self {
            frame_id: buf.get_u32(),
            frag_index: buf.get_u16(),
            frag_count: buf.get_u16(),
            frame_length: buf.get_u32(),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn is_last(&self) -> bool {
        self.frag_count > 0 && self.frag_index == self.frag_count - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_round_trip() {
        let header = FragmentHeader {
            frame_id: 42,
            frag_index: 3,
            frag_count: 8,
            frame_length: 9_000,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), FRAGMENT_HEADER_SIZE);
        let decoded = FragmentHeader::decode(&mut bytes.as_ref()).unwrap();
        assert_eq!(header, decoded);
        assert!(!decoded.is_last());
    }

    #[test]
    fn last_fragment() {
        let header = FragmentHeader {
            frame_id: 1,
            frag_index: 7,
            frag_count: 8,
            frame_length: 9_000,
        };
        assert!(header.is_last());
    }

    #[test]
    fn short_buffer_rejected() {
        let buf = [0u8; 6];
        assert!(matches!(
            FragmentHeader::decode(&mut buf.as_slice()),
            Err(ProtocolError::BufferTooShort { .. })
        ));
    }
}
