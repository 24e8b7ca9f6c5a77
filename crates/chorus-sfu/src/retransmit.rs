use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Default age bound for cached packets.
pub const DEFAULT_RETRANSMIT_TTL: Duration = Duration::from_millis(500);

/// Short-TTL cache of on-the-wire packet bytes keyed by sequence number,
/// used to answer NACKs. Stores ciphertext exactly as received, never
/// plaintext. Entries are evicted by age, not by count.
#[derive(Debug)]
pub struct RetransmitBuffer {
    ttl: Duration,
    entries: HashMap<u16, (Bytes, Instant)>,
}

impl RetransmitBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Store the wire bytes for `sequence`. Expired entries are pruned on
    /// every insert.
    pub fn insert(&mut self, sequence: u16, bytes: Bytes) {
        let now = Instant::now();
        self.entries
            .retain(|_, (_, stored_at)| now.duration_since(*stored_at) <= self.ttl);
        self.entries.insert(sequence, (bytes, now));
    }

    /// Fetch the bytes for `sequence` if still within the TTL.
    pub fn get(&self, sequence: u16) -> Option<Bytes> {
        let (bytes, stored_at) = self.entries.get(&sequence)?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(bytes.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RetransmitBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RETRANSMIT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut buf = RetransmitBuffer::default();
        buf.insert(100, Bytes::from_static(b"packet-100"));
        assert_eq!(buf.get(100).unwrap(), Bytes::from_static(b"packet-100"));
        assert!(buf.get(101).is_none());
    }

    #[test]
    fn expired_entries_are_invisible() {
        let mut buf = RetransmitBuffer::new(Duration::from_millis(10));
        buf.insert(1, Bytes::from_static(b"old"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(buf.get(1).is_none());
    }

    #[test]
    fn insert_prunes_expired() {
        let mut buf = RetransmitBuffer::new(Duration::from_millis(10));
        buf.insert(1, Bytes::from_static(b"old"));
        std::thread::sleep(Duration::from_millis(25));
        buf.insert(2, Bytes::from_static(b"new"));
        assert_eq!(buf.len(), 1);
        assert!(buf.get(2).is_some());
    }

    #[test]
    fn sequence_overwrite_keeps_latest() {
        let mut buf = RetransmitBuffer::default();
        buf.insert(7, Bytes::from_static(b"first"));
        buf.insert(7, Bytes::from_static(b"second"));
        assert_eq!(buf.get(7).unwrap(), Bytes::from_static(b"second"));
        assert_eq!(buf.len(), 1);
    }
}
