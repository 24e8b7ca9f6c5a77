use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z
const CHORUS_EPOCH: u64 = 1_735_689_600_000;

const SEQUENCE_BITS: u64 = 12;
const WORKER_BITS: u64 = 10;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;

/// Packed `timestamp << 12 | sequence` of the most recently issued id.
static LAST: AtomicU64 = AtomicU64::new(0);

fn millis_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
        - CHORUS_EPOCH
}

/// Generate a snowflake id.
/// Format: 42 bits timestamp | 10 bits worker | 12 bits sequence
///
/// The (timestamp, sequence) pair lives packed in [`LAST`] and advances by
/// compare-exchange. A millisecond whose 4096 sequence slots are exhausted
/// rolls into the next millisecond; the clock catches up within a tick.
pub fn generate(worker_id: u16) -> i64 {
    loop {
        let observed = LAST.load(Ordering::Acquire);
        let last_ts = observed >> SEQUENCE_BITS;
        let now = millis_since_epoch();

        let claimed = if now > last_ts {
            // Fresh millisecond, sequence restarts at zero.
            now << SEQUENCE_BITS
        } else if (observed & SEQUENCE_MASK) < SEQUENCE_MASK {
            // Same millisecond (or clock rewind), take the next slot.
            observed + 1
        } else {
            // Slots exhausted, borrow from the following millisecond.
            (last_ts + 1) << SEQUENCE_BITS
        };

        if LAST
            .compare_exchange(observed, claimed, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let timestamp = claimed >> SEQUENCE_BITS;
            let sequence = claimed & SEQUENCE_MASK;
            return ((timestamp << (WORKER_BITS + SEQUENCE_BITS))
                | ((worker_id as u64 & WORKER_MASK) << SEQUENCE_BITS)
                | sequence) as i64;
        }
    }
}

/// Extract the Unix timestamp (ms) from a snowflake.
pub fn timestamp_millis(id: i64) -> u64 {
    ((id as u64) >> (WORKER_BITS + SEQUENCE_BITS)) + CHORUS_EPOCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let a = generate(1);
        let b = generate(1);
        assert!(b > a);
    }

    #[test]
    fn burst_of_ids_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generate(1)));
        }
    }

    #[test]
    fn timestamp_round_trip() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let id = generate(1);
        let ts = timestamp_millis(id);
        assert!(ts >= before);
        assert!(ts <= before + 1_000);
    }

    #[test]
    fn worker_id_lands_in_its_field() {
        let id = generate(0x3FF) as u64;
        assert_eq!((id >> SEQUENCE_BITS) & WORKER_MASK, 0x3FF);
    }
}
