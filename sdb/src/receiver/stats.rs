//! Byte and cycle counters kept by the receiver thread.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Estimates the decoded size of a compressed payload.
///
/// Each byte carries a repeat count in its top three bits; a byte decodes to
/// `1 + (byte >> 5)` samples. The payload is not otherwise interpreted.
///
/// ```
/// use sdb::receiver::stats::estimate_decoded_size;
///
/// assert_eq!(estimate_decoded_size(&[0x00, 0x20, 0xA0]), 9);
/// ```
#[must_use]
pub fn estimate_decoded_size(compressed: &[u8]) -> u64 {
    compressed.iter().map(|&b| 1 + u64::from(b >> 5)).sum()
}

/// Point-in-time copy of the receiver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Filled bytes handed to the handler (or dropped for lack of one).
    pub compressed_bytes: u64,
    /// Sum of [`estimate_decoded_size`] over those bytes.
    pub estimated_decoded_bytes: u64,
    /// Cycles delivered to a handler.
    pub cycles_delivered: u64,
    /// Cycles whose filled size was zero.
    pub cycles_empty: u64,
    /// Non-empty cycles dropped because no handler was registered.
    pub cycles_dropped: u64,
    /// Silent periods of `notify_timeout` on the awaited slot.
    pub timeouts: u64,
    /// Slot the receiver waits on next.
    pub cursor: u32,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    compressed_bytes: AtomicU64,
    estimated_decoded_bytes: AtomicU64,
    cycles_delivered: AtomicU64,
    cycles_empty: AtomicU64,
    cycles_dropped: AtomicU64,
    timeouts: AtomicU64,
    cursor: AtomicU32,
}

impl Counters {
    pub(crate) fn add_payload(&self, compressed: u64, decoded: u64) {
        self.compressed_bytes.fetch_add(compressed, Ordering::Relaxed);
        self.estimated_decoded_bytes
            .fetch_add(decoded, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.cycles_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn empty(&self) {
        self.cycles_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.cycles_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_cursor(&self, cursor: u32) {
        self.cursor.store(cursor, Ordering::Release);
    }

    /// Clears the byte totals only.
    pub(crate) fn reset_totals(&self) {
        self.compressed_bytes.store(0, Ordering::Relaxed);
        self.estimated_decoded_bytes.store(0, Ordering::Relaxed);
    }

    /// Clears everything back to the uninitialized baseline.
    pub(crate) fn reset(&self) {
        self.reset_totals();
        self.cycles_delivered.store(0, Ordering::Relaxed);
        self.cycles_empty.store(0, Ordering::Relaxed);
        self.cycles_dropped.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
            estimated_decoded_bytes: self.estimated_decoded_bytes.load(Ordering::Relaxed),
            cycles_delivered: self.cycles_delivered.load(Ordering::Relaxed),
            cycles_empty: self.cycles_empty.load(Ordering::Relaxed),
            cycles_dropped: self.cycles_dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cursor: self.cursor.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_uses_top_three_bits() {
        assert_eq!(estimate_decoded_size(&[]), 0);
        assert_eq!(estimate_decoded_size(&[0x00, 0x20, 0xA0]), 9);
        assert_eq!(estimate_decoded_size(&[0x1F]), 1);
        assert_eq!(estimate_decoded_size(&[0xFF]), 8);
        assert_eq!(estimate_decoded_size(&[0xE0; 4096]), 8 * 4096);
    }

    #[test]
    fn totals_reset_independently_of_cycles() {
        let counters = Counters::default();
        counters.add_payload(10, 12);
        counters.delivered();
        counters.set_cursor(2);

        counters.reset_totals();
        let s = counters.snapshot();
        assert_eq!((s.compressed_bytes, s.estimated_decoded_bytes), (0, 0));
        assert_eq!(s.cycles_delivered, 1);
        assert_eq!(s.cursor, 2);

        counters.reset();
        assert_eq!(counters.snapshot(), Stats::default());
    }

    #[test]
    fn snapshot_serializes_with_field_names() {
        let counters = Counters::default();
        counters.add_payload(3, 8);
        let json = serde_json::to_value(counters.snapshot()).unwrap();
        assert_eq!(json["compressed_bytes"], 3);
        assert_eq!(json["estimated_decoded_bytes"], 8);
    }
}
