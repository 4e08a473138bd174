//! Bounded batch buffer: thread-safe FIFO of readings with messageId
//! deduplication and a timed/size flush trigger.
//!
//! The dedup ring only shields against the peer engine re-delivering
//! self-originated records; cloud-side dedup remains authoritative.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::reading::Reading;

/// Max messageIds tracked for dedup before FIFO eviction.
const DEDUP_CACHE_MAX: usize = 10_000;

/// Handle shared by the ingest workers, the drain loop, and the peer engine.
/// A config swap replaces the buffer in place under this mutex, so every
/// holder observes the swap atomically.
pub type SharedBuffer = Arc<Mutex<BatchBuffer>>;

// ---------------------------------------------------------------------------
// Dedup ring
// ---------------------------------------------------------------------------

/// FIFO-evicting set of messageIds with a bounded capacity.
pub(crate) struct DedupRing {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl DedupRing {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Insert an id, evicting the oldest entries once over capacity.
    /// Returns `false` if the id was already present.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

// ---------------------------------------------------------------------------
// Batch buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    Duplicate,
}

pub struct BatchBuffer {
    batch_size: usize,
    max_wait: Duration,
    entries: VecDeque<Reading>,
    seen: DedupRing,
    last_flush: Instant,
}

impl BatchBuffer {
    pub fn new(batch_size: usize, max_wait_seconds: f64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_wait: Duration::from_secs_f64(max_wait_seconds.max(0.0)),
            entries: VecDeque::new(),
            seen: DedupRing::new(DEDUP_CACHE_MAX),
            last_flush: Instant::now(),
        }
    }

    /// Append a reading unless its messageId was already seen.  Readings
    /// without a messageId bypass dedup entirely.
    pub fn add(&mut self, reading: Reading) -> AddOutcome {
        if let Some(id) = reading.message_id.clone() {
            if self.seen.contains(&id) {
                return AddOutcome::Duplicate;
            }
            self.seen.insert(&id);
        }
        self.entries.push_back(reading);
        AddOutcome::Accepted
    }

    /// Return up to `batch_size` oldest records if the buffer is full enough
    /// or stale enough, removing them and resetting the flush clock.
    pub fn get_batch_if_ready(&mut self) -> Option<Vec<Reading>> {
        let now = Instant::now();
        let size_ready = self.entries.len() >= self.batch_size;
        let time_ready =
            !self.entries.is_empty() && now.duration_since(self.last_flush) >= self.max_wait;

        if !size_ready && !time_ready {
            return None;
        }

        let count = self.entries.len().min(self.batch_size);
        let batch: Vec<Reading> = self.entries.drain(..count).collect();
        self.last_flush = now;
        Some(batch)
    }

    /// Prepend a failed batch so its records retry ahead of newer data.
    pub fn requeue(&mut self, batch: Vec<Reading>) {
        for reading in batch.into_iter().rev() {
            self.entries.push_front(reading);
        }
    }

    /// Remove and return everything pending.
    pub fn flush_all(&mut self) -> Vec<Reading> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_wait_seconds(&self) -> f64 {
        self.max_wait.as_secs_f64()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(id: &str) -> Reading {
        let mut r: Reading = serde_json::from_str(
            r#"{"deviceId":"d1","sensorType":"temperature","timestamp":"2026-07-30T12:00:00Z","value":21.5,"unit":"C"}"#,
        )
        .unwrap();
        r.message_id = Some(id.to_string());
        r
    }

    fn ids(batch: &[Reading]) -> Vec<&str> {
        batch
            .iter()
            .map(|r| r.message_id.as_deref().unwrap())
            .collect()
    }

    // -- add / dedup --------------------------------------------------------

    #[test]
    fn add_accepts_new_reading() {
        let mut buf = BatchBuffer::new(10, 60.0);
        assert_eq!(buf.add(reading("a")), AddOutcome::Accepted);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn add_rejects_duplicate_message_id() {
        let mut buf = BatchBuffer::new(10, 60.0);
        buf.add(reading("a"));
        assert_eq!(buf.add(reading("a")), AddOutcome::Duplicate);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn duplicate_does_not_change_buffer_contents() {
        let mut buf = BatchBuffer::new(2, 60.0);
        buf.add(reading("a"));
        buf.add(reading("b"));
        buf.add(reading("a"));

        let batch = buf.get_batch_if_ready().unwrap();
        assert_eq!(ids(&batch), ["a", "b"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn reading_without_message_id_bypasses_dedup() {
        let mut buf = BatchBuffer::new(10, 60.0);
        let mut r = reading("x");
        r.message_id = None;
        buf.add(r.clone());
        assert_eq!(buf.add(r), AddOutcome::Accepted);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn dedup_still_rejects_after_drain() {
        // The dedup window outlives individual batches.
        let mut buf = BatchBuffer::new(1, 60.0);
        buf.add(reading("a"));
        buf.get_batch_if_ready().unwrap();
        assert_eq!(buf.add(reading("a")), AddOutcome::Duplicate);
    }

    // -- get_batch_if_ready -------------------------------------------------

    #[test]
    fn batch_returned_when_size_reached() {
        let mut buf = BatchBuffer::new(3, 60.0);
        buf.add(reading("a"));
        buf.add(reading("b"));
        assert!(buf.get_batch_if_ready().is_none());

        buf.add(reading("c"));
        let batch = buf.get_batch_if_ready().unwrap();
        assert_eq!(ids(&batch), ["a", "b", "c"]);
    }

    #[test]
    fn batch_is_capped_at_batch_size() {
        let mut buf = BatchBuffer::new(2, 60.0);
        for id in ["a", "b", "c"] {
            buf.add(reading(id));
        }
        let batch = buf.get_batch_if_ready().unwrap();
        assert_eq!(ids(&batch), ["a", "b"]);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn empty_buffer_never_flushes() {
        let mut buf = BatchBuffer::new(1, 0.0);
        assert!(buf.get_batch_if_ready().is_none());
    }

    #[test]
    fn time_trigger_flushes_partial_batch() {
        // max_wait of zero: any non-empty buffer is immediately stale.
        let mut buf = BatchBuffer::new(100, 0.0);
        buf.add(reading("a"));
        let batch = buf.get_batch_if_ready().unwrap();
        assert_eq!(ids(&batch), ["a"]);
    }

    #[test]
    fn nothing_ready_below_size_within_wait() {
        let mut buf = BatchBuffer::new(100, 3600.0);
        buf.add(reading("a"));
        assert!(buf.get_batch_if_ready().is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn drained_batch_is_removed() {
        let mut buf = BatchBuffer::new(3, 60.0);
        for id in ["a", "b", "c"] {
            buf.add(reading(id));
        }
        buf.get_batch_if_ready().unwrap();
        assert!(buf.get_batch_if_ready().is_none());
        assert!(buf.is_empty());
    }

    // -- requeue ------------------------------------------------------------

    #[test]
    fn requeue_preserves_order_ahead_of_newer_data() {
        let mut buf = BatchBuffer::new(2, 60.0);
        buf.add(reading("d"));
        buf.add(reading("e"));
        let failed = buf.get_batch_if_ready().unwrap();

        buf.add(reading("f"));
        buf.requeue(failed);

        let batch = buf.get_batch_if_ready().unwrap();
        assert_eq!(ids(&batch), ["d", "e"]);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn requeue_into_empty_buffer() {
        let mut buf = BatchBuffer::new(2, 60.0);
        buf.requeue(vec![reading("a"), reading("b")]);
        let batch = buf.get_batch_if_ready().unwrap();
        assert_eq!(ids(&batch), ["a", "b"]);
    }

    // -- flush_all ----------------------------------------------------------

    #[test]
    fn flush_all_returns_everything_in_order() {
        let mut buf = BatchBuffer::new(100, 3600.0);
        for id in ["a", "b", "c"] {
            buf.add(reading(id));
        }
        let all = buf.flush_all();
        assert_eq!(ids(&all), ["a", "b", "c"]);
        assert!(buf.is_empty());
    }

    // -- dedup ring ---------------------------------------------------------

    #[test]
    fn dedup_ring_evicts_oldest_over_cap() {
        let mut ring = DedupRing::new(3);
        for id in ["a", "b", "c", "d"] {
            ring.insert(id);
        }
        assert_eq!(ring.len(), 3);
        assert!(!ring.contains("a"));
        assert!(ring.contains("b"));
        assert!(ring.contains("d"));
    }

    #[test]
    fn dedup_ring_insert_reports_known_ids() {
        let mut ring = DedupRing::new(3);
        assert!(ring.insert("a"));
        assert!(!ring.insert("a"));
        assert_eq!(ring.len(), 1);
    }
}
