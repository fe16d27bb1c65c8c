//! Per-consumer delivery counter tracking.
//!
//! Delivery batches carry the sending checkout's batch counter. Tracking the
//! last counter processed per tag lets a session drop duplicate transport
//! deliveries and notice gaps left by dropped delivery events.

use std::collections::HashMap;

/// Verdict for one incoming delivery batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryCheck {
    /// Next expected counter; surface the batch.
    Accept,
    /// Counter at or below the last processed one; drop the batch.
    Duplicate,
    /// Counter jumped ahead; batches starting at `expected` are missing.
    Gap { expected: u64 },
}

/// Last processed delivery counter per consumer tag.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    last: HashMap<String, u64>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an incoming batch counter. Does not advance state; call
    /// [`DeliveryTracker::advance`] once the batch (or its repair) has been
    /// surfaced.
    pub fn observe(&self, tag: &str, counter: u64) -> DeliveryCheck {
        let last = self.last.get(tag).copied().unwrap_or(0);
        if counter <= last {
            DeliveryCheck::Duplicate
        } else if counter == last + 1 {
            DeliveryCheck::Accept
        } else {
            DeliveryCheck::Gap { expected: last + 1 }
        }
    }

    pub fn last_seen(&self, tag: &str) -> u64 {
        self.last.get(tag).copied().unwrap_or(0)
    }

    /// Record that everything up to `counter` has been surfaced.
    pub fn advance(&mut self, tag: &str, counter: u64) {
        let entry = self.last.entry(tag.to_string()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Forget a cancelled checkout so a future tag reuse starts fresh.
    pub fn forget(&mut self, tag: &str) {
        self.last.remove(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_batch_must_carry_counter_one() {
        let tracker = DeliveryTracker::new();
        assert_eq!(tracker.observe("c1", 1), DeliveryCheck::Accept);
        assert_eq!(tracker.observe("c1", 3), DeliveryCheck::Gap { expected: 1 });
    }

    #[test]
    fn replayed_batches_are_duplicates() {
        let mut tracker = DeliveryTracker::new();
        tracker.advance("c1", 2);
        assert_eq!(tracker.observe("c1", 1), DeliveryCheck::Duplicate);
        assert_eq!(tracker.observe("c1", 2), DeliveryCheck::Duplicate);
        assert_eq!(tracker.observe("c1", 3), DeliveryCheck::Accept);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let mut tracker = DeliveryTracker::new();
        tracker.advance("c1", 5);
        tracker.advance("c1", 3);
        assert_eq!(tracker.last_seen("c1"), 5);
    }

    #[test]
    fn forget_resets_the_tag() {
        let mut tracker = DeliveryTracker::new();
        tracker.advance("c1", 4);
        tracker.forget("c1");
        assert_eq!(tracker.observe("c1", 1), DeliveryCheck::Accept);
    }
}
