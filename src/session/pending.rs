//! Tracking for pipelined commands awaiting confirmation.
//!
//! Every tracked command keeps its full payload so a resend can resubmit the
//! identical sequence and bytes; the machine dedupes already-applied
//! sequences, which makes resending safe to repeat.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::machine::command::Command;

/// One command in flight: payload plus when it was (last) submitted.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command: Command,
    pub submitted_at: Instant,
}

/// Ordered table of unconfirmed commands keyed by correlation sequence.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: BTreeMap<u64, PendingCommand>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sequence: u64, command: Command, now: Instant) {
        self.entries.insert(
            sequence,
            PendingCommand {
                command,
                submitted_at: now,
            },
        );
    }

    /// Resolve one confirmation; returns the command it confirmed.
    pub fn confirm(&mut self, sequence: u64) -> Option<PendingCommand> {
        self.entries.remove(&sequence)
    }

    pub fn get(&self, sequence: u64) -> Option<&PendingCommand> {
        self.entries.get(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequences older than `age`, in submission order.
    pub fn stale(&self, now: Instant, age: Duration) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, p)| now.duration_since(p.submitted_at) >= age)
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// All pending commands in sequence order, for resubmission.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (u64, &Command)> {
        self.entries.iter().map(|(seq, p)| (*seq, &p.command))
    }

    /// Refresh the submission time after a resend so the stale scan does not
    /// fire again immediately.
    pub fn touch(&mut self, sequence: u64, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&sequence) {
            entry.submitted_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::command::Message;

    fn cmd(seq: u64) -> Command {
        Command::Enqueue {
            sender: "s".into(),
            sequence: Some(seq),
            message: Message::new("x"),
        }
    }

    #[test]
    fn confirm_removes_entries() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        table.insert(1, cmd(1), now);
        table.insert(2, cmd(2), now);
        assert_eq!(table.len(), 2);
        assert!(table.confirm(1).is_some());
        assert!(table.confirm(1).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_scan_respects_age_and_order() {
        let mut table = PendingTable::new();
        let old = Instant::now() - Duration::from_secs(10);
        table.insert(2, cmd(2), old);
        table.insert(1, cmd(1), old);
        table.insert(3, cmd(3), Instant::now());
        let stale = table.stale(Instant::now(), Duration::from_secs(5));
        assert_eq!(stale, vec![1, 2]);
    }

    #[test]
    fn touch_resets_the_stale_timer() {
        let mut table = PendingTable::new();
        let old = Instant::now() - Duration::from_secs(10);
        table.insert(1, cmd(1), old);
        table.touch(1, Instant::now());
        assert!(table.stale(Instant::now(), Duration::from_secs(5)).is_empty());
    }
}
