//! Dead-letter collaborator boundary.
//!
//! Discarded messages leave the queue through exactly one door: the
//! configured handler. Dead-letter delivery never re-enters the normal
//! delivery scan.

use crate::machine::command::Message;
use parking_lot::Mutex;

/// Receives messages that were discarded rather than settled.
pub trait DeadLetterHandler: Send + Sync {
    fn handle(&self, reason: &str, messages: Vec<Message>);
}

/// Default handler when none is configured: record and drop.
#[derive(Debug, Default)]
pub struct LogDeadLetter;

impl DeadLetterHandler for LogDeadLetter {
    fn handle(&self, reason: &str, messages: Vec<Message>) {
        tracing::warn!(
            reason,
            count = messages.len(),
            "dead-lettered messages dropped (no handler configured)"
        );
    }
}

/// Handler that keeps everything it receives; used by tests and audits.
#[derive(Debug, Default)]
pub struct CollectingDeadLetter {
    seen: Mutex<Vec<(String, Vec<Message>)>>,
}

impl CollectingDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything collected so far.
    pub fn take(&self) -> Vec<(String, Vec<Message>)> {
        std::mem::take(&mut self.seen.lock())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

impl DeadLetterHandler for CollectingDeadLetter {
    fn handle(&self, reason: &str, messages: Vec<Message>) {
        self.seen.lock().push((reason.to_string(), messages));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_handler_keeps_reason_and_batch() {
        let handler = CollectingDeadLetter::new();
        handler.handle("expired", vec![Message::new("m1"), Message::new("m2")]);
        let taken = handler.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, "expired");
        assert_eq!(taken[0].1.len(), 2);
        assert!(handler.is_empty());
    }
}
