//! Replicated command payloads, apply effects, and read-only queries.
//!
//! Commands are the only way queue state changes; they travel through the
//! command log and are applied in log order by [`crate::machine::QueueMachine`].
//! Effects are what the machine hands back to the log for asynchronous
//! delivery to sessions and the dead-letter collaborator.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broker-assigned message identity, monotonically increasing per queue.
pub type MsgId = u64;

/// Opaque message body plus the caller's enqueue-confirmation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Caller-supplied token echoed back when the enqueue is confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<u64>,
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            correlation: None,
            body: body.into(),
        }
    }

    pub fn with_correlation(correlation: u64, body: impl Into<Bytes>) -> Self {
        Self {
            correlation: Some(correlation),
            body: body.into(),
        }
    }
}

/// Flow-control mode attached to a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutSpec {
    /// Fixed window; credit is replenished by one for each settled message.
    Prefetch { count: u32 },
    /// Credit is granted explicitly via `Credit` commands.
    Credited,
}

/// Caller-visible metadata recorded with a checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerMeta {
    /// Owner label surfaced by the consumer-listing query.
    #[serde(default)]
    pub owner: String,
}

/// Replicated queue operation payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "data")]
pub enum Command {
    Enqueue {
        sender: String,
        /// `None` bypasses sequence tracking (fire-and-forget injection).
        sequence: Option<u64>,
        message: Message,
    },
    Checkout {
        tag: String,
        spec: CheckoutSpec,
        meta: ConsumerMeta,
    },
    Credit {
        tag: String,
        amount: u32,
        drain: bool,
    },
    Settle {
        tag: String,
        msg_ids: Vec<MsgId>,
    },
    Return {
        tag: String,
        msg_ids: Vec<MsgId>,
    },
    Discard {
        tag: String,
        msg_ids: Vec<MsgId>,
        reason: String,
    },
    CancelCheckout {
        tag: String,
    },
}

impl Command {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow::anyhow!("serialize queue command: {e}"))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow::anyhow!("deserialize queue command: {e}"))
    }
}

/// Typed rejection for malformed commands.
///
/// The machine stays a total function over its command set: a rejection is an
/// outcome, never a panic, so replicas applying the same log agree on state.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CommandError {
    #[error("unknown consumer {0}")]
    UnknownConsumer(String),
    #[error("consumer tag {0} is already checked out with a different spec")]
    DuplicateConsumer(String),
    #[error("message {msg_id} is not checked out by {tag}")]
    NotCheckedOut { tag: String, msg_id: MsgId },
    #[error("consumer {0} does not use externally granted credit")]
    NotCredited(String),
}

/// One message inside a delivery batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivered {
    pub msg_id: MsgId,
    /// True once the message has been returned to the queue at least once.
    pub redelivered: bool,
    pub message: Message,
}

/// Side effects produced by applying one command.
///
/// Effects are emitted at most a bounded number of times per command:
/// deliveries are batched per consumer, so one state transition yields at
/// most one `Delivery` effect per registered consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Delivery {
        tag: String,
        /// Per-checkout batch counter used by sessions to dedupe and to
        /// detect dropped delivery events.
        counter: u64,
        batch: Vec<Delivered>,
    },
    CreditReply {
        tag: String,
        credit: u32,
        available: u64,
    },
    Drained {
        tag: String,
        /// Credit that could not be used before ready messages ran out.
        credit_dropped: u32,
    },
    DeadLetter {
        reason: String,
        messages: Vec<Message>,
    },
}

/// Read-only, side-effect-free machine queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    ReadyCount,
    CheckedOutCount,
    Consumers,
    /// Fraction of wall-clock time the queue had pending work. Telemetry
    /// only; never used for correctness.
    Usage,
    /// Checked-out entries for one consumer above a delivery counter; used
    /// by sessions to repair delivery-event gaps.
    CheckedOut { tag: String, after_counter: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Count(u64),
    Consumers(Vec<ConsumerInfo>),
    Usage(f64),
    CheckedOut(Vec<CheckedOutEntry>),
}

/// One consumer row from the listing query, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub tag: String,
    pub owner: String,
    pub spec: CheckoutSpec,
    pub credit: u32,
    pub delivery_count: u64,
    pub unsettled: u64,
}

/// One unsettled message with the counter of the batch that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedOutEntry {
    pub counter: u64,
    pub delivered: Delivered,
}

/// Log-provided context for one apply call.
///
/// The timestamp is stamped by the leader when the command is appended, so
/// the machine never reads an ambient clock.
#[derive(Debug, Clone, Copy)]
pub struct ApplyCtx {
    pub index: u64,
    pub now_ms: u64,
}

/// Outcome of applying one command.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub outcome: Result<(), CommandError>,
    pub effects: Vec<Effect>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_wire_encoding() {
        let cmd = Command::Enqueue {
            sender: "session-1".into(),
            sequence: Some(7),
            message: Message::with_correlation(99, "payload"),
        };
        let bytes = cmd.serialize().unwrap();
        match Command::deserialize(&bytes).unwrap() {
            Command::Enqueue {
                sender,
                sequence,
                message,
            } => {
                assert_eq!(sender, "session-1");
                assert_eq!(sequence, Some(7));
                assert_eq!(message.correlation, Some(99));
                assert_eq!(&message.body[..], b"payload");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn command_error_is_displayable() {
        let err = CommandError::NotCheckedOut {
            tag: "c1".into(),
            msg_id: 4,
        };
        assert_eq!(err.to_string(), "message 4 is not checked out by c1");
    }
}
