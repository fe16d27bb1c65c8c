//! The replicated queue state machine.
//!
//! - `command` - Command, effect, and query payloads
//! - `state` - The deterministic apply loop and delivery scan
//! - `dead_letter` - Dead-letter collaborator boundary

pub mod command;
pub mod dead_letter;
pub mod state;

pub use command::{
    ApplyCtx, ApplyResult, CheckedOutEntry, CheckoutSpec, Command, CommandError, ConsumerInfo,
    ConsumerMeta, Delivered, Effect, Message, MsgId, Query, QueryResult,
};
pub use dead_letter::{CollectingDeadLetter, DeadLetterHandler, LogDeadLetter};
pub use state::QueueMachine;
