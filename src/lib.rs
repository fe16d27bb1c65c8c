#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in counter/ratio code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
// Control flow style
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]

//! Quill - replicated FIFO queue engine with credit-based delivery.
//!
//! A deterministic queue state machine replicated over a consensus command
//! log, paired with a client session that pipelines commands against it.
//! The session recovers lost writes and deliveries on its own and surfaces
//! backpressure to producers.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Deterministic time utilities
//!
//! ## Machine
//! - `machine::command` - Replicated command, effect, and query payloads
//! - `machine::state` - The deterministic queue state machine
//! - `machine::dead_letter` - Dead-letter collaborator boundary
//!
//! ## Session
//! - `session::client` - Client session: pipelining, dedup, flow control
//! - `session::pending` - Unconfirmed command tracking
//! - `session::deliveries` - Delivery counter dedup and gap detection
//! - `session::worker` - Owning task per session, supervised restarts
//!
//! ## Replication
//! - `replication::log` - Consensus-log boundary contract
//! - `replication::local` - In-process cluster for tests and embedding
//!
//! ## Operations
//! - `ops::telemetry` - Logging setup and engine counters

// Core infrastructure
pub mod core;

// Machine
pub mod machine;

// Session
pub mod session;

// Replication
pub mod replication;

// Operations
pub mod ops;

// Re-exports for convenience
pub use self::core::{config, time};
pub use machine::{
    CheckoutSpec, Command, CommandError, ConsumerMeta, Delivered, Effect, Message, MsgId,
    QueueMachine, Query, QueryResult,
};
pub use replication::{CommandLog, EndpointId, LocalCluster, SessionEvent};
pub use session::{Action, QueueSession, SessionError, Settlement};
