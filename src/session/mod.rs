//! Client-side session against one replicated queue.
//!
//! - `client` - The session state machine: submission, events, flow control
//! - `pending` - Unconfirmed command tracking and resend bookkeeping
//! - `deliveries` - Delivery counter dedup and gap detection
//! - `worker` - Owning task per session and restart supervision

pub mod client;
pub mod deliveries;
pub mod pending;
pub mod worker;

pub use client::{
    Action, Dequeued, DequeueOutcome, QueueSession, SessionError, Settlement,
};
pub use deliveries::{DeliveryCheck, DeliveryTracker};
pub use pending::{PendingCommand, PendingTable};
pub use worker::{
    spawn_session, supervise, RestartIntensity, RestartPolicy, SessionRun, SupervisorExit,
    WorkerExit,
};
