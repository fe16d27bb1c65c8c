//! The consensus-log boundary and its in-process implementation.
//!
//! - `log` - Contract the queue engine consumes from the replicated log
//! - `local` - Single-process cluster used by tests and embedded deployments

pub mod local;
pub mod log;

pub use local::{FaultInjector, LocalCluster};
pub use log::{CommandLog, EndpointId, SessionEvent, TransportError};
