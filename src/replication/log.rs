//! Consensus-log boundary.
//!
//! The queue engine treats the replicated log as an external collaborator:
//! a durable, linearizable command log with pipelining, leader discovery,
//! and asynchronous event delivery. Only the contract lives here; the
//! in-process implementation used by tests and embedded deployments is in
//! [`crate::replication::local`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::machine::command::{Command, CommandError, Delivered, Query, QueryResult};

/// Opaque identity of one log endpoint (one replica's ingress).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Asynchronous notifications pushed to one session, in log emission order.
///
/// A session must process these strictly in arrival order through a single
/// owning task; out-of-order processing breaks delivery dedup.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Correlations whose commands were applied by the leader.
    Applied(Vec<u64>),
    /// A command was applied but rejected by the machine; surfaced verbatim.
    Rejected {
        correlation: u64,
        error: CommandError,
    },
    /// One delivery batch for a consumer this session owns.
    Delivery {
        tag: String,
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
        credit_dropped: u32,
    },
    /// The targeted endpoint is not (or no longer) the leader.
    NotLeader { leader_hint: Option<EndpointId> },
    /// The queue was deleted. Terminal: the session must be discarded.
    Eol,
}

/// Failures crossing the log boundary that are not silent transport loss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(String),
    #[error("endpoint {0} is not running")]
    EndpointDown(String),
    #[error("queue has been deleted")]
    QueueDeleted,
}

/// One session's handle onto the replicated command log.
///
/// `pipeline_command` is best-effort: the log may silently drop a command
/// under overload, and the submitter recovers by resending the identical
/// sequence later. Results and machine effects come back asynchronously on
/// the session's event stream, never as return values.
pub trait CommandLog: Send + Sync {
    fn pipeline_command(&self, endpoint: &EndpointId, correlation: u64, command: Command);

    /// Read-only query against one endpoint's locally applied state.
    fn local_query(
        &self,
        endpoint: &EndpointId,
        query: Query,
    ) -> Result<(u64, QueryResult), TransportError>;
}
