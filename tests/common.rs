//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use quill::config::SessionConfig;
use quill::replication::{LocalCluster, SessionEvent};
use quill::{Action, MsgId, QueueSession};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn cluster(endpoints: &[&str]) -> Arc<LocalCluster> {
    LocalCluster::start("orders", endpoints)
}

/// Attach a session to the cluster with test-friendly tuning: resend age
/// zero so `resend_stale` fires deterministically when a test calls it.
pub fn session(
    cluster: &Arc<LocalCluster>,
    id: &str,
    endpoints: &[&str],
) -> (QueueSession, UnboundedReceiver<SessionEvent>) {
    let events = cluster.attach_session(id);
    let cfg = SessionConfig {
        endpoints: endpoints.iter().map(|e| (*e).to_string()).collect(),
        resend_after_ms: 0,
        ..SessionConfig::default()
    };
    let session = QueueSession::new(id, cfg, cluster.handle(id))
        .expect("session config")
        .with_counters(cluster.counters());
    (session, events)
}

/// Feed every buffered event through the session, in arrival order.
pub fn drain(
    session: &mut QueueSession,
    events: &mut UnboundedReceiver<SessionEvent>,
) -> Vec<Action> {
    let mut actions = Vec::new();
    while let Ok(event) = events.try_recv() {
        actions.extend(session.handle_event(event).expect("event handling"));
    }
    actions
}

pub fn delivered_ids(actions: &[Action]) -> Vec<MsgId> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Deliver { batch, .. } => {
                Some(batch.iter().map(|d| d.msg_id).collect::<Vec<_>>())
            }
            _ => None,
        })
        .flatten()
        .collect()
}

pub fn delivered_bodies(actions: &[Action]) -> Vec<Vec<u8>> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Deliver { batch, .. } => Some(
                batch
                    .iter()
                    .map(|d| d.message.body.to_vec())
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        })
        .flatten()
        .collect()
}
