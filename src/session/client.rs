//! Client session against one replicated queue.
//!
//! A [`QueueSession`] is the single logical owner of a queue interaction.
//! Commands are pipelined without waiting for confirmation and tracked until
//! the log reports them applied; the asynchronous delivery stream is deduped
//! and repaired before anything reaches the caller. The session is
//! deliberately not safe for concurrent mutation: exactly one task drives
//! it, and every asynchronous notification funnels through
//! [`QueueSession::handle_event`] in arrival order.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::config::SessionConfig;
use crate::machine::command::{
    CheckoutSpec, Command, CommandError, ConsumerMeta, Delivered, Message, MsgId, Query,
    QueryResult,
};
use crate::ops::telemetry::EngineCounters;
use crate::replication::log::{CommandLog, EndpointId, SessionEvent};
use crate::session::deliveries::{DeliveryCheck, DeliveryTracker};
use crate::session::pending::PendingTable;

/// What a session surfaces to its caller after an operation or event.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// One deduplicated delivery batch, in order.
    Deliver { tag: String, batch: Vec<Delivered> },
    /// Enqueue confirmations, by the caller's correlation tokens.
    Confirmed { correlations: Vec<u64> },
    /// A command the machine rejected; surfaced verbatim, never retried.
    Rejected {
        correlation: u64,
        error: CommandError,
    },
    /// Stop producing until `Unblock`.
    Block,
    Unblock,
    CreditReply {
        tag: String,
        credit: u32,
        available: u64,
    },
    Drained {
        tag: String,
        credit_dropped: u32,
    },
    /// The queue is gone. The session must be discarded.
    Eol,
}

/// Session-local failures. Transport loss and leader changes are not here;
/// those are recovered internally and never surface as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session has reached end of life")]
    Ended,
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("dequeue timed out")]
    DequeueTimeout,
    #[error("session event stream detached")]
    Detached,
}

/// Whether `dequeue` settles the message before returning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Settled,
    Unsettled,
}

/// Result of a `dequeue` composite.
#[derive(Debug, Clone, PartialEq)]
pub struct Dequeued {
    pub outcome: DequeueOutcome,
    /// The ephemeral consumer tag. Still registered after an unsettled
    /// dequeue so the caller can settle, return, or discard with it;
    /// already cancelled otherwise.
    pub tag: String,
    /// Actions for other consumers that arrived while waiting.
    pub side_actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DequeueOutcome {
    Delivered(Delivered),
    Empty,
}

/// Stateful handle for one producer/consumer against one queue.
pub struct QueueSession {
    session_id: String,
    cfg: SessionConfig,
    log: Arc<dyn CommandLog>,
    endpoints: Vec<EndpointId>,
    target: usize,
    next_seq: u64,
    next_enqueue_seq: u64,
    pending: PendingTable,
    deliveries: DeliveryTracker,
    counters: Arc<EngineCounters>,
    blocked: bool,
    ended: bool,
}

impl QueueSession {
    pub fn new(
        session_id: impl Into<String>,
        cfg: SessionConfig,
        log: Arc<dyn CommandLog>,
    ) -> Result<Self, SessionError> {
        let endpoints: Vec<EndpointId> = cfg
            .endpoints
            .iter()
            .map(|e| EndpointId::from(e.as_str()))
            .collect();
        if endpoints.is_empty() {
            return Err(SessionError::NoEndpoints);
        }
        Ok(Self {
            session_id: session_id.into(),
            cfg,
            log,
            endpoints,
            target: 0,
            next_seq: 1,
            next_enqueue_seq: 1,
            pending: PendingTable::new(),
            deliveries: DeliveryTracker::new(),
            counters: Arc::new(EngineCounters::new()),
            blocked: false,
            ended: false,
        })
    }

    pub fn with_counters(mut self, counters: Arc<EngineCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target_endpoint(&self) -> &EndpointId {
        &self.endpoints[self.target]
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    // -----------------------------------------------------------------------
    // Command submitters
    // -----------------------------------------------------------------------

    /// Enqueue one message. Non-blocking: the message is pipelined and the
    /// call returns before confirmation. A `Block` action means the caller
    /// must stop producing until a later event yields `Unblock`.
    pub fn enqueue(
        &mut self,
        correlation: Option<u64>,
        body: impl Into<Bytes>,
    ) -> Result<Vec<Action>, SessionError> {
        self.ensure_active()?;
        let sequence = self.next_enqueue_seq;
        self.next_enqueue_seq += 1;
        let message = Message {
            correlation,
            body: body.into(),
        };
        self.submit(Command::Enqueue {
            sender: self.session_id.clone(),
            sequence: Some(sequence),
            message,
        });
        Ok(self.flow_actions())
    }

    /// Fire-and-forget injection: no sequence tracking, no confirmation, no
    /// delivery guarantee beyond the log's own at-least-once semantics.
    pub fn untracked_enqueue(&mut self, body: impl Into<Bytes>) -> Result<(), SessionError> {
        self.ensure_active()?;
        let correlation = self.next_seq;
        self.next_seq += 1;
        let command = Command::Enqueue {
            sender: self.session_id.clone(),
            sequence: None,
            message: Message::new(body),
        };
        self.log
            .pipeline_command(self.target_endpoint(), correlation, command);
        Ok(())
    }

    /// Register a consumer. Deliveries arrive later through `handle_event`.
    pub fn checkout(
        &mut self,
        tag: impl Into<String>,
        spec: CheckoutSpec,
        meta: ConsumerMeta,
    ) -> Result<Vec<Action>, SessionError> {
        self.ensure_active()?;
        self.submit(Command::Checkout {
            tag: tag.into(),
            spec,
            meta,
        });
        Ok(self.flow_actions())
    }

    /// Checkout with the configured initial prefetch.
    pub fn checkout_prefetch(&mut self, tag: impl Into<String>) -> Result<Vec<Action>, SessionError> {
        let count = self.cfg.initial_prefetch;
        self.checkout(
            tag,
            CheckoutSpec::Prefetch { count },
            ConsumerMeta {
                owner: self.session_id.clone(),
            },
        )
    }

    pub fn credit(
        &mut self,
        tag: &str,
        amount: u32,
        drain: bool,
    ) -> Result<Vec<Action>, SessionError> {
        self.ensure_active()?;
        self.submit(Command::Credit {
            tag: tag.to_string(),
            amount,
            drain,
        });
        Ok(self.flow_actions())
    }

    pub fn settle(&mut self, tag: &str, msg_ids: Vec<MsgId>) -> Result<Vec<Action>, SessionError> {
        self.ensure_active()?;
        self.submit(Command::Settle {
            tag: tag.to_string(),
            msg_ids,
        });
        Ok(self.flow_actions())
    }

    /// Release messages back to ready; they become eligible for redelivery
    /// to any consumer, including this one.
    pub fn return_messages(
        &mut self,
        tag: &str,
        msg_ids: Vec<MsgId>,
    ) -> Result<Vec<Action>, SessionError> {
        self.ensure_active()?;
        self.submit(Command::Return {
            tag: tag.to_string(),
            msg_ids,
        });
        Ok(self.flow_actions())
    }

    pub fn discard(
        &mut self,
        tag: &str,
        msg_ids: Vec<MsgId>,
        reason: impl Into<String>,
    ) -> Result<Vec<Action>, SessionError> {
        self.ensure_active()?;
        self.submit(Command::Discard {
            tag: tag.to_string(),
            msg_ids,
            reason: reason.into(),
        });
        Ok(self.flow_actions())
    }

    pub fn cancel_checkout(&mut self, tag: &str) -> Result<Vec<Action>, SessionError> {
        self.ensure_active()?;
        self.submit(Command::CancelCheckout {
            tag: tag.to_string(),
        });
        self.deliveries.forget(tag);
        Ok(self.flow_actions())
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    /// The sole entry point for asynchronous notifications. Must be invoked
    /// once per event, strictly in arrival order.
    pub fn handle_event(&mut self, event: SessionEvent) -> Result<Vec<Action>, SessionError> {
        if self.ended {
            return Err(SessionError::Ended);
        }
        let mut actions = Vec::new();
        match event {
            SessionEvent::Applied(sequences) => {
                let mut correlations = Vec::new();
                for seq in sequences {
                    let Some(entry) = self.pending.confirm(seq) else {
                        continue;
                    };
                    if let Command::Enqueue { message, .. } = entry.command {
                        if let Some(correlation) = message.correlation {
                            correlations.push(correlation);
                        }
                    }
                }
                if !correlations.is_empty() {
                    actions.push(Action::Confirmed { correlations });
                }
                if self.blocked && self.pending.len() < self.cfg.soft_limit {
                    self.blocked = false;
                    actions.push(Action::Unblock);
                }
            }
            SessionEvent::Rejected { correlation, error } => {
                self.pending.confirm(correlation);
                actions.push(Action::Rejected { correlation, error });
            }
            SessionEvent::Delivery {
                tag,
                counter,
                batch,
            } => {
                self.on_delivery(tag, counter, batch, &mut actions);
            }
            SessionEvent::CreditReply {
                tag,
                credit,
                available,
            } => {
                actions.push(Action::CreditReply {
                    tag,
                    credit,
                    available,
                });
            }
            SessionEvent::Drained {
                tag,
                credit_dropped,
            } => {
                actions.push(Action::Drained {
                    tag,
                    credit_dropped,
                });
            }
            SessionEvent::NotLeader { leader_hint } => {
                self.retarget(leader_hint);
            }
            SessionEvent::Eol => {
                self.ended = true;
                actions.push(Action::Eol);
            }
        }
        Ok(actions)
    }

    fn on_delivery(
        &mut self,
        tag: String,
        counter: u64,
        batch: Vec<Delivered>,
        actions: &mut Vec<Action>,
    ) {
        match self.deliveries.observe(&tag, counter) {
            DeliveryCheck::Duplicate => {
                tracing::debug!(%tag, counter, "dropped duplicate delivery batch");
            }
            DeliveryCheck::Accept => {
                self.deliveries.advance(&tag, counter);
                actions.push(Action::Deliver { tag, batch });
            }
            DeliveryCheck::Gap { expected } => {
                // A delivery event was lost in transport. Ask the leader for
                // everything still checked out above our last counter rather
                // than silently skipping messages.
                let after = self.deliveries.last_seen(&tag);
                let repair = self.log.local_query(
                    self.target_endpoint(),
                    Query::CheckedOut {
                        tag: tag.clone(),
                        after_counter: after,
                    },
                );
                match repair {
                    Ok((_, QueryResult::CheckedOut(entries))) if !entries.is_empty() => {
                        self.counters.inc_gap_repairs();
                        tracing::info!(%tag, expected, counter, "repaired delivery gap");
                        let top = entries
                            .iter()
                            .map(|e| e.counter)
                            .max()
                            .unwrap_or(counter)
                            .max(counter);
                        let batch: Vec<Delivered> =
                            entries.into_iter().map(|e| e.delivered).collect();
                        self.deliveries.advance(&tag, top);
                        actions.push(Action::Deliver { tag, batch });
                    }
                    _ => {
                        tracing::warn!(
                            %tag,
                            expected,
                            counter,
                            "gap repair query failed; surfacing batch as-is"
                        );
                        self.deliveries.advance(&tag, counter);
                        actions.push(Action::Deliver { tag, batch });
                    }
                }
            }
        }
    }

    fn retarget(&mut self, hint: Option<EndpointId>) {
        let next = hint
            .as_ref()
            .and_then(|h| self.endpoints.iter().position(|e| e == h))
            .unwrap_or((self.target + 1) % self.endpoints.len());
        self.target = next;
        tracing::info!(
            endpoint = %self.endpoints[self.target],
            pending = self.pending.len(),
            "re-targeting submissions after leader change"
        );
        self.resubmit_pending();
    }

    /// Resubmit everything unconfirmed, in sequence order, with identical
    /// payloads. The machine treats already-applied sequences as no-ops.
    fn resubmit_pending(&mut self) {
        let now = Instant::now();
        let resubmit: Vec<(u64, Command)> = self
            .pending
            .iter_ordered()
            .map(|(seq, cmd)| (seq, cmd.clone()))
            .collect();
        if resubmit.is_empty() {
            return;
        }
        self.counters.inc_resends(resubmit.len() as u64);
        for (seq, command) in resubmit {
            self.log
                .pipeline_command(&self.endpoints[self.target], seq, command);
            self.pending.touch(seq, now);
        }
    }

    /// Resubmit commands that have gone unconfirmed for longer than the
    /// configured resend age. The owning task calls this on an interval;
    /// this is the lost-command detection trigger.
    pub fn resend_stale(&mut self) {
        if self.ended {
            return;
        }
        let now = Instant::now();
        let stale = self.pending.stale(now, self.cfg.resend_after());
        if stale.is_empty() {
            return;
        }
        self.counters.inc_resends(stale.len() as u64);
        tracing::debug!(count = stale.len(), "resending unconfirmed commands");
        for seq in stale {
            let Some(command) = self.pending.get(seq).map(|p| p.command.clone()) else {
                continue;
            };
            self.log
                .pipeline_command(&self.endpoints[self.target], seq, command);
            self.pending.touch(seq, now);
        }
    }

    // -----------------------------------------------------------------------
    // Dequeue composite
    // -----------------------------------------------------------------------

    /// Take exactly one message, or report the queue empty.
    ///
    /// Issues an ephemeral credited checkout with a drain grant of one, then
    /// waits on the event stream for either a delivery or the drained reply.
    /// Bounded by the configured dequeue timeout and cancellable like any
    /// future. Intended for sessions that are not concurrently consuming;
    /// actions for other consumers that arrive while waiting come back in
    /// `side_actions`.
    pub async fn dequeue(
        &mut self,
        events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
        settlement: Settlement,
    ) -> Result<Dequeued, SessionError> {
        self.ensure_active()?;
        let tag = format!("dq-{}", Uuid::new_v4());
        let mut side_actions = Vec::new();
        side_actions.extend(self.checkout(
            tag.clone(),
            CheckoutSpec::Credited,
            ConsumerMeta {
                owner: self.session_id.clone(),
            },
        )?);
        side_actions.extend(self.credit(&tag, 1, true)?);

        let timeout = self.cfg.dequeue_timeout();
        let wait = async {
            loop {
                let Some(event) = events.recv().await else {
                    return Err(SessionError::Detached);
                };
                for action in self.handle_event(event)? {
                    match action {
                        Action::Deliver { tag: t, batch } if t == tag => {
                            let Some(first) = batch.into_iter().next() else {
                                continue;
                            };
                            if settlement == Settlement::Settled {
                                side_actions.extend(self.settle(&tag, vec![first.msg_id])?);
                            }
                            return Ok(DequeueOutcome::Delivered(first));
                        }
                        Action::Drained { tag: t, .. } if t == tag => {
                            return Ok(DequeueOutcome::Empty);
                        }
                        Action::Eol => return Err(SessionError::Ended),
                        other => side_actions.push(other),
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(outcome)) => {
                // An unsettled delivery keeps the checkout open so the caller
                // can settle with the returned tag; everything else cleans up.
                let keep_open = settlement == Settlement::Unsettled
                    && matches!(outcome, DequeueOutcome::Delivered(_));
                if !keep_open {
                    self.cancel_checkout(&tag)?;
                }
                Ok(Dequeued {
                    outcome,
                    tag,
                    side_actions,
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => {
                // Clean up the ephemeral checkout; its messages, if any ever
                // arrive, go back to ready on the machine side.
                let _ = self.cancel_checkout(&tag);
                Err(SessionError::DequeueTimeout)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.ended {
            return Err(SessionError::Ended);
        }
        Ok(())
    }

    fn submit(&mut self, command: Command) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq, command.clone(), Instant::now());
        self.log
            .pipeline_command(&self.endpoints[self.target], seq, command);
    }

    /// Edge-triggered backpressure: one `Block` when the pending table
    /// crosses the soft limit, one `Unblock` when confirmations drain it
    /// back below.
    fn flow_actions(&mut self) -> Vec<Action> {
        if !self.blocked && self.pending.len() > self.cfg.soft_limit {
            self.blocked = true;
            vec![Action::Block]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::command::CheckedOutEntry;
    use crate::replication::log::TransportError;
    use parking_lot::Mutex;

    /// Log stub that records submissions and answers queries from a script.
    #[derive(Default)]
    struct RecordingLog {
        sent: Mutex<Vec<(EndpointId, u64, Command)>>,
        checked_out: Mutex<Vec<CheckedOutEntry>>,
        fail_queries: Mutex<bool>,
    }

    impl RecordingLog {
        fn sent(&self) -> Vec<(EndpointId, u64, Command)> {
            self.sent.lock().clone()
        }
    }

    impl CommandLog for RecordingLog {
        fn pipeline_command(&self, endpoint: &EndpointId, correlation: u64, command: Command) {
            self.sent
                .lock()
                .push((endpoint.clone(), correlation, command));
        }

        fn local_query(
            &self,
            endpoint: &EndpointId,
            _query: Query,
        ) -> Result<(u64, QueryResult), TransportError> {
            if *self.fail_queries.lock() {
                return Err(TransportError::EndpointDown(endpoint.to_string()));
            }
            Ok((0, QueryResult::CheckedOut(self.checked_out.lock().clone())))
        }
    }

    fn config(soft_limit: usize) -> SessionConfig {
        SessionConfig {
            endpoints: vec!["a".into(), "b".into()],
            soft_limit,
            ..SessionConfig::default()
        }
    }

    fn session(log: &Arc<RecordingLog>, soft_limit: usize) -> QueueSession {
        QueueSession::new(
            "s1",
            config(soft_limit),
            Arc::clone(log) as Arc<dyn CommandLog>,
        )
        .unwrap()
    }

    fn delivered(msg_id: MsgId) -> Delivered {
        Delivered {
            msg_id,
            redelivered: false,
            message: Message::new(format!("m{msg_id}")),
        }
    }

    #[test]
    fn rejects_empty_endpoint_list() {
        let log: Arc<RecordingLog> = Arc::default();
        let err = QueueSession::new(
            "s1",
            SessionConfig::default(),
            Arc::clone(&log) as Arc<dyn CommandLog>,
        )
        .err();
        assert_eq!(err, Some(SessionError::NoEndpoints));
    }

    #[test]
    fn enqueue_blocks_at_soft_limit_and_unblocks_on_drain() {
        let log: Arc<RecordingLog> = Arc::default();
        let mut session = session(&log, 2);
        assert!(session.enqueue(None, "m1").unwrap().is_empty());
        assert!(session.enqueue(None, "m2").unwrap().is_empty());
        let actions = session.enqueue(None, "m3").unwrap();
        assert_eq!(actions, vec![Action::Block]);
        assert!(session.is_blocked());
        // Block is edge-triggered.
        assert!(session.enqueue(None, "m4").unwrap().is_empty());

        let actions = session
            .handle_event(SessionEvent::Applied(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(actions, vec![Action::Unblock]);
        assert!(!session.is_blocked());
    }

    #[test]
    fn applied_surfaces_caller_correlations() {
        let log: Arc<RecordingLog> = Arc::default();
        let mut session = session(&log, 8);
        session.enqueue(Some(700), "m1").unwrap();
        session.enqueue(None, "m2").unwrap();
        let actions = session
            .handle_event(SessionEvent::Applied(vec![1, 2]))
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::Confirmed {
                correlations: vec![700]
            }]
        );
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn duplicate_delivery_replay_surfaces_nothing() {
        let log: Arc<RecordingLog> = Arc::default();
        let mut session = session(&log, 8);
        let event = SessionEvent::Delivery {
            tag: "c1".into(),
            counter: 1,
            batch: vec![delivered(1)],
        };
        let first = session.handle_event(event.clone()).unwrap();
        assert_eq!(first.len(), 1);
        let second = session.handle_event(event).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn delivery_gap_is_repaired_from_leader_state() {
        let log: Arc<RecordingLog> = Arc::default();
        *log.checked_out.lock() = vec![
            CheckedOutEntry {
                counter: 1,
                delivered: delivered(1),
            },
            CheckedOutEntry {
                counter: 2,
                delivered: delivered(2),
            },
        ];
        let mut session = session(&log, 8);
        // Counter 2 arrives first: counter 1 was lost in transport.
        let actions = session
            .handle_event(SessionEvent::Delivery {
                tag: "c1".into(),
                counter: 2,
                batch: vec![delivered(2)],
            })
            .unwrap();
        match &actions[0] {
            Action::Deliver { batch, .. } => {
                let ids: Vec<MsgId> = batch.iter().map(|d| d.msg_id).collect();
                assert_eq!(ids, vec![1, 2]);
            }
            other => panic!("unexpected action: {other:?}"),
        }
        // The repaired range is now known; a late replay of counter 1 is a
        // duplicate.
        let late = session
            .handle_event(SessionEvent::Delivery {
                tag: "c1".into(),
                counter: 1,
                batch: vec![delivered(1)],
            })
            .unwrap();
        assert!(late.is_empty());
    }

    #[test]
    fn failed_gap_repair_still_surfaces_the_batch() {
        let log: Arc<RecordingLog> = Arc::default();
        *log.fail_queries.lock() = true;
        let mut session = session(&log, 8);
        let actions = session
            .handle_event(SessionEvent::Delivery {
                tag: "c1".into(),
                counter: 3,
                batch: vec![delivered(5)],
            })
            .unwrap();
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn not_leader_retargets_and_resubmits_pending() {
        let log: Arc<RecordingLog> = Arc::default();
        let mut session = session(&log, 8);
        session.enqueue(None, "m1").unwrap();
        session.enqueue(None, "m2").unwrap();
        let actions = session
            .handle_event(SessionEvent::NotLeader {
                leader_hint: Some(EndpointId::from("b")),
            })
            .unwrap();
        // Transient; nothing surfaces to the caller.
        assert!(actions.is_empty());
        assert_eq!(session.target_endpoint(), &EndpointId::from("b"));

        let sent = log.sent();
        // Two original submissions at "a" plus two resubmissions at "b",
        // same correlations, same payloads.
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2].0, EndpointId::from("b"));
        assert_eq!(sent[2].1, sent[0].1);
        assert_eq!(sent[3].1, sent[1].1);
    }

    #[test]
    fn not_leader_without_hint_advances_round_robin() {
        let log: Arc<RecordingLog> = Arc::default();
        let mut session = session(&log, 8);
        session
            .handle_event(SessionEvent::NotLeader { leader_hint: None })
            .unwrap();
        assert_eq!(session.target_endpoint(), &EndpointId::from("b"));
        session
            .handle_event(SessionEvent::NotLeader { leader_hint: None })
            .unwrap();
        assert_eq!(session.target_endpoint(), &EndpointId::from("a"));
    }

    #[test]
    fn resend_stale_resubmits_identical_payloads() {
        let log: Arc<RecordingLog> = Arc::default();
        let cfg = SessionConfig {
            endpoints: vec!["a".into()],
            resend_after_ms: 0,
            ..SessionConfig::default()
        };
        let mut session =
            QueueSession::new("s1", cfg, Arc::clone(&log) as Arc<dyn CommandLog>).unwrap();
        session.enqueue(Some(9), "m1").unwrap();
        session.resend_stale();
        let sent = log.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, sent[1].1);
        match (&sent[0].2, &sent[1].2) {
            (
                Command::Enqueue {
                    sequence: Some(a), ..
                },
                Command::Enqueue {
                    sequence: Some(b), ..
                },
            ) => assert_eq!(a, b),
            other => panic!("unexpected commands: {other:?}"),
        }
    }

    #[test]
    fn rejection_surfaces_verbatim_and_resolves_pending() {
        let log: Arc<RecordingLog> = Arc::default();
        let mut session = session(&log, 8);
        session.settle("ghost", vec![1]).unwrap();
        let actions = session
            .handle_event(SessionEvent::Rejected {
                correlation: 1,
                error: CommandError::UnknownConsumer("ghost".into()),
            })
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::Rejected {
                correlation: 1,
                error: CommandError::UnknownConsumer("ghost".into()),
            }]
        );
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn eol_is_terminal() {
        let log: Arc<RecordingLog> = Arc::default();
        let mut session = session(&log, 8);
        let actions = session.handle_event(SessionEvent::Eol).unwrap();
        assert_eq!(actions, vec![Action::Eol]);
        assert_eq!(session.enqueue(None, "m"), Err(SessionError::Ended));
        assert_eq!(
            session.handle_event(SessionEvent::Applied(vec![1])),
            Err(SessionError::Ended)
        );
    }

    #[test]
    fn untracked_enqueue_is_not_tracked() {
        let log: Arc<RecordingLog> = Arc::default();
        let mut session = session(&log, 8);
        session.untracked_enqueue("m").unwrap();
        assert_eq!(session.pending_count(), 0);
        let sent = log.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].2,
            Command::Enqueue { sequence: None, .. }
        ));
    }
}
