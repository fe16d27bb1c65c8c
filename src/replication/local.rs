//! In-process command log for tests and embedded deployments.
//!
//! One [`LocalCluster`] simulates a replicated log as seen from the queue
//! engine's side of the boundary: a set of named endpoints, exactly one of
//! which is the active leader applying commands to the queue machine, with
//! per-session asynchronous event delivery. It supports stopping and
//! restarting endpoints to exercise leader failover, and fault injection to
//! exercise the session's loss-recovery paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::time::{Clock, SystemClock};
use crate::machine::command::{ApplyCtx, Command, Effect, Message, Query, QueryResult};
use crate::machine::dead_letter::{DeadLetterHandler, LogDeadLetter};
use crate::machine::state::QueueMachine;
use crate::ops::telemetry::EngineCounters;
use crate::replication::log::{CommandLog, EndpointId, SessionEvent, TransportError};

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FaultState {
    drop_commands: AtomicU32,
    drop_deliveries: AtomicU32,
}

/// Switches emulating transport loss at the log boundary.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    state: Arc<FaultState>,
}

impl FaultInjector {
    /// Silently drop the next `n` pipelined commands.
    pub fn drop_next_commands(&self, n: u32) {
        self.state.drop_commands.store(n, Ordering::Relaxed);
    }

    /// Silently drop the next `n` delivery events.
    pub fn drop_next_deliveries(&self, n: u32) {
        self.state.drop_deliveries.store(n, Ordering::Relaxed);
    }

    fn take_command_drop(&self) -> bool {
        take_one(&self.state.drop_commands)
    }

    fn take_delivery_drop(&self) -> bool {
        take_one(&self.state.drop_deliveries)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

struct ClusterInner {
    machine: QueueMachine,
    endpoints: Vec<EndpointId>,
    up: HashMap<EndpointId, bool>,
    /// Index into `endpoints`; `None` while the cluster is leaderless.
    leader: Option<usize>,
    log_index: u64,
    sessions: HashMap<String, mpsc::UnboundedSender<SessionEvent>>,
    /// Which session owns each consumer tag, for effect routing.
    consumer_owner: HashMap<String, String>,
    deleted: bool,
}

impl ClusterInner {
    fn leader_endpoint(&self) -> Option<&EndpointId> {
        self.leader.and_then(|idx| self.endpoints.get(idx))
    }
}

/// Single-process stand-in for the replicated command log.
pub struct LocalCluster<C: Clock = SystemClock> {
    clock: C,
    epoch: Instant,
    faults: FaultInjector,
    dead_letter: Arc<dyn DeadLetterHandler>,
    counters: Arc<EngineCounters>,
    inner: Mutex<ClusterInner>,
}

impl LocalCluster<SystemClock> {
    /// Start a cluster with a system clock and log-and-drop dead-lettering.
    pub fn start(queue_name: &str, endpoints: &[&str]) -> Arc<Self> {
        Self::start_with(
            SystemClock,
            queue_name,
            endpoints,
            Arc::new(LogDeadLetter),
        )
    }
}

impl<C: Clock> LocalCluster<C> {
    pub fn start_with(
        clock: C,
        queue_name: &str,
        endpoints: &[&str],
        dead_letter: Arc<dyn DeadLetterHandler>,
    ) -> Arc<Self> {
        let endpoint_ids: Vec<EndpointId> = endpoints.iter().map(|e| EndpointId::from(*e)).collect();
        let up = endpoint_ids.iter().map(|e| (e.clone(), true)).collect();
        let epoch = clock.now();
        Arc::new(Self {
            clock,
            epoch,
            faults: FaultInjector::default(),
            dead_letter,
            counters: Arc::new(EngineCounters::new()),
            inner: Mutex::new(ClusterInner {
                machine: QueueMachine::new(queue_name),
                endpoints: endpoint_ids,
                up,
                leader: Some(0),
                log_index: 0,
                sessions: HashMap::new(),
                consumer_owner: HashMap::new(),
                deleted: false,
            }),
        })
    }

    /// Endpoints this cluster answered startup with, in candidate order.
    pub fn started_endpoints(&self) -> Vec<EndpointId> {
        self.inner.lock().endpoints.clone()
    }

    pub fn leader(&self) -> Option<EndpointId> {
        self.inner.lock().leader_endpoint().cloned()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn counters(&self) -> Arc<EngineCounters> {
        Arc::clone(&self.counters)
    }

    /// Register a session and hand back its ordered event stream.
    pub fn attach_session(&self, session_id: &str) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().sessions.insert(session_id.to_string(), tx);
        rx
    }

    /// A [`CommandLog`] handle bound to one attached session.
    pub fn handle(self: &Arc<Self>, session_id: &str) -> Arc<dyn CommandLog> {
        Arc::new(SessionHandle {
            cluster: Arc::clone(self),
            session_id: session_id.to_string(),
        })
    }

    /// Take an endpoint down. Commands pipelined at it are lost, as with a
    /// crashed replica. Stopping the leader elects the next live endpoint
    /// and notifies every attached session.
    pub fn stop(&self, endpoint: &EndpointId) {
        let mut inner = self.inner.lock();
        if let Some(up) = inner.up.get_mut(endpoint) {
            *up = false;
        }
        if inner.leader_endpoint() == Some(endpoint) {
            self.elect(&mut inner);
        }
    }

    /// Bring an endpoint back. If the cluster was leaderless it becomes the
    /// leader and sessions are notified so they resubmit pending commands.
    pub fn restart(&self, endpoint: &EndpointId) {
        let mut inner = self.inner.lock();
        if let Some(up) = inner.up.get_mut(endpoint) {
            *up = true;
        }
        if inner.leader.is_none() {
            self.elect(&mut inner);
        }
    }

    /// Delete the queue: terminal for every attached session.
    pub fn delete_queue(&self) {
        let mut inner = self.inner.lock();
        inner.deleted = true;
        for tx in inner.sessions.values() {
            let _ = tx.send(SessionEvent::Eol);
        }
    }

    fn elect(&self, inner: &mut ClusterInner) {
        let next = inner
            .endpoints
            .iter()
            .position(|e| inner.up.get(e).copied().unwrap_or(false));
        inner.leader = next;
        if let Some(idx) = next {
            let hint = inner.endpoints[idx].clone();
            tracing::info!(leader = %hint, "local cluster elected a new leader");
            self.counters.inc_leader_changes();
            for tx in inner.sessions.values() {
                let _ = tx.send(SessionEvent::NotLeader {
                    leader_hint: Some(hint.clone()),
                });
            }
        } else {
            tracing::warn!("local cluster is leaderless");
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().duration_since(self.epoch).as_millis() as u64
    }

    fn pipeline(&self, endpoint: &EndpointId, origin: &str, correlation: u64, command: Command) {
        let mut dead_letters: Vec<(String, Vec<Message>)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.deleted {
                return;
            }
            if !inner.up.get(endpoint).copied().unwrap_or(false) {
                // Crashed or unknown replica: the command is simply lost.
                tracing::trace!(%endpoint, correlation, "command dropped at dead endpoint");
                return;
            }
            let leader = inner.leader_endpoint().cloned();
            if leader.as_ref() != Some(endpoint) {
                if let Some(tx) = inner.sessions.get(origin) {
                    let _ = tx.send(SessionEvent::NotLeader {
                        leader_hint: leader,
                    });
                }
                return;
            }
            if self.faults.take_command_drop() {
                tracing::debug!(correlation, "fault injection dropped a pipelined command");
                return;
            }

            inner.log_index += 1;
            let ctx = ApplyCtx {
                index: inner.log_index,
                now_ms: self.now_ms(),
            };
            let new_checkout = match &command {
                Command::Checkout { tag, .. } => Some(tag.clone()),
                _ => None,
            };
            let cancelled = match &command {
                Command::CancelCheckout { tag } => Some(tag.clone()),
                _ => None,
            };
            let is_enqueue = matches!(command, Command::Enqueue { .. });
            let settled = match &command {
                Command::Settle { msg_ids, .. } => msg_ids.len() as u64,
                _ => 0,
            };

            let result = inner.machine.apply(&ctx, command);
            match result.outcome {
                Ok(()) => {
                    if let Some(tag) = new_checkout {
                        inner.consumer_owner.insert(tag, origin.to_string());
                    }
                    if is_enqueue {
                        self.counters.inc_enqueued();
                    }
                    if settled > 0 {
                        self.counters.add_settled(settled);
                    }
                    if let Some(tx) = inner.sessions.get(origin) {
                        let _ = tx.send(SessionEvent::Applied(vec![correlation]));
                    }
                }
                Err(error) => {
                    if let Some(tx) = inner.sessions.get(origin) {
                        let _ = tx.send(SessionEvent::Rejected { correlation, error });
                    }
                }
            }

            for effect in result.effects {
                match effect {
                    Effect::Delivery {
                        tag,
                        counter,
                        batch,
                    } => {
                        if self.faults.take_delivery_drop() {
                            tracing::debug!(%tag, counter, "fault injection dropped a delivery");
                            continue;
                        }
                        self.counters.add_delivered(batch.len() as u64);
                        if let Some(tx) = owner_channel(&inner, &tag) {
                            let _ = tx.send(SessionEvent::Delivery {
                                tag,
                                counter,
                                batch,
                            });
                        }
                    }
                    Effect::CreditReply {
                        tag,
                        credit,
                        available,
                    } => {
                        if let Some(tx) = owner_channel(&inner, &tag) {
                            let _ = tx.send(SessionEvent::CreditReply {
                                tag,
                                credit,
                                available,
                            });
                        }
                    }
                    Effect::Drained {
                        tag,
                        credit_dropped,
                    } => {
                        if let Some(tx) = owner_channel(&inner, &tag) {
                            let _ = tx.send(SessionEvent::Drained {
                                tag,
                                credit_dropped,
                            });
                        }
                    }
                    Effect::DeadLetter { reason, messages } => {
                        self.counters.add_dead_lettered(messages.len() as u64);
                        dead_letters.push((reason, messages));
                    }
                }
            }

            if let Some(tag) = cancelled {
                inner.consumer_owner.remove(&tag);
            }
        }
        // Handler runs outside the cluster lock; it is an external collaborator.
        for (reason, messages) in dead_letters {
            self.dead_letter.handle(&reason, messages);
        }
    }

    fn query(
        &self,
        endpoint: &EndpointId,
        query: Query,
    ) -> Result<(u64, QueryResult), TransportError> {
        let inner = self.inner.lock();
        if inner.deleted {
            return Err(TransportError::QueueDeleted);
        }
        if !inner.endpoints.contains(endpoint) {
            return Err(TransportError::UnknownEndpoint(endpoint.to_string()));
        }
        if !inner.up.get(endpoint).copied().unwrap_or(false) {
            return Err(TransportError::EndpointDown(endpoint.to_string()));
        }
        Ok((inner.log_index, inner.machine.query(&query, self.now_ms())))
    }
}

fn owner_channel<'a>(
    inner: &'a ClusterInner,
    tag: &str,
) -> Option<&'a mpsc::UnboundedSender<SessionEvent>> {
    inner
        .consumer_owner
        .get(tag)
        .and_then(|session| inner.sessions.get(session))
}

/// Per-session view over the cluster; what `QueueSession` holds.
struct SessionHandle<C: Clock> {
    cluster: Arc<LocalCluster<C>>,
    session_id: String,
}

impl<C: Clock> CommandLog for SessionHandle<C> {
    fn pipeline_command(&self, endpoint: &EndpointId, correlation: u64, command: Command) {
        self.cluster
            .pipeline(endpoint, &self.session_id, correlation, command);
    }

    fn local_query(
        &self,
        endpoint: &EndpointId,
        query: Query,
    ) -> Result<(u64, QueryResult), TransportError> {
        self.cluster.query(endpoint, query)
    }
}
