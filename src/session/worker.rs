//! Owning task per session, with supervised restarts.
//!
//! A session is single-owner state: one task drains its event stream in
//! arrival order and runs the lost-command resend tick. Crash recovery is
//! explicit rather than ambient: a supervisor restarts a failed worker only
//! within a bounded restart intensity over a sliding window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::replication::log::SessionEvent;
use crate::session::client::{Action, QueueSession, SessionError};

/// Restart budget over a sliding window.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window: Duration::from_secs(10),
        }
    }
}

/// Sliding-window counter enforcing a [`RestartPolicy`].
#[derive(Debug)]
pub struct RestartIntensity {
    policy: RestartPolicy,
    restarts: VecDeque<Instant>,
}

impl RestartIntensity {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restarts: VecDeque::new(),
        }
    }

    /// Record one restart. Returns false when the budget is exhausted.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(front) = self.restarts.front() {
            if now.duration_since(*front) > self.policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        self.restarts.len() <= self.policy.max_restarts as usize
    }
}

/// Why a session worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue was deleted; the session is unusable and must not restart.
    Eol,
    /// The event stream or the action consumer went away.
    Detached,
}

/// Run one session as an owning task: events in arrival order, actions out,
/// plus the periodic stale-command resend tick.
pub fn spawn_session(
    mut session: QueueSession,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    actions: mpsc::UnboundedSender<Action>,
    resend_interval: Duration,
) -> JoinHandle<WorkerExit> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(resend_interval);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return WorkerExit::Detached;
                    };
                    let out = match session.handle_event(event) {
                        Ok(out) => out,
                        Err(SessionError::Ended) => return WorkerExit::Eol,
                        Err(err) => {
                            tracing::error!(%err, "session event handling failed");
                            return WorkerExit::Detached;
                        }
                    };
                    for action in out {
                        let terminal = action == Action::Eol;
                        if actions.send(action).is_err() {
                            return WorkerExit::Detached;
                        }
                        if terminal {
                            return WorkerExit::Eol;
                        }
                    }
                }
                _ = tick.tick() => {
                    session.resend_stale();
                }
            }
        }
    })
}

/// Terminal supervisor outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Eol,
    IntensityExceeded,
}

/// Everything needed to (re)start one session worker.
pub struct SessionRun {
    pub session: QueueSession,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub actions: mpsc::UnboundedSender<Action>,
    pub resend_interval: Duration,
}

/// Keep one session worker alive within the restart budget. `make` builds a
/// fresh session and event attachment for each attempt.
pub async fn supervise<F>(policy: RestartPolicy, mut make: F) -> SupervisorExit
where
    F: FnMut(u32) -> SessionRun,
{
    let mut intensity = RestartIntensity::new(policy);
    let mut attempt = 0;
    loop {
        let run = make(attempt);
        attempt += 1;
        let worker = spawn_session(run.session, run.events, run.actions, run.resend_interval);
        let exit = match worker.await {
            Ok(exit) => exit,
            Err(err) => {
                tracing::error!(%err, "session worker aborted");
                WorkerExit::Detached
            }
        };
        match exit {
            WorkerExit::Eol => return SupervisorExit::Eol,
            WorkerExit::Detached => {
                if !intensity.record(Instant::now()) {
                    tracing::error!(attempt, "session restart intensity exceeded; giving up");
                    return SupervisorExit::IntensityExceeded;
                }
                tracing::warn!(attempt, "restarting session worker");
            }
        }
    }
}
