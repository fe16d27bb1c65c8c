use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Clock abstraction to enforce deterministic time sourcing in core paths.
///
/// The queue machine itself never reads a clock; the command log stamps every
/// applied command with a timestamp taken from the leader's clock, so replay
/// stays deterministic. The trait exists so the in-process cluster and the
/// session worker can be driven by a manual clock in tests.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;
}

/// System-backed clock; replaceable in tests or deterministic replay.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}

/// Hand-advanced clock for tests that assert on elapsed-time accounting.
#[derive(Clone)]
pub struct ManualClock {
    epoch: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move the clock forward. Never runs backwards.
    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock();
        *offset += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + *self.offset.lock()
    }

    fn sleep(&self, _duration: Duration) -> tokio::time::Sleep {
        // Manual time never delays real tasks.
        tokio::time::sleep(Duration::ZERO)
    }
}
