use std::time::SystemTime;
use tokio::time::Instant;

/// Clock abstraction to enforce deterministic time sourcing in core paths.
///
/// Monotonic readings drive timers (keep-alive, CONNECT arrival, ack
/// timeouts); wall readings stamp subscriptions so they can be ordered
/// against upstream message creation times.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn wall(&self) -> SystemTime;
    fn sleep_until(&self, deadline: Instant) -> tokio::time::Sleep;
}

/// System-backed clock; replaceable in tests or deterministic replay.
/// Monotonic readings honor `tokio::time::pause`.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: Instant) -> tokio::time::Sleep {
        tokio::time::sleep_until(deadline)
    }
}
