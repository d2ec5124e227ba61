use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

// Sequence numbers are allocated process-wide so a TimerId can never collide
// with a recycled slot.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Callback invoked when a timer expires.
pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// Opaque handle sufficient to cancel a scheduled timer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub(crate) fn next() -> TimerId {
        TimerId {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn sequence(self) -> u64 {
        self.sequence
    }
}

/// A pending timer, exclusively owned by the timer queue.
pub(crate) struct Timer {
    sequence: u64,
    expiration: Instant,
    interval: Option<Duration>,
    callback: TimerCallback,
}

impl Timer {
    pub fn new(
        id: TimerId,
        callback: TimerCallback,
        expiration: Instant,
        interval: Option<Duration>,
    ) -> Timer {
        Timer {
            sequence: id.sequence(),
            expiration,
            interval,
            callback,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    pub fn repeats(&self) -> bool {
        self.interval.is_some()
    }

    /// Moves a repeating timer's expiration past `now`.
    pub fn restart(&mut self, now: Instant) {
        let interval = self.interval.expect("restart on a one-shot timer");
        self.expiration = now + interval;
    }

    pub fn run(&mut self) {
        (self.callback)();
    }
}
