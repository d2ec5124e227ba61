use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::timer::Timer;
use crate::timer::TimerCallback;
use crate::timer::TimerId;
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::ClockId;
use nix::sys::timerfd::Expiration;
use nix::sys::timerfd::TimerFd;
use nix::sys::timerfd::TimerFlags;
use nix::sys::timerfd::TimerSetTimeFlags;
use nix::unistd;
use std::cell::Cell;
use std::cell::OnceCell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::mem;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

// Re-arming the timer fd with a delay below this floor would have it fire
// again before the loop even returns to poll.
const TIMER_FD_FLOOR: Duration = Duration::from_micros(100);

/// Ordered set of pending timers driven by a monotonic timer fd.
///
/// Two parallel indices hold the same timers: a map ordered by
/// `(expiration, sequence)` for earliest-first scans, and a map by sequence
/// for cancellation. Their sizes agree at every operation boundary.
pub(crate) struct TimerQueue {
    timer_fd: TimerFd,
    channel: OnceCell<Rc<Channel>>,
    by_expiry: RefCell<BTreeMap<(Instant, u64), Timer>>,
    by_identity: RefCell<HashMap<u64, Instant>>,
    calling_expired: Cell<bool>,
    canceling: RefCell<HashSet<u64>>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        let timer_fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .expect("failed to create timer fd");

        TimerQueue {
            timer_fd,
            channel: OnceCell::new(),
            by_expiry: RefCell::new(BTreeMap::new()),
            by_identity: RefCell::new(HashMap::new()),
            calling_expired: Cell::new(false),
            canceling: RefCell::new(HashSet::new()),
        }
    }

    /// Wraps the timer fd in a read-enabled channel on `event_loop`.
    pub fn init(&self, event_loop: &Rc<EventLoop>) {
        let fd = self.timer_fd.as_fd().as_raw_fd();
        let channel = Channel::new(event_loop, fd);
        let weak = Rc::downgrade(event_loop);
        channel.set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.timers().handle_expired();
            }
        });
        channel.enable_reading();
        let _ = self.channel.set(channel);
    }

    /// Schedules a timer; repeating when `interval` is set.
    pub fn add_timer(
        &self,
        id: TimerId,
        callback: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) {
        let timer = Timer::new(id, callback, when, interval);
        let earliest_changed = self.insert(timer);
        if earliest_changed {
            self.reschedule(when);
        }
        self.assert_indices_agree();
    }

    /// Cancels a pending timer; stale ids are a no-op.
    ///
    /// Cancelling a timer whose callback is currently running keeps a
    /// repeating timer from being re-armed.
    pub fn cancel(&self, id: TimerId) {
        let sequence = id.sequence();
        let removed = self.by_identity.borrow_mut().remove(&sequence);
        match removed {
            Some(expiration) => {
                let timer = self.by_expiry.borrow_mut().remove(&(expiration, sequence));
                debug_assert!(timer.is_some());
            }
            None if self.calling_expired.get() => {
                self.canceling.borrow_mut().insert(sequence);
            }
            None => {}
        }
        self.assert_indices_agree();
    }

    /// Drains the timer fd and runs every timer that has expired.
    pub fn handle_expired(&self) {
        let now = Instant::now();
        self.drain_timer_fd();

        let mut expired = self.take_expired(now);
        self.calling_expired.set(true);
        self.canceling.borrow_mut().clear();
        for timer in expired.iter_mut() {
            timer.run();
        }
        self.calling_expired.set(false);

        self.rearm(expired, now);
        self.assert_indices_agree();
    }

    fn insert(&self, timer: Timer) -> bool {
        let mut by_expiry = self.by_expiry.borrow_mut();
        let mut by_identity = self.by_identity.borrow_mut();
        let earliest_changed = match by_expiry.first_key_value() {
            Some(((earliest, _), _)) => timer.expiration() < *earliest,
            None => true,
        };
        by_identity.insert(timer.sequence(), timer.expiration());
        by_expiry.insert((timer.expiration(), timer.sequence()), timer);
        assert_eq!(by_expiry.len(), by_identity.len());
        earliest_changed
    }

    fn take_expired(&self, now: Instant) -> Vec<Timer> {
        let mut by_expiry = self.by_expiry.borrow_mut();
        let mut by_identity = self.by_identity.borrow_mut();
        // Everything ordered before the (now, MAX) sentinel has expired.
        let pending = by_expiry.split_off(&(now, u64::MAX));
        let expired: Vec<Timer> = mem::replace(&mut *by_expiry, pending)
            .into_values()
            .collect();
        for timer in &expired {
            by_identity.remove(&timer.sequence());
        }
        assert_eq!(by_expiry.len(), by_identity.len());
        expired
    }

    // Re-arm repeating timers that were not cancelled mid-fire, then program
    // the fd for the new earliest expiration.
    fn rearm(&self, expired: Vec<Timer>, now: Instant) {
        for mut timer in expired {
            if timer.repeats() && !self.canceling.borrow().contains(&timer.sequence()) {
                timer.restart(now);
                self.insert(timer);
            }
        }
        let next = self
            .by_expiry
            .borrow()
            .first_key_value()
            .map(|((when, _), _)| *when);
        if let Some(when) = next {
            self.reschedule(when);
        }
    }

    fn reschedule(&self, when: Instant) {
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(TIMER_FD_FLOOR);
        let expiration = Expiration::OneShot(TimeSpec::from_duration(delay));
        if let Err(err) = self.timer_fd.set(expiration, TimerSetTimeFlags::empty()) {
            log::error!("timerfd_settime failed: {err}");
        }
    }

    // The fd counts expirations; reading it clears the count so the loop is
    // not woken again for the same deadline.
    fn drain_timer_fd(&self) {
        let mut count = [0u8; 8];
        match unistd::read(self.timer_fd.as_fd().as_raw_fd(), &mut count) {
            Ok(n) if n == count.len() => {
                log::trace!("timer fd fired {} times", u64::from_ne_bytes(count));
            }
            Ok(n) => log::error!("timer fd read returned {n} bytes instead of 8"),
            Err(Errno::EAGAIN) => {}
            Err(err) => log::error!("timer fd read failed: {err}"),
        }
    }

    fn assert_indices_agree(&self) {
        assert_eq!(self.by_expiry.borrow().len(), self.by_identity.borrow().len());
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.by_expiry.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn cancel_keeps_both_indices_in_step() {
        let queue = TimerQueue::new();
        let id = TimerId::next();
        queue.add_timer(
            id,
            Box::new(|| {}),
            Instant::now() + Duration::from_secs(60),
            None,
        );
        assert_eq!(queue.pending(), 1);

        queue.cancel(id);
        assert_eq!(queue.pending(), 0);
        // Stale id: a second cancel must be a no-op.
        queue.cancel(id);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn expiry_scan_only_takes_due_timers() {
        let queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        queue.add_timer(
            TimerId::next(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Instant::now() - Duration::from_millis(1),
            None,
        );
        let counter = fired.clone();
        queue.add_timer(
            TimerId::next(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Instant::now() + Duration::from_secs(3600),
            None,
        );

        queue.handle_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn expired_repeating_timer_is_rearmed() {
        let queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        queue.add_timer(
            TimerId::next(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Instant::now() - Duration::from_millis(1),
            Some(Duration::from_secs(3600)),
        );

        queue.handle_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 1);
    }
}
