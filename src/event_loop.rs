use crate::channel::Channel;
use crate::poller::Poller;
use crate::timer::TimerCallback;
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;
use downcast_rs::impl_downcast;
use downcast_rs::Downcast;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use nix::sys::signal;
use nix::sys::signal::SigHandler;
use nix::sys::signal::Signal;
use nix::unistd;
use std::any::type_name;
use std::borrow::Cow;
use std::cell::Cell;
use std::cell::OnceCell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::thread;
use std::thread::ThreadId;
use std::time::Duration;
use std::time::Instant;

/// How long a single poll call may block when the loop is otherwise idle.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrapper type for resource identification.
pub type Index = u64;

// Resource ids are allocated process-wide: a connection created on one loop
// thread must not collide with anything living on another.
static NEXT_INDEX: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_index() -> Index {
    NEXT_INDEX.fetch_add(1, Ordering::Relaxed)
}

/// All objects whose lifetime is managed by an event loop implement the
/// `Resource` trait. Components that cross threads hold an [`Index`] plus a
/// [`LoopHandle`] and look the resource up again on the loop's thread.
pub trait Resource: Downcast + 'static {
    /// Returns a string representation of the resource.
    fn name(&self) -> Cow<str> {
        type_name::<Self>().into()
    }
}

impl_downcast!(Resource);

/// A deferred task queued for execution on a specific loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

// The reactor never wants SIGPIPE: writes to closed sockets must surface as
// EPIPE on the offending fd instead of killing the process.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let ignore = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) };
        if let Err(err) = ignore {
            log::error!("failed to ignore SIGPIPE: {err}");
        }
    });
}

// State shared between a loop and the handles that outlive its thread.
struct LoopShared {
    thread_id: ThreadId,
    wake_fd: EventFd,
    pending: Mutex<Vec<Task>>,
    quit: AtomicBool,
    calling_pending: AtomicBool,
}

impl LoopShared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        if let Err(err) = unistd::write(&self.wake_fd, &one.to_ne_bytes()) {
            log::error!("wakeup write failed: {err}");
        }
    }

    fn queue(&self, task: Task) {
        self.pending
            .lock()
            .expect("pending task queue poisoned")
            .push(task);
        // Wake the loop unless it is mid-cycle on its own thread and will
        // reach the queue anyway. While the drain itself is running the
        // wakeup is still needed: a drained task may have queued this one,
        // and without it the loop would sit in poll for a full timeout.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }
}

/// Sharable, thread-safe handle to an [`EventLoop`].
///
/// Cloning is cheap; every clone addresses the same loop. The handle stays
/// valid after the loop terminates, at which point queued tasks are dropped
/// with it.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Returns whether the calling thread owns the addressed loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Runs `task` on the loop's thread: synchronously when already there,
    /// otherwise through the deferred queue.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the loop's deferred queue.
    ///
    /// Tasks run in enqueue order, after the current dispatch batch and
    /// before the next poll.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue(Box::new(task));
    }

    /// Asks the loop to leave its cycle. Idempotent, callable anywhere.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }

    /// Interrupts a blocking poll.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Schedules `callback` to run on the loop's thread at `when`.
    pub fn run_at<F>(&self, when: Instant, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(when, None, Box::new(callback))
    }

    /// Schedules `callback` to run once after `delay`.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(Instant::now() + delay, None, Box::new(callback))
    }

    /// Schedules `callback` to run every `interval`, starting one interval
    /// from now.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(Instant::now() + interval, Some(interval), Box::new(callback))
    }

    /// Cancels a scheduled timer. Stale ids are ignored.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || EventLoop::current().timers().cancel(id));
    }

    fn schedule(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId::next();
        self.run_in_loop(move || {
            EventLoop::current()
                .timers()
                .add_timer(id, callback, when, interval);
        });
        id
    }
}

/// A thread-owned reactor: polls for readiness, dispatches channels, serves
/// timers and runs tasks queued from other threads.
///
/// At most one loop may exist per thread; within it everything runs without
/// locks. Other threads interact exclusively through a [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: RefCell<Poller>,
    timers: TimerQueue,
    resources: RefCell<HashMap<Index, Rc<dyn Resource>>>,
    wakeup_channel: OnceCell<Rc<Channel>>,
    looping: Cell<bool>,
    handling_events: Cell<bool>,
    current_active: Cell<RawFd>,
    iteration: Cell<u64>,
}

//---------------------------------------------------------
//  CONSTRUCTION AND ACCESSORS.
//---------------------------------------------------------

impl EventLoop {
    /// Creates the event loop owned by the calling thread.
    ///
    /// Panics if this thread already runs a loop, or if the kernel objects
    /// backing the reactor cannot be created.
    pub fn new() -> Rc<EventLoop> {
        ignore_sigpipe();
        CURRENT.with(|current| {
            assert!(
                current.borrow().upgrade().is_none(),
                "another EventLoop already exists on thread {:?}",
                thread::current().id()
            );
        });

        let wake_fd =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
                .expect("failed to create wakeup event fd");

        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            wake_fd,
            pending: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
        });

        let event_loop = Rc::new(EventLoop {
            shared,
            poller: RefCell::new(Poller::new()),
            timers: TimerQueue::new(),
            resources: RefCell::new(HashMap::new()),
            wakeup_channel: OnceCell::new(),
            looping: Cell::new(false),
            handling_events: Cell::new(false),
            current_active: Cell::new(-1),
            iteration: Cell::new(0),
        });

        CURRENT.with(|current| *current.borrow_mut() = Rc::downgrade(&event_loop));

        Self::init_wakeup_channel(&event_loop);
        event_loop.timers.init(&event_loop);
        log::debug!(
            "event loop created on thread {:?}",
            event_loop.shared.thread_id
        );
        event_loop
    }

    // The wakeup fd is an ordinary channel: cross-thread task injection
    // rides the same dispatch path as every other readiness event.
    fn init_wakeup_channel(event_loop: &Rc<EventLoop>) {
        let fd = event_loop.shared.wake_fd.as_fd().as_raw_fd();
        let channel = Channel::new(event_loop, fd);
        let weak = Rc::downgrade(event_loop);
        channel.set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.drain_wake_fd();
            }
        });
        channel.enable_reading();
        let _ = event_loop.wakeup_channel.set(channel);
    }

    /// Returns the loop owned by the calling thread.
    ///
    /// Panics when the thread runs none; see [`EventLoop::try_current`].
    pub fn current() -> Rc<EventLoop> {
        Self::try_current().expect("no EventLoop on this thread")
    }

    /// Returns the loop owned by the calling thread, if any.
    pub fn try_current() -> Option<Rc<EventLoop>> {
        CURRENT.with(|current| current.borrow().upgrade())
    }

    /// Returns a sharable handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop owned by thread {:?} was used from thread {:?}",
            self.shared.thread_id,
            thread::current().id()
        );
    }

    /// Number of completed poll cycles.
    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }
}

//---------------------------------------------------------
//  THE REACTOR CYCLE.
//---------------------------------------------------------

impl EventLoop {
    /// Runs the poll → dispatch → deferred-tasks cycle until [`quit`] is
    /// observed. Must be called from the owning thread.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "EventLoop::run is not reentrant");
        self.looping.set(true);
        log::debug!("event loop starts");

        let mut active: Vec<Rc<Channel>> = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = self.poller.borrow_mut().poll(POLL_TIMEOUT, &mut active);
            self.iteration.set(self.iteration.get() + 1);

            self.handling_events.set(true);
            for channel in &active {
                self.current_active.set(channel.fd());
                channel.handle_event(receive_time);
            }
            self.current_active.set(-1);
            self.handling_events.set(false);

            self.run_pending_tasks();
        }

        self.looping.set(false);
        log::debug!("event loop stops after {} iterations", self.iteration.get());
    }

    /// Asks the loop to leave its cycle. Idempotent, callable anywhere.
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().run_in_loop(task);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().queue_in_loop(task);
    }

    // Swap the queue out under the lock, run the tasks outside of it: keeps
    // the critical section short and lets tasks queue follow-up work
    // without deadlocking. Deliberately not drained to empty in a loop, so
    // task storms cannot starve I/O.
    fn run_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self
                .shared
                .pending
                .lock()
                .expect("pending task queue poisoned");
            mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }

    fn drain_wake_fd(&self) {
        let mut count = [0u8; 8];
        match unistd::read(self.shared.wake_fd.as_fd().as_raw_fd(), &mut count) {
            Ok(n) if n == count.len() => {}
            Ok(n) => log::error!("wakeup fd read returned {n} bytes instead of 8"),
            Err(nix::errno::Errno::EAGAIN) => {}
            Err(err) => log::error!("wakeup fd read failed: {err}"),
        }
    }
}

//---------------------------------------------------------
//  TIMERS.
//---------------------------------------------------------

impl EventLoop {
    /// Schedules `callback` to run at `when`.
    pub fn run_at<F>(&self, when: Instant, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_at(when, callback)
    }

    /// Schedules `callback` to run once after `delay`.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_after(delay, callback)
    }

    /// Schedules `callback` to run every `interval`.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_every(interval, callback)
    }

    /// Cancels a scheduled timer. Stale ids are ignored.
    pub fn cancel(&self, id: TimerId) {
        self.handle().cancel(id);
    }
}

//---------------------------------------------------------
//  CHANNELS AND RESOURCES.
//---------------------------------------------------------

impl EventLoop {
    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        if self.handling_events.get() {
            // Mid-dispatch a channel may only take down itself.
            debug_assert_eq!(self.current_active.get(), channel.fd());
        }
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn insert_resource(&self, id: Index, resource: Rc<dyn Resource>) {
        self.assert_in_loop_thread();
        log::trace!("loop adds resource {} [{}]", id, resource.name());
        self.resources.borrow_mut().insert(id, resource);
    }

    pub(crate) fn remove_resource(&self, id: Index) -> Option<Rc<dyn Resource>> {
        self.assert_in_loop_thread();
        let resource = self.resources.borrow_mut().remove(&id);
        if let Some(resource) = &resource {
            log::trace!("loop drops resource {} [{}]", id, resource.name());
        }
        resource
    }

    pub(crate) fn resource<T: Resource>(&self, id: Index) -> Option<Rc<T>> {
        let resource = self.resources.borrow().get(&id).cloned()?;
        resource.downcast_rc::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        });
        (rx.recv().unwrap(), join)
    }

    fn quiesce(handle: &LoopHandle) {
        let (tx, rx) = mpsc::channel();
        handle.queue_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(15)).unwrap();
    }

    #[test]
    fn one_loop_per_thread() {
        let _event_loop = EventLoop::new();
        let second = panic::catch_unwind(AssertUnwindSafe(EventLoop::new));
        assert!(second.is_err());
    }

    #[test]
    fn runs_task_synchronously_on_loop_thread() {
        let event_loop = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        event_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cross_thread_tasks_all_run() {
        let (handle, join) = spawn_loop();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..3 {
            let handle = handle.clone();
            let counter = counter.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let counter = counter.clone();
                    handle.run_in_loop(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        quiesce(&handle);
        assert_eq!(counter.load(Ordering::SeqCst), 3000);
        handle.quit();
        join.join().unwrap();
    }

    #[test]
    fn queued_tasks_keep_enqueue_order() {
        let (handle, join) = spawn_loop();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = order.clone();
            handle.queue_in_loop(move || order.lock().unwrap().push(i));
        }

        quiesce(&handle);
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
        handle.quit();
        join.join().unwrap();
    }

    #[test]
    fn queued_task_runs_within_one_cycle() {
        let (handle, join) = spawn_loop();
        let start = Instant::now();
        quiesce(&handle);
        // One poll cycle is bounded by the 10 second poll timeout.
        assert!(start.elapsed() < Duration::from_secs(11));
        handle.quit();
        join.join().unwrap();
    }

    #[test]
    fn quit_is_idempotent() {
        let (handle, join) = spawn_loop();
        handle.quit();
        handle.quit();
        handle.quit();
        join.join().unwrap();
    }
}
