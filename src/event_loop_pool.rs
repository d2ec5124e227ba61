use crate::event_loop::EventLoop;
use crate::event_loop::LoopHandle;
use crate::event_loop_thread::EventLoopThread;
use crate::event_loop_thread::ThreadInitCallback;

/// A base loop plus a fixed set of worker loop threads.
///
/// The acceptor runs on the base loop; accepted connections are spread over
/// the workers round-robin. With zero workers the base loop serves
/// connections itself. Thread count and start are set-once, before any
/// connection is dispatched, and the cursor is touched only from the base
/// loop's thread.
pub struct EventLoopPool {
    base: LoopHandle,
    name: String,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
    num_threads: usize,
    next: usize,
    started: bool,
}

impl EventLoopPool {
    pub fn new(base: LoopHandle, name: impl Into<String>) -> EventLoopPool {
        EventLoopPool {
            base,
            name: name.into(),
            threads: Vec::new(),
            loops: Vec::new(),
            num_threads: 0,
            next: 0,
            started: false,
        }
    }

    /// Sets the number of worker loops. Must precede [`start`].
    ///
    /// [`start`]: EventLoopPool::start
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started, "pool already started");
        self.num_threads = num_threads;
    }

    /// Spawns the workers and waits for each loop to come up.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "pool already started");
        assert!(self.base.is_in_loop_thread());
        self.started = true;

        for i in 0..self.num_threads {
            let name = format!("{}{}", self.name, i);
            let mut thread = EventLoopThread::new(init.clone(), name);
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }
        if self.num_threads == 0 {
            if let Some(init) = init {
                init(&EventLoop::current());
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Picks the loop for the next connection, round-robin.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        assert!(self.base.is_in_loop_thread());
        assert!(self.started, "pool not started");
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        handle
    }
}
