use crate::event_loop::EventLoop;
use crate::event_loop::LoopHandle;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

/// Invoked on a freshly constructed loop before it enters its first poll.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync + 'static>;

/// Spawns and owns a thread that runs one event loop.
///
/// Dropping the thread wrapper quits the loop and joins the thread.
pub struct EventLoopThread {
    thread: Option<JoinHandle<()>>,
    published: Arc<(Mutex<Option<LoopHandle>>, Condvar)>,
    init: Option<ThreadInitCallback>,
    name: String,
}

impl EventLoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: impl Into<String>) -> EventLoopThread {
        EventLoopThread {
            thread: None,
            published: Arc::new((Mutex::new(None), Condvar::new())),
            init,
            name: name.into(),
        }
    }

    /// Starts the thread and blocks until its loop is running; returns a
    /// handle to that loop.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread already started");

        let published = self.published.clone();
        let init = self.init.take();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new();
                if let Some(init) = init {
                    init(&event_loop);
                }
                {
                    let (slot, ready) = &*published;
                    *slot.lock().unwrap() = Some(event_loop.handle());
                    ready.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn event loop thread");
        self.thread = Some(thread);

        let (slot, ready) = &*self.published;
        let mut handle = slot.lock().unwrap();
        while handle.is_none() {
            handle = ready.wait(handle).unwrap();
        }
        handle.clone().unwrap()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if let Some(handle) = self.published.0.lock().unwrap().clone() {
                handle.quit();
            }
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn init_callback_runs_before_the_first_poll() {
        let initialized = Arc::new(AtomicBool::new(false));
        let init: ThreadInitCallback = {
            let initialized = initialized.clone();
            Arc::new(move |event_loop: &EventLoop| {
                assert_eq!(event_loop.iteration(), 0);
                initialized.store(true, Ordering::SeqCst);
            })
        };

        let mut loop_thread = EventLoopThread::new(Some(init), "init-test");
        let handle = loop_thread.start_loop();
        assert!(initialized.load(Ordering::SeqCst));

        let (tx, rx) = mpsc::channel();
        handle.run_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(15)).unwrap();
    }

    #[test]
    fn drop_quits_and_joins() {
        let mut loop_thread = EventLoopThread::new(None, "drop-test");
        let _handle = loop_thread.start_loop();
        drop(loop_thread);
    }
}
