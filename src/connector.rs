use crate::channel::Channel;
use crate::event_loop::next_index;
use crate::event_loop::EventLoop;
use crate::event_loop::Index;
use crate::event_loop::LoopHandle;
use crate::event_loop::Resource;
use crate::sockets;
use mio::net::TcpStream;
use nix::errno::Errno;
use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Receives the connected stream once the handshake completes.
pub type NewStreamCallback = Box<dyn FnMut(TcpStream) + Send + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }
}

// Loop-local half of a connector: the in-flight socket and its channel live
// in the loop's resource registry and never leave the loop thread.
#[derive(Default)]
struct ConnectorInner {
    channel: RefCell<Option<Rc<Channel>>>,
    socket: RefCell<Option<TcpStream>>,
}

impl Resource for ConnectorInner {}

/// Non-blocking connect state machine with exponential backoff.
///
/// `Disconnected → Connecting → Connected`, falling back to `Disconnected`
/// on every failed attempt. Retries are timers on the owning loop, doubling
/// from 500 ms up to 30 s. `start` and `stop` may be called from any thread.
pub struct Connector {
    event_loop: LoopHandle,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    attempts: AtomicU64,
    inner_id: Index,
    on_new_stream: Mutex<Option<NewStreamCallback>>,
    self_ref: Weak<Connector>,
}

impl Connector {
    pub fn new(event_loop: LoopHandle, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|self_ref| Connector {
            event_loop,
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY.as_millis() as u64),
            attempts: AtomicU64::new(0),
            inner_id: next_index(),
            on_new_stream: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Installs the callback that receives the connected stream.
    pub fn set_new_stream_callback<F>(&self, callback: F)
    where
        F: FnMut(TcpStream) + Send + 'static,
    {
        *self.on_new_stream.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Begins connecting. Safe to call from any thread.
    pub fn start(&self) {
        self.connect.store(true, Ordering::Release);
        let weak = self.self_ref.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
    }

    /// Withdraws the intent to connect. Idempotent; an in-flight retry
    /// observes the cleared flag and becomes a no-op.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        let weak = self.self_ref.clone();
        self.event_loop.queue_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.stop_in_loop();
            }
        });
    }

    /// Connects again from a clean slate, with the backoff reset.
    pub fn restart(&self) {
        self.connect.store(true, Ordering::Release);
        let weak = self.self_ref.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.set_state(State::Disconnected);
                connector
                    .retry_delay_ms
                    .store(INIT_RETRY_DELAY.as_millis() as u64, Ordering::Relaxed);
                connector.start_in_loop();
            }
        });
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start_in_loop(&self) {
        if self.state() != State::Disconnected {
            return;
        }
        if !self.connect.load(Ordering::Acquire) {
            log::debug!("connector to {} was stopped", self.server_addr);
            return;
        }
        self.connect_attempt();
    }

    fn stop_in_loop(&self) {
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            if let Some(socket) = self.take_socket_and_reset_channel() {
                drop(socket);
            }
        }
    }

    fn connect_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        // An in-progress connect is a success here: completion (or failure)
        // arrives as writability on the socket.
        match TcpStream::connect(self.server_addr) {
            Ok(socket) => self.connecting(socket),
            Err(err) if is_retryable_connect_error(&err) => {
                log::warn!("connect to {} failed: {err}", self.server_addr);
                self.schedule_retry();
            }
            Err(err) => {
                log::error!("connect to {} failed for good: {err}", self.server_addr);
                self.connect.store(false, Ordering::Release);
            }
        }
    }

    fn connecting(&self, socket: TcpStream) {
        self.set_state(State::Connecting);
        let event_loop = EventLoop::current();
        let inner = self.inner(&event_loop);

        let channel = Channel::new(&event_loop, socket.as_raw_fd());
        let weak = self.self_ref.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        });
        let weak = self.self_ref.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });
        channel.enable_writing();

        *inner.socket.borrow_mut() = Some(socket);
        *inner.channel.borrow_mut() = Some(channel);
    }

    // A writable connecting socket only means the handshake finished, not
    // that it succeeded: SO_ERROR tells them apart.
    fn handle_write(&self) {
        if self.state() != State::Connecting {
            debug_assert_eq!(self.state(), State::Disconnected);
            return;
        }
        let socket = match self.take_socket_and_reset_channel() {
            Some(socket) => socket,
            None => return,
        };

        if let Some(err) = sockets::socket_error(&socket) {
            log::warn!("connect to {} reported SO_ERROR: {err}", self.server_addr);
            self.retry(socket);
        } else if sockets::is_self_connect(&socket) {
            log::warn!("connect to {} met a self-connect", self.server_addr);
            self.retry(socket);
        } else {
            self.set_state(State::Connected);
            if self.connect.load(Ordering::Acquire) {
                let mut slot = self.on_new_stream.lock().unwrap();
                match slot.as_mut() {
                    Some(callback) => callback(socket),
                    None => drop(socket),
                }
            }
        }
    }

    fn handle_error(&self) {
        if self.state() != State::Connecting {
            return;
        }
        let socket = match self.take_socket_and_reset_channel() {
            Some(socket) => socket,
            None => return,
        };
        let err = sockets::socket_error(&socket);
        log::error!(
            "connector to {} failed: {}",
            self.server_addr,
            err.map_or_else(|| "unknown error".into(), |err| err.to_string())
        );
        self.retry(socket);
    }

    fn retry(&self, socket: TcpStream) {
        drop(socket);
        self.set_state(State::Disconnected);
        if !self.connect.load(Ordering::Acquire) {
            log::debug!("connector to {} was stopped", self.server_addr);
            return;
        }
        self.schedule_retry();
    }

    fn schedule_retry(&self) {
        let delay = Duration::from_millis(self.retry_delay_ms.load(Ordering::Relaxed));
        log::info!("retrying {} in {:?}", self.server_addr, delay);

        let weak = self.self_ref.clone();
        self.event_loop.run_after(delay, move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
        let next = (delay * 2).min(MAX_RETRY_DELAY);
        self.retry_delay_ms
            .store(next.as_millis() as u64, Ordering::Relaxed);
    }

    fn inner(&self, event_loop: &Rc<EventLoop>) -> Rc<ConnectorInner> {
        match event_loop.resource::<ConnectorInner>(self.inner_id) {
            Some(inner) => inner,
            None => {
                let inner = Rc::new(ConnectorInner::default());
                event_loop.insert_resource(self.inner_id, inner.clone());
                inner
            }
        }
    }

    // Detaches the channel and surrenders the socket. The dispatch batch
    // still holds a reference to the channel, so dropping ours here cannot
    // free it in the middle of its own handle_event.
    fn take_socket_and_reset_channel(&self) -> Option<TcpStream> {
        let event_loop = EventLoop::current();
        let inner = self.inner(&event_loop);
        if let Some(channel) = inner.channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
        let socket = inner.socket.borrow_mut().take();
        socket
    }
}

fn is_retryable_connect_error(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code)
            if code == Errno::EAGAIN as i32
                || code == Errno::EADDRINUSE as i32
                || code == Errno::EADDRNOTAVAIL as i32
                || code == Errno::ECONNREFUSED as i32
                || code == Errno::ENETUNREACH as i32
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop_thread::EventLoopThread;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::mpsc;
    use std::thread;

    fn refused_addr() -> SocketAddr {
        // Bind an ephemeral port and release it again: nobody listens there.
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn connects_to_a_live_listener() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut loop_thread = EventLoopThread::new(None, "connector-test");
        let handle = loop_thread.start_loop();

        let connector = Connector::new(handle, addr);
        let (tx, rx) = mpsc::channel();
        connector.set_new_stream_callback(move |socket| {
            tx.send(socket.peer_addr().unwrap()).unwrap();
        });
        connector.start();

        let peer = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(peer, addr);
        let (_accepted, _) = listener.accept().unwrap();
    }

    #[test]
    fn backs_off_exponentially_against_a_dead_peer() {
        let mut loop_thread = EventLoopThread::new(None, "connector-test");
        let handle = loop_thread.start_loop();

        let connector = Connector::new(handle, refused_addr());
        connector.start();

        // Attempts land at roughly t = 0, 0.5 and 1.5 seconds.
        thread::sleep(Duration::from_millis(1300));
        let attempts = connector.attempts.load(Ordering::Relaxed);
        assert!((2..=3).contains(&attempts), "attempts = {attempts}");
        let delay = connector.retry_delay_ms.load(Ordering::Relaxed);
        assert!((2000..=4000).contains(&delay), "delay = {delay}");
    }

    #[test]
    fn stop_prevents_further_attempts() {
        let mut loop_thread = EventLoopThread::new(None, "connector-test");
        let handle = loop_thread.start_loop();

        let connector = Connector::new(handle, refused_addr());
        connector.start();
        thread::sleep(Duration::from_millis(200));
        connector.stop();
        connector.stop();

        let attempts = connector.attempts.load(Ordering::Relaxed);
        // The pending retry timer fires, observes the cleared intent flag
        // and gives up without another attempt.
        thread::sleep(Duration::from_millis(800));
        assert_eq!(connector.attempts.load(Ordering::Relaxed), attempts);
    }
}
