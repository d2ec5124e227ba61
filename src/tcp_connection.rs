use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::event_loop::Index;
use crate::event_loop::LoopHandle;
use crate::event_loop::Resource;
use crate::sockets;
use mio::net::TcpStream;
use std::cell::RefCell;
use std::io;
use std::io::Write;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::rc::Rc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Invoked when a connection is established and again when it goes down;
/// the two are told apart through [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync + 'static>;

/// Invoked with the input buffer whenever bytes arrive. The callback may
/// consume any prefix; the residue is retained for the next call.
pub type MessageCallback = Arc<dyn Fn(&TcpConnection, &mut Buffer, Instant) + Send + Sync + 'static>;

/// Invoked when the output buffer drains to empty after a send.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync + 'static>;

pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

struct ConnShared {
    id: Index,
    name: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    event_loop: LoopHandle,
}

/// Handle to one established TCP connection.
///
/// Handles are cheap to clone and safe to use from any thread; the actual
/// socket, channel and buffers live on the connection's loop thread, and all
/// callbacks for one connection fire there, so per-connection state in user
/// code needs no synchronization.
#[derive(Clone)]
pub struct TcpConnection {
    shared: Arc<ConnShared>,
}

impl TcpConnection {
    pub(crate) fn new(
        id: Index,
        name: String,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        event_loop: LoopHandle,
    ) -> TcpConnection {
        TcpConnection {
            shared: Arc::new(ConnShared {
                id,
                name,
                local_addr,
                peer_addr,
                state: AtomicU8::new(ConnState::Connecting as u8),
                event_loop,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    /// Handle to the loop serving this connection.
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.shared.event_loop
    }

    /// Sends `data`, from any thread.
    ///
    /// On the loop thread with an idle output buffer this writes directly to
    /// the socket; whatever does not fit is buffered and flushed as the
    /// socket drains.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            log::warn!(
                "connection {} is down, dropping {} bytes",
                self.name(),
                data.len()
            );
            return;
        }
        let conn = self.clone();
        let data = data.to_vec();
        self.shared.event_loop.run_in_loop(move || {
            if let Some(inner) = conn.inner() {
                inner.send_in_loop(&data);
            }
        });
    }

    /// Half-closes the write side once the output buffer is empty.
    pub fn shutdown(&self) {
        let swapped = self.shared.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            let conn = self.clone();
            self.shared.event_loop.run_in_loop(move || {
                if let Some(inner) = conn.inner() {
                    inner.shutdown_in_loop();
                }
            });
        }
    }

    pub fn set_nodelay(&self, on: bool) {
        let conn = self.clone();
        self.shared.event_loop.run_in_loop(move || {
            if let Some(inner) = conn.inner() {
                sockets::set_tcp_nodelay(&inner.socket, on);
            }
        });
    }

    pub(crate) fn id(&self) -> Index {
        self.shared.id
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    // Tears the loop-local half down, after the current dispatch batch.
    pub(crate) fn destroy(&self) {
        let conn = self.clone();
        self.shared.event_loop.queue_in_loop(move || {
            let event_loop = EventLoop::current();
            if let Some(inner) = event_loop.resource::<ConnInner>(conn.id()) {
                inner.connect_destroyed();
            }
            event_loop.remove_resource(conn.id());
        });
    }

    fn inner(&self) -> Option<Rc<ConnInner>> {
        EventLoop::current().resource::<ConnInner>(self.shared.id)
    }
}

/// Loop-local half of a connection: socket, channel and the two buffers.
pub(crate) struct ConnInner {
    conn: TcpConnection,
    socket: TcpStream,
    channel: Rc<Channel>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    on_connection: ConnectionCallback,
    on_message: MessageCallback,
    on_write_complete: Option<WriteCompleteCallback>,
    on_close: CloseCallback,
}

impl Resource for ConnInner {}

impl ConnInner {
    /// Wires a freshly accepted socket into `event_loop` and announces it.
    pub(crate) fn establish(
        event_loop: &Rc<EventLoop>,
        conn: TcpConnection,
        socket: TcpStream,
        on_connection: ConnectionCallback,
        on_message: MessageCallback,
        on_write_complete: Option<WriteCompleteCallback>,
        on_close: CloseCallback,
    ) {
        event_loop.assert_in_loop_thread();
        assert_eq!(conn.state(), ConnState::Connecting);
        sockets::set_keep_alive(socket.as_raw_fd(), true);

        let channel = Channel::new(event_loop, socket.as_raw_fd());
        let inner = Rc::new(ConnInner {
            conn,
            socket,
            channel,
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            on_connection,
            on_message,
            on_write_complete,
            on_close,
        });

        let weak = Rc::downgrade(&inner);
        inner.channel.set_read_callback(move |receive_time| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_read(receive_time);
            }
        });
        let weak = Rc::downgrade(&inner);
        inner.channel.set_write_callback(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_write();
            }
        });
        let weak = Rc::downgrade(&inner);
        inner.channel.set_close_callback(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_close();
            }
        });
        let weak = Rc::downgrade(&inner);
        inner.channel.set_error_callback(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_error();
            }
        });

        // Dispatch is guarded against the connection going away mid-event.
        let resource: Rc<dyn Resource> = inner.clone();
        inner.channel.tie(&resource);
        event_loop.insert_resource(inner.conn.id(), inner.clone());

        inner.conn.set_state(ConnState::Connected);
        inner.channel.enable_reading();
        (inner.on_connection)(&inner.conn);
    }

    // Drain the socket until it would block; readiness is edge-style and a
    // partial read would go stale.
    fn handle_read(&self, receive_time: Instant) {
        let fd = unsafe { BorrowedFd::borrow_raw(self.channel.fd()) };
        let mut peer_closed = false;
        let mut received = 0usize;
        loop {
            let read = self.input.borrow_mut().read_fd(fd);
            match read {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => received += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Fatal for this connection only; close it for good.
                    log::error!("read on {} failed: {err}", self.conn.name());
                    self.handle_error();
                    peer_closed = true;
                    break;
                }
            }
        }

        if received > 0 {
            let mut input = self.input.borrow_mut();
            (self.on_message)(&self.conn, &mut input, receive_time);
        }
        if peer_closed {
            self.handle_close();
        }
    }

    fn handle_write(&self) {
        if !self.channel.is_writing() {
            log::trace!("connection {} is down, no more writing", self.conn.name());
            return;
        }
        loop {
            let write = {
                let output = self.output.borrow();
                if output.readable_bytes() == 0 {
                    break;
                }
                (&self.socket).write(output.peek())
            };
            match write {
                Ok(n) => {
                    let drained = {
                        let mut output = self.output.borrow_mut();
                        output.retrieve(n);
                        output.readable_bytes() == 0
                    };
                    if drained {
                        self.channel.disable_writing();
                        self.queue_write_complete();
                        if self.conn.state() == ConnState::Disconnecting {
                            self.shutdown_in_loop();
                        }
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Fatal for this connection only; close it for good.
                    log::error!("write on {} failed: {err}", self.conn.name());
                    self.handle_close();
                    break;
                }
            }
        }
    }

    pub(crate) fn send_in_loop(&self, data: &[u8]) {
        if self.conn.state() != ConnState::Connected {
            log::warn!(
                "connection {} is down, dropping {} bytes",
                self.conn.name(),
                data.len()
            );
            return;
        }

        let mut sent = 0usize;
        let mut fault = false;
        // Idle connection: skip the buffer and try the socket directly.
        if !self.channel.is_writing() && self.output.borrow().readable_bytes() == 0 {
            match (&self.socket).write(data) {
                Ok(n) => {
                    sent = n;
                    if sent == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    log::error!("write on {} failed: {err}", self.conn.name());
                    if err.kind() == io::ErrorKind::BrokenPipe
                        || err.kind() == io::ErrorKind::ConnectionReset
                    {
                        fault = true;
                        self.handle_close();
                    }
                }
            }
        }

        if !fault && sent < data.len() {
            self.output.borrow_mut().append(&data[sent..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    pub(crate) fn shutdown_in_loop(&self) {
        // With writes still buffered the half-close waits for handle_write.
        if !self.channel.is_writing() {
            sockets::shutdown_write(&self.socket);
        }
    }

    fn queue_write_complete(&self) {
        if let Some(on_write_complete) = &self.on_write_complete {
            let on_write_complete = on_write_complete.clone();
            let conn = self.conn.clone();
            self.conn
                .owner_loop()
                .queue_in_loop(move || on_write_complete(&conn));
        }
    }

    fn handle_close(&self) {
        let state = self.conn.state();
        log::trace!("connection {} closes in state {:?}", self.conn.name(), state);
        if state == ConnState::Disconnected {
            return;
        }
        self.conn.set_state(ConnState::Disconnected);
        self.channel.disable_all();
        (self.on_connection)(&self.conn);
        (self.on_close)(&self.conn);
    }

    fn handle_error(&self) {
        let err = sockets::socket_error(&self.socket);
        log::error!(
            "connection {} error: {}",
            self.conn.name(),
            err.map_or_else(|| "unknown".into(), |err| err.to_string())
        );
    }

    pub(crate) fn connect_destroyed(&self) {
        if self.conn.state() == ConnState::Connected {
            self.conn.set_state(ConnState::Disconnected);
            (self.on_connection)(&self.conn);
        }
        self.channel.disable_all();
        self.channel.remove();
    }
}
