use crate::channel::Channel;
use crate::event_loop::EventLoop;
use anyhow::Context;
use anyhow::Result;
use mio::net::TcpListener;
use mio::net::TcpStream;
use nix::errno::Errno;
use std::cell::Cell;
use std::cell::RefCell;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

/// Invoked for every accepted connection.
pub type NewConnectionCallback = Box<dyn FnMut(TcpStream, SocketAddr) + 'static>;

/// Listening-socket state machine.
///
/// Owns the listening fd for its whole lifetime and lives on the loop that
/// accepts. Accepted sockets are handed off through the new-connection
/// callback together with the peer address.
pub struct Acceptor {
    listener: TcpListener,
    channel: Rc<Channel>,
    listening: Cell<bool>,
    // Reserved descriptor, sacrificed to shed connections under EMFILE.
    idle_fd: RefCell<Option<File>>,
    on_new_connection: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Binds `listen_addr` (non-blocking, close-on-exec, SO_REUSEADDR).
    pub fn new(event_loop: &Rc<EventLoop>, listen_addr: SocketAddr) -> Result<Rc<Acceptor>> {
        let listener = TcpListener::bind(listen_addr)
            .with_context(|| format!("failed to listen on {listen_addr}"))?;
        let channel = Channel::new(event_loop, listener.as_raw_fd());

        let acceptor = Rc::new(Acceptor {
            listener,
            channel,
            listening: Cell::new(false),
            idle_fd: RefCell::new(File::open("/dev/null").ok()),
            on_new_connection: RefCell::new(None),
        });

        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub fn set_new_connection_callback<F>(&self, callback: F)
    where
        F: FnMut(TcpStream, SocketAddr) + 'static,
    {
        *self.on_new_connection.borrow_mut() = Some(Box::new(callback));
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("listener has no local address")
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    /// Starts accepting connections.
    pub fn listen(&self) {
        self.listening.set(true);
        self.channel.enable_reading();
    }

    // Accept until the backlog is drained; readiness is edge-style so a
    // single pass must not leave connections queued.
    fn handle_read(&self) {
        loop {
            match self.listener.accept() {
                Ok((socket, peer_addr)) => {
                    let mut slot = self.on_new_connection.borrow_mut();
                    match slot.as_mut() {
                        Some(callback) => callback(socket, peer_addr),
                        None => drop(socket),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_transient_accept_error(&err) => {
                    log::warn!("accept failed transiently: {err}");
                    continue;
                }
                Err(err) if err.raw_os_error() == Some(Errno::EMFILE as i32) => {
                    self.shed_connection();
                }
                Err(err) => {
                    log::error!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    // Out of descriptors: close the reserve fd, accept the connection the
    // kernel keeps reporting, drop it, and take the reserve back. Without
    // this the level of the listening fd never clears.
    fn shed_connection(&self) {
        log::error!("accept hit the fd limit, shedding one connection");
        let mut idle_fd = self.idle_fd.borrow_mut();
        idle_fd.take();
        if let Ok((socket, peer_addr)) = self.listener.accept() {
            log::warn!("shed connection from {peer_addr}");
            drop(socket);
        }
        *idle_fd = File::open("/dev/null").ok();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code)
            if code == Errno::ECONNABORTED as i32
                || code == Errno::EPROTO as i32
                || code == Errno::EPERM as i32
    )
}
