use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::event_loop::next_index;
use crate::event_loop::EventLoop;
use crate::event_loop::Index;
use crate::event_loop::LoopHandle;
use crate::event_loop::Resource;
use crate::event_loop_pool::EventLoopPool;
use crate::event_loop_thread::ThreadInitCallback;
use crate::tcp_connection::CloseCallback;
use crate::tcp_connection::ConnInner;
use crate::tcp_connection::ConnectionCallback;
use crate::tcp_connection::MessageCallback;
use crate::tcp_connection::TcpConnection;
use crate::tcp_connection::WriteCompleteCallback;
use anyhow::Result;
use mio::net::TcpStream;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

fn default_connection_callback(conn: &TcpConnection) {
    log::info!(
        "{} -> {} is {}",
        conn.peer_addr(),
        conn.local_addr(),
        if conn.connected() { "up" } else { "down" }
    );
}

fn default_message_callback(_conn: &TcpConnection, buffer: &mut Buffer, _when: Instant) {
    buffer.retrieve_all();
}

struct ServerShared {
    base: LoopHandle,
    id: Index,
    name: String,
    listen_addr: SocketAddr,
    started: AtomicBool,
    next_conn_id: AtomicU64,
}

/// A TCP server: one acceptor loop handing connections to a worker pool.
///
/// Construct it on the loop that should accept, configure callbacks and the
/// worker count, then [`start`] it. With zero workers the acceptor loop
/// serves the connections itself.
///
/// [`start`]: TcpServer::start
#[derive(Clone)]
pub struct TcpServer {
    shared: Arc<ServerShared>,
}

impl TcpServer {
    /// Binds `listen_addr` on the calling thread's loop.
    pub fn new(event_loop: &Rc<EventLoop>, listen_addr: SocketAddr, name: &str) -> Result<TcpServer> {
        event_loop.assert_in_loop_thread();
        let acceptor = Acceptor::new(event_loop, listen_addr)?;

        let shared = Arc::new(ServerShared {
            base: event_loop.handle(),
            id: next_index(),
            name: name.to_string(),
            listen_addr: acceptor.local_addr(),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
        });

        let on_connection: ConnectionCallback = Arc::new(default_connection_callback);
        let on_message: MessageCallback = Arc::new(default_message_callback);
        let inner = Rc::new(ServerInner {
            shared: shared.clone(),
            acceptor,
            pool: RefCell::new(EventLoopPool::new(event_loop.handle(), name)),
            connections: RefCell::new(HashMap::new()),
            on_connection: RefCell::new(on_connection),
            on_message: RefCell::new(on_message),
            on_write_complete: RefCell::new(None),
            init: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        inner.acceptor.set_new_connection_callback(move |socket, peer_addr| {
            if let Some(inner) = weak.upgrade() {
                inner.new_connection(socket, peer_addr);
            }
        });
        event_loop.insert_resource(shared.id, inner);

        Ok(TcpServer { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The address the server actually listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        self.shared.listen_addr
    }

    /// Sets the number of worker loops. Must precede [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_thread_num(&self, num_threads: usize) {
        self.with_inner(move |inner| inner.pool.borrow_mut().set_thread_num(num_threads));
    }

    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnection) + Send + Sync + 'static,
    {
        let callback: ConnectionCallback = Arc::new(callback);
        self.with_inner(move |inner| *inner.on_connection.borrow_mut() = callback);
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnection, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);
        self.with_inner(move |inner| *inner.on_message.borrow_mut() = callback);
    }

    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnection) + Send + Sync + 'static,
    {
        let callback: WriteCompleteCallback = Arc::new(callback);
        self.with_inner(move |inner| *inner.on_write_complete.borrow_mut() = Some(callback));
    }

    /// Runs on every worker loop before it serves its first connection.
    pub fn set_thread_init_callback<F>(&self, callback: F)
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        let callback: ThreadInitCallback = Arc::new(callback);
        self.with_inner(move |inner| *inner.init.borrow_mut() = Some(callback));
    }

    /// Starts the worker pool and begins accepting. Idempotent.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let name = self.shared.name.clone();
        let listen_addr = self.shared.listen_addr;
        self.with_inner(move |inner| {
            let init = inner.init.borrow().clone();
            inner.pool.borrow_mut().start(init);
            log::info!("server {name} listening on {listen_addr}");
            inner.acceptor.listen();
        });
    }

    fn with_inner<F>(&self, task: F)
    where
        F: FnOnce(&ServerInner) + Send + 'static,
    {
        let id = self.shared.id;
        self.shared.base.run_in_loop(move || {
            if let Some(inner) = EventLoop::current().resource::<ServerInner>(id) {
                task(&inner);
            }
        });
    }
}

// Lives in the base loop's registry; everything here runs on that thread.
struct ServerInner {
    shared: Arc<ServerShared>,
    acceptor: Rc<Acceptor>,
    pool: RefCell<EventLoopPool>,
    connections: RefCell<HashMap<Index, TcpConnection>>,
    on_connection: RefCell<ConnectionCallback>,
    on_message: RefCell<MessageCallback>,
    on_write_complete: RefCell<Option<WriteCompleteCallback>>,
    init: RefCell<Option<ThreadInitCallback>>,
}

impl Resource for ServerInner {}

impl ServerInner {
    fn new_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let worker = self.pool.borrow_mut().get_next_loop();
        let sequence = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", self.shared.name, peer_addr, sequence);
        let local_addr = socket.local_addr().unwrap_or(self.shared.listen_addr);
        log::info!(
            "server {} accepted connection {} from {}",
            self.shared.name,
            name,
            peer_addr
        );

        let conn = TcpConnection::new(next_index(), name, local_addr, peer_addr, worker.clone());
        self.connections.borrow_mut().insert(conn.id(), conn.clone());

        let on_connection = self.on_connection.borrow().clone();
        let on_message = self.on_message.borrow().clone();
        let on_write_complete = self.on_write_complete.borrow().clone();
        let on_close = self.close_callback();
        worker.run_in_loop(move || {
            ConnInner::establish(
                &EventLoop::current(),
                conn,
                socket,
                on_connection,
                on_message,
                on_write_complete,
                on_close,
            );
        });
    }

    // Connections close on their own loop; removal hops back to the base
    // loop where the map lives, then teardown hops to the worker again.
    fn close_callback(&self) -> CloseCallback {
        let base = self.shared.base.clone();
        let server_id = self.shared.id;
        Arc::new(move |conn: &TcpConnection| {
            let conn = conn.clone();
            base.run_in_loop(move || {
                match EventLoop::current().resource::<ServerInner>(server_id) {
                    Some(inner) => inner.remove_connection(&conn),
                    // Server already gone; still tear the connection down.
                    None => conn.destroy(),
                }
            });
        })
    }

    fn remove_connection(&self, conn: &TcpConnection) {
        log::info!(
            "server {} removes connection {}",
            self.shared.name,
            conn.name()
        );
        let removed = self.connections.borrow_mut().remove(&conn.id());
        debug_assert!(removed.is_some());
        conn.destroy();
    }
}
