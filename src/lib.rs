//! A non-blocking, event-driven TCP networking library built around the
//! reactor pattern: per-thread event loops multiplex I/O readiness, dispatch
//! it through per-fd channels, schedule timers on a kernel timer fd and take
//! cross-thread work through an eventfd wakeup. A pool of loops lets one
//! acceptor loop hand accepted connections to workers round-robin.
//!
//! Linux only.

mod acceptor;
mod buffer;
mod channel;
mod connector;
mod event_loop;
mod event_loop_pool;
mod event_loop_thread;
mod poller;
mod sockets;
mod tcp_connection;
mod tcp_server;
mod timer;
mod timer_queue;

pub use acceptor::Acceptor;
pub use acceptor::NewConnectionCallback;
pub use buffer::Buffer;
pub use channel::Channel;
pub use channel::EventMask;
pub use connector::Connector;
pub use connector::NewStreamCallback;
pub use event_loop::EventLoop;
pub use event_loop::Index;
pub use event_loop::LoopHandle;
pub use event_loop::Resource;
pub use event_loop::Task;
pub use event_loop_pool::EventLoopPool;
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread::ThreadInitCallback;
pub use tcp_connection::ConnectionCallback;
pub use tcp_connection::MessageCallback;
pub use tcp_connection::TcpConnection;
pub use tcp_connection::WriteCompleteCallback;
pub use tcp_server::TcpServer;
pub use timer::TimerCallback;
pub use timer::TimerId;
