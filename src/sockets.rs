use mio::net::TcpStream;
use nix::sys::socket::setsockopt;
use nix::sys::socket::sockopt;
use std::io;
use std::net::Shutdown;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;

/// Reads and clears the socket's pending error, if any.
pub(crate) fn socket_error(stream: &TcpStream) -> Option<io::Error> {
    match stream.take_error() {
        Ok(err) => err,
        Err(err) => Some(err),
    }
}

/// A connect that landed on its own ephemeral port looped back to itself.
pub(crate) fn is_self_connect(stream: &TcpStream) -> bool {
    match (stream.local_addr(), stream.peer_addr()) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

/// Half-closes the write side of the stream.
pub(crate) fn shutdown_write(stream: &TcpStream) {
    if let Err(err) = stream.shutdown(Shutdown::Write) {
        if err.kind() != io::ErrorKind::NotConnected {
            log::error!("shutdown write failed: {err}");
        }
    }
}

pub(crate) fn set_tcp_nodelay(stream: &TcpStream, on: bool) {
    if let Err(err) = stream.set_nodelay(on) {
        log::warn!("failed to set TCP_NODELAY: {err}");
    }
}

pub(crate) fn set_keep_alive(fd: RawFd, on: bool) {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    if let Err(err) = setsockopt(&fd, sockopt::KeepAlive, &on) {
        log::warn!("failed to set SO_KEEPALIVE: {err}");
    }
}
