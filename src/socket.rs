use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Type};
use tracing::warn;

use crate::error::Result;

/// Owned TCP socket. This wrapper is the single owner of the fd: channels
/// bound to it never close it, and the fd is released exactly once when the
/// wrapper drops.
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create, bind, and listen a non-blocking server socket with address
    /// and port reuse enabled.
    pub fn server(addr: SocketAddr, backlog: i32) -> Result<Socket> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        set_reuse_port(socket.as_raw_fd());
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        Ok(Socket { inner: socket })
    }

    /// Create a client socket and connect it, then switch to non-blocking.
    pub fn client(addr: SocketAddr) -> Result<Socket> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect(&addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(Socket { inner: socket })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Accept one pending connection; the accepted socket is non-blocking
    /// and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (stream, addr) = self.inner.accept()?;
        stream.set_nonblocking(true)?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address"))?;
        Ok((Socket { inner: stream }, addr))
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.inner.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Send without raising SIGPIPE when the peer has gone away.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.inner.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP local address"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address"))
    }

    /// Drain the socket's pending SO_ERROR, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }
}

/// SO_REUSEPORT lets multiple listeners share one port for load balancing;
/// socket2 gates the setter, so set it directly.
fn set_reuse_port(fd: RawFd) {
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(fd, "failed to set SO_REUSEPORT");
    }
}
