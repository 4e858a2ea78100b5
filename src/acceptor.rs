use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::channel::Channel;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

type AcceptCallback = Rc<dyn Fn(Socket, SocketAddr)>;

/// Listening socket bound to the loop as a read-interest channel. Each
/// readable event accepts until the backlog drains and hands every new
/// socket to the accept callback.
pub struct Acceptor {
    socket: Socket,
    channel: Rc<Channel>,
    accept_cb: RefCell<Option<AcceptCallback>>,
}

impl Acceptor {
    pub fn new(lp: &EventLoop, addr: SocketAddr, backlog: i32) -> Result<Rc<Acceptor>> {
        let socket = Socket::server(addr, backlog)?;
        let fd = socket.fd();
        Ok(Rc::new_cyclic(|me: &Weak<Acceptor>| {
            let channel = Channel::with_core(fd, Rc::downgrade(lp.core()));
            {
                let me = me.clone();
                channel.set_read_callback(move || {
                    if let Some(acceptor) = me.upgrade() {
                        acceptor.handle_accept();
                    }
                });
            }
            Acceptor {
                socket,
                channel,
                accept_cb: RefCell::new(None),
            }
        }))
    }

    pub fn set_accept_callback(&self, cb: impl Fn(Socket, SocketAddr) + 'static) {
        *self.accept_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// Turn on read interest. Call after the accept callback is installed;
    /// connections arriving earlier would be accepted with nowhere to go.
    pub fn listen(&self) {
        self.channel.enable_read();
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn handle_accept(&self) {
        loop {
            match self.socket.accept() {
                Ok((socket, peer)) => {
                    let cb = self.accept_cb.borrow().clone();
                    match cb {
                        Some(cb) => cb(socket, peer),
                        None => warn!(peer = %peer, "accepted connection dropped: no accept callback"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // The listen fd closes with the Socket; the poller must not keep a
        // dead entry for it.
        self.channel.disable_all();
        self.channel.remove();
    }
}
