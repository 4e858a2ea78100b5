use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::{info, trace, warn};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::config::Config;
use crate::connection::{
    AnyEventCallback, ConnRef, Connection, ConnectedCallback, MessageCallback,
};
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

/// TCP server over one event loop: accepts connections, allocates their
/// ids, installs the user callbacks, and keeps the strong connection table.
///
/// Construct it on the loop thread before `EventLoop::start`. Connections
/// stay alive through this table until their close path removes them.
pub struct TcpServer {
    core: Rc<crate::event_loop::LoopCore>,
    acceptor: Rc<Acceptor>,
    config: Config,
    next_id: Cell<u64>,
    connections: RefCell<AHashMap<u64, ConnRef>>,
    self_ref: Weak<TcpServer>,
    connected_cb: RefCell<Option<ConnectedCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    close_cb: RefCell<Option<Rc<dyn Fn(&ConnRef)>>>,
    any_event_cb: RefCell<Option<AnyEventCallback>>,
}

impl TcpServer {
    pub fn bind(lp: &EventLoop, addr: SocketAddr, config: Config) -> Result<Rc<TcpServer>> {
        if let Some(secs) = config.idle_timeout_secs {
            crate::event_loop::validate_timeout(secs)?;
        }
        let acceptor = Acceptor::new(lp, addr, config.backlog)?;
        let server = Rc::new_cyclic(|me: &Weak<TcpServer>| TcpServer {
            core: lp.core().clone(),
            acceptor,
            config,
            next_id: Cell::new(1),
            connections: RefCell::new(AHashMap::new()),
            self_ref: me.clone(),
            connected_cb: RefCell::new(None),
            message_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            any_event_cb: RefCell::new(None),
        });
        {
            let me = server.self_ref.clone();
            server.acceptor.set_accept_callback(move |socket, peer| {
                if let Some(server) = me.upgrade() {
                    server.on_accept(socket, peer);
                }
            });
        }
        info!(addr = %server.local_addr()?, "tcp server bound");
        Ok(server)
    }

    /// Begin accepting connections.
    pub fn start(&self) {
        self.acceptor.listen();
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.acceptor.local_addr()?)
    }

    pub fn connection(&self, id: u64) -> Option<ConnRef> {
        self.connections.borrow().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn set_connected_callback(&self, cb: impl Fn(&ConnRef) + 'static) {
        *self.connected_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(&ConnRef, &mut Buffer) + 'static) {
        *self.message_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn(&ConnRef) + 'static) {
        *self.close_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_any_event_callback(&self, cb: impl Fn(&ConnRef) + 'static) {
        *self.any_event_cb.borrow_mut() = Some(Rc::new(cb));
    }

    fn on_accept(&self, socket: Socket, peer: SocketAddr) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        if let Err(e) = socket.set_nodelay(self.config.tcp_nodelay) {
            warn!(id, error = %e, "failed to set TCP_NODELAY");
        }

        // The loop thread owns every connection this server creates; the
        // accept callback already runs there.
        let conn = Connection::with_core(id, socket, &self.core);

        if let Some(cb) = self.connected_cb.borrow().clone() {
            conn.set_connected_rc(cb);
        }
        if let Some(cb) = self.message_cb.borrow().clone() {
            conn.set_message_rc(cb);
        }
        if let Some(cb) = self.any_event_cb.borrow().clone() {
            conn.set_any_event_rc(cb);
        }
        {
            // The close hook removes the table entry before the user's
            // Closed callback observes the connection.
            let me = self.self_ref.clone();
            let user_close = self.close_cb.borrow().clone();
            conn.set_close_callback(move |conn: &ConnRef| {
                if let Some(server) = me.upgrade() {
                    server.connections.borrow_mut().remove(&conn.id());
                }
                if let Some(cb) = &user_close {
                    cb(conn);
                }
            });
        }

        if let Some(secs) = self.config.idle_timeout_secs {
            // Range was validated at bind time.
            let _ = conn.enable_idle_timeout(secs);
        }

        self.connections.borrow_mut().insert(id, conn.clone());
        trace!(id, peer = %peer, "connection accepted");
        conn.established();
    }
}
