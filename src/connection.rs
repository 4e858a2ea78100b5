use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::error::Result;
use crate::event_loop::{EventLoop, LoopCore, LoopHandle};
use crate::socket::Socket;

/// Connection lifecycle. Only the owning loop thread mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type ConnRef = Rc<Connection>;

pub type ConnectedCallback = Rc<dyn Fn(&ConnRef)>;
pub type MessageCallback = Rc<dyn Fn(&ConnRef, &mut Buffer)>;
pub type CloseCallback = Rc<dyn Fn(&ConnRef)>;
pub type AnyEventCallback = Rc<dyn Fn(&ConnRef)>;

const READ_CHUNK: usize = 65536;

/// One TCP connection: an owned socket, the channel binding it to the loop,
/// input and output buffers, and the user's callbacks.
///
/// All state transitions happen on the loop thread. `send` and `shutdown`
/// may be called from any thread; foreign callers are routed onto the loop
/// by connection id, so they never touch the connection object directly.
pub struct Connection {
    id: u64,
    socket: Socket,
    state: Cell<ConnectionState>,
    channel: Rc<Channel>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    context: RefCell<Option<Box<dyn Any>>>,
    idle_timeout: Cell<Option<u64>>,
    core: Weak<LoopCore>,
    handle: LoopHandle,
    self_ref: Weak<Connection>,
    connected_cb: RefCell<Option<ConnectedCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    close_cb: RefCell<Option<CloseCallback>>,
    any_event_cb: RefCell<Option<AnyEventCallback>>,
}

impl Connection {
    pub fn new(id: u64, socket: Socket, lp: &EventLoop) -> ConnRef {
        Self::with_core(id, socket, lp.core())
    }

    pub(crate) fn with_core(id: u64, socket: Socket, core: &Rc<LoopCore>) -> ConnRef {
        let fd = socket.fd();
        let handle = core.make_handle();
        let core = Rc::downgrade(core);
        Rc::new_cyclic(|me: &Weak<Connection>| {
            let channel = Channel::with_core(fd, core.clone());
            let owner: Weak<dyn Any> = me.clone();
            channel.set_owner(owner);
            {
                let me = me.clone();
                channel.set_event_callback(move || {
                    if let Some(conn) = me.upgrade() {
                        conn.handle_any_event();
                    }
                });
            }
            {
                let me = me.clone();
                channel.set_read_callback(move || {
                    if let Some(conn) = me.upgrade() {
                        conn.handle_read();
                    }
                });
            }
            {
                let me = me.clone();
                channel.set_write_callback(move || {
                    if let Some(conn) = me.upgrade() {
                        conn.handle_write();
                    }
                });
            }
            {
                let me = me.clone();
                channel.set_error_callback(move || {
                    if let Some(conn) = me.upgrade() {
                        conn.handle_error();
                    }
                });
            }
            {
                let me = me.clone();
                channel.set_close_callback(move || {
                    if let Some(conn) = me.upgrade() {
                        conn.handle_close();
                    }
                });
            }
            Connection {
                id,
                socket,
                state: Cell::new(ConnectionState::Connecting),
                channel,
                input: RefCell::new(Buffer::new()),
                output: RefCell::new(Buffer::new()),
                context: RefCell::new(None),
                idle_timeout: Cell::new(None),
                core,
                handle,
                self_ref: me.clone(),
                connected_cb: RefCell::new(None),
                message_cb: RefCell::new(None),
                close_cb: RefCell::new(None),
                any_event_cb: RefCell::new(None),
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    pub fn set_connected_callback(&self, cb: impl Fn(&ConnRef) + 'static) {
        self.set_connected_rc(Rc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(&ConnRef, &mut Buffer) + 'static) {
        self.set_message_rc(Rc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn(&ConnRef) + 'static) {
        self.set_close_rc(Rc::new(cb));
    }

    pub fn set_any_event_callback(&self, cb: impl Fn(&ConnRef) + 'static) {
        self.set_any_event_rc(Rc::new(cb));
    }

    pub(crate) fn set_connected_rc(&self, cb: ConnectedCallback) {
        *self.connected_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_message_rc(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_rc(&self, cb: CloseCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_any_event_rc(&self, cb: AnyEventCallback) {
        *self.any_event_cb.borrow_mut() = Some(cb);
    }

    /// Store an opaque per-connection value, replacing any previous one.
    pub fn set_context<T: Any>(&self, context: T) {
        *self.context.borrow_mut() = Some(Box::new(context));
    }

    /// Borrow the context as `T`. None when unset or of a different type.
    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.context.borrow_mut();
        slot.as_mut()?.downcast_mut::<T>().map(f)
    }

    pub fn clear_context(&self) {
        *self.context.borrow_mut() = None;
    }

    /// Close this connection after `secs` seconds without channel activity.
    /// Any event on the connection refreshes the deadline. Must be set on
    /// the loop thread, normally before `established`.
    pub fn enable_idle_timeout(&self, secs: u64) -> Result<()> {
        crate::event_loop::validate_timeout(secs)?;
        self.idle_timeout.set(Some(secs));
        if self.state.get() == ConnectionState::Connected {
            self.arm_idle_timer();
        }
        Ok(())
    }

    /// On-loop initialization: Connecting becomes Connected, the connection
    /// enters the loop's id registry, read interest turns on, and the user's
    /// Connected callback fires.
    pub fn established(&self) {
        debug_assert!(self.handle.is_loop_thread());
        if self.state.get() != ConnectionState::Connecting {
            warn!(id = self.id, state = ?self.state.get(), "established on non-connecting connection");
            return;
        }
        self.state.set(ConnectionState::Connected);
        if let Some(core) = self.core.upgrade() {
            core.register_connection(self.id, self.self_ref.clone());
        }
        if self.idle_timeout.get().is_some() {
            self.arm_idle_timer();
        }
        self.channel.enable_read();
        trace!(id = self.id, "connection established");
        if let Some(pin) = self.self_ref.upgrade() {
            let cb = self.connected_cb.borrow().clone();
            if let Some(cb) = cb {
                cb(&pin);
            }
        }
    }

    /// Queue bytes for delivery. On the loop thread the bytes go straight
    /// into the output buffer; foreign threads get a copy routed through
    /// `run_in_loop` and resolved by connection id.
    pub fn send(&self, data: &[u8]) {
        if self.handle.is_loop_thread() {
            self.send_in_loop(data);
        } else {
            let id = self.id;
            let data = data.to_vec();
            self.handle.run_in_loop(move || {
                if let Some(core) = LoopCore::current() {
                    if let Some(conn) = core.connection(id) {
                        conn.send_in_loop(&data);
                    }
                }
            });
        }
    }

    /// Stop the connection once the output buffer drains; immediate when it
    /// is already empty. Safe to call twice and from any thread.
    pub fn shutdown(&self) {
        if self.handle.is_loop_thread() {
            self.shutdown_in_loop();
        } else {
            let id = self.id;
            self.handle.run_in_loop(move || {
                if let Some(core) = LoopCore::current() {
                    if let Some(conn) = core.connection(id) {
                        conn.shutdown_in_loop();
                    }
                }
            });
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state.get() != ConnectionState::Connected {
            warn!(id = self.id, state = ?self.state.get(), "send on inactive connection");
            return;
        }
        self.output.borrow_mut().write(data);
        if !self.channel.is_writable() {
            self.channel.enable_write();
        }
    }

    fn shutdown_in_loop(&self) {
        match self.state.get() {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            _ => return,
        }
        self.state.set(ConnectionState::Disconnecting);
        let drained = self.output.borrow().readable_size() == 0;
        if drained {
            self.handle_close();
        }
        // Otherwise the write callback completes the shutdown once the
        // output buffer empties.
    }

    /// Channel read callback: pull from the socket until EAGAIN, deliver the
    /// input buffer to the Message callback, then handle EOF. EOF observed
    /// together with data is delivered after the final bytes.
    fn handle_read(&self) {
        let mut eof = false;
        let mut failed = false;
        {
            let mut input = self.input.borrow_mut();
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match self.socket.recv(&mut chunk) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => input.write(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(id = self.id, error = %e, "recv failed");
                        failed = true;
                        break;
                    }
                }
            }
        }

        if self.input.borrow().readable_size() > 0 {
            let cb = self.message_cb.borrow().clone();
            if let Some(cb) = cb {
                if let Some(pin) = self.self_ref.upgrade() {
                    let mut input = self.input.borrow_mut();
                    cb(&pin, &mut input);
                }
            }
        }

        if eof || failed {
            self.handle_close();
        }
    }

    /// Channel write callback: drain what the kernel will take; a partial
    /// write leaves the remainder for the next writable event. A drained
    /// buffer turns write interest off and, mid-shutdown, closes.
    fn handle_write(&self) {
        let result = {
            let mut output = self.output.borrow_mut();
            match self.socket.send(output.readable()) {
                Ok(n) => {
                    output.consume(n);
                    Ok(output.readable_size())
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    Ok(output.readable_size())
                }
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(0) => {
                self.channel.disable_write();
                if self.state.get() == ConnectionState::Disconnecting {
                    self.handle_close();
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(id = self.id, error = %e, "send failed");
                self.handle_close();
            }
        }
    }

    /// Socket error event: record SO_ERROR and collapse to the close path.
    fn handle_error(&self) {
        let err = self.socket.take_error().ok().flatten();
        warn!(id = self.id, error = ?err, "connection error");
        self.handle_close();
    }

    fn handle_any_event(&self) {
        if self.idle_timeout.get().is_some() {
            if let Some(core) = self.core.upgrade() {
                if core.wheel.has(self.id) {
                    core.wheel.refresh(self.id);
                }
            }
        }
        let cb = self.any_event_cb.borrow().clone();
        if let Some(cb) = cb {
            if let Some(pin) = self.self_ref.upgrade() {
                cb(&pin);
            }
        }
    }

    /// Idempotent terminal transition: interest off, channel out of the
    /// poller, idle timer gone, Closed callback (with the connection pinned
    /// so the user may drop the last external reference), registry entry
    /// removed. The fd itself closes when the last strong reference drops.
    fn handle_close(&self) {
        if self.state.get() == ConnectionState::Disconnected {
            return;
        }
        self.state.set(ConnectionState::Disconnected);
        debug!(id = self.id, "connection closed");
        self.channel.disable_all();
        self.channel.remove();
        if let Some(core) = self.core.upgrade() {
            if self.idle_timeout.get().is_some() {
                core.wheel.cancel(self.id);
            }
        }
        if let Some(pin) = self.self_ref.upgrade() {
            let cb = self.close_cb.borrow().clone();
            if let Some(cb) = cb {
                cb(&pin);
            }
        }
        if let Some(core) = self.core.upgrade() {
            core.unregister_connection(self.id);
        }
    }

    fn arm_idle_timer(&self) {
        let secs = match self.idle_timeout.get() {
            Some(secs) => secs,
            None => return,
        };
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return,
        };
        let me = self.self_ref.clone();
        let id = self.id;
        core.wheel.add(
            id,
            secs,
            Box::new(move || {
                if let Some(conn) = me.upgrade() {
                    debug!(id, "idle timeout expired");
                    conn.handle_close();
                }
            }),
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A connection dropped without reaching Disconnected must still
        // leave the poller before its fd closes.
        if self.state.get() != ConnectionState::Disconnected {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_round_trip() {
        let lp = EventLoop::new().unwrap();
        let server = Socket::server("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = server.local_addr().unwrap();
        let client = Socket::client(addr).unwrap();
        let conn = Connection::new(1, client, &lp);

        assert!(conn.with_context::<u32, _>(|_| ()).is_none());
        conn.set_context(41u32);
        conn.with_context::<u32, _>(|v| *v += 1);
        assert_eq!(conn.with_context::<u32, _>(|v| *v), Some(42));
        // Wrong type is signalled, not coerced.
        assert!(conn.with_context::<String, _>(|_| ()).is_none());
        conn.clear_context();
        assert!(conn.with_context::<u32, _>(|_| ()).is_none());
    }

    #[test]
    fn established_requires_connecting() {
        let lp = EventLoop::new().unwrap();
        let server = Socket::server("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = server.local_addr().unwrap();
        let conn = Connection::new(1, Socket::client(addr).unwrap(), &lp);

        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.established();
        assert_eq!(conn.state(), ConnectionState::Connected);
        // A second established is rejected.
        conn.established();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn shutdown_with_empty_output_closes_immediately() {
        let lp = EventLoop::new().unwrap();
        let server = Socket::server("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = server.local_addr().unwrap();
        let conn = Connection::new(1, Socket::client(addr).unwrap(), &lp);
        conn.established();

        let closed = Rc::new(Cell::new(0));
        {
            let closed = closed.clone();
            conn.set_close_callback(move |_| closed.set(closed.get() + 1));
        }
        conn.shutdown();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(closed.get(), 1);
        // Close is idempotent.
        conn.shutdown();
        conn.handle_close();
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn idle_timeout_validates_range() {
        let lp = EventLoop::new().unwrap();
        let server = Socket::server("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = server.local_addr().unwrap();
        let conn = Connection::new(1, Socket::client(addr).unwrap(), &lp);
        assert!(conn.enable_idle_timeout(0).is_err());
        assert!(conn.enable_idle_timeout(60).is_err());
        assert!(conn.enable_idle_timeout(5).is_ok());
    }
}
