use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use crate::event_loop::{EventLoop, LoopCore};

/// Readiness conditions, expressed directly in epoll bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u32);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READABLE: EventSet = EventSet(libc::EPOLLIN as u32);
    pub const WRITABLE: EventSet = EventSet(libc::EPOLLOUT as u32);
    pub const PRIORITY: EventSet = EventSet(libc::EPOLLPRI as u32);
    pub const PEER_CLOSED: EventSet = EventSet(libc::EPOLLRDHUP as u32);
    pub const ERROR: EventSet = EventSet(libc::EPOLLERR as u32);
    pub const HANGUP: EventSet = EventSet(libc::EPOLLHUP as u32);

    pub const fn union(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }

    pub fn from_bits(bits: u32) -> EventSet {
        EventSet(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when any bit of `other` is set in `self`.
    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: EventSet) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EventSet) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

/// Conditions that route to the read callback: data, urgent data, or the
/// peer's half-close (final bytes may still be pending).
const READ_EVENTS: EventSet =
    EventSet::READABLE.union(EventSet::PRIORITY).union(EventSet::PEER_CLOSED);

type Callback = Rc<dyn Fn()>;

/// Binding of one fd to one event loop: an interest mask, the last observed
/// readiness, and per-event callbacks.
///
/// A Channel does not own its fd; whichever component created the fd closes
/// it. Interest toggles re-register with the loop's poller immediately, so
/// the kernel set matches the mask by the next poll.
pub struct Channel {
    fd: RawFd,
    lp: Weak<LoopCore>,
    self_ref: Weak<Channel>,
    events: Cell<EventSet>,
    revents: Cell<EventSet>,
    /// Pinned for the duration of handle_event so a callback dropping the
    /// owner's last external reference cannot free it mid-dispatch.
    owner: RefCell<Option<Weak<dyn Any>>>,
    event_cb: RefCell<Option<Callback>>,
    read_cb: RefCell<Option<Callback>>,
    write_cb: RefCell<Option<Callback>>,
    error_cb: RefCell<Option<Callback>>,
    close_cb: RefCell<Option<Callback>>,
}

impl Channel {
    pub fn new(fd: RawFd, lp: &EventLoop) -> Rc<Channel> {
        Self::with_core(fd, Rc::downgrade(lp.core()))
    }

    pub(crate) fn with_core(fd: RawFd, lp: Weak<LoopCore>) -> Rc<Channel> {
        Rc::new_cyclic(|me| Channel {
            fd,
            lp,
            self_ref: me.clone(),
            events: Cell::new(EventSet::NONE),
            revents: Cell::new(EventSet::NONE),
            owner: RefCell::new(None),
            event_cb: RefCell::new(None),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> EventSet {
        self.events.get()
    }

    pub fn revents(&self) -> EventSet {
        self.revents.get()
    }

    pub(crate) fn set_revents(&self, revents: EventSet) {
        self.revents.set(revents);
    }

    pub(crate) fn weak(&self) -> Weak<Channel> {
        self.self_ref.clone()
    }

    pub(crate) fn set_owner(&self, owner: Weak<dyn Any>) {
        *self.owner.borrow_mut() = Some(owner);
    }

    pub fn set_event_callback(&self, cb: impl Fn() + 'static) {
        *self.event_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_read_callback(&self, cb: impl Fn() + 'static) {
        *self.read_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + 'static) {
        *self.write_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + 'static) {
        *self.error_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + 'static) {
        *self.close_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn is_readable(&self) -> bool {
        self.events.get().contains(EventSet::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.events.get().contains(EventSet::WRITABLE)
    }

    pub fn enable_read(&self) {
        let mut events = self.events.get();
        events.insert(EventSet::READABLE);
        self.events.set(events);
        self.update();
    }

    pub fn disable_read(&self) {
        let mut events = self.events.get();
        events.remove(EventSet::READABLE);
        self.events.set(events);
        self.update();
    }

    pub fn enable_write(&self) {
        let mut events = self.events.get();
        events.insert(EventSet::WRITABLE);
        self.events.set(events);
        self.update();
    }

    pub fn disable_write(&self) {
        let mut events = self.events.get();
        events.remove(EventSet::WRITABLE);
        self.events.set(events);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.set(EventSet::NONE);
        self.update();
    }

    /// Drop the channel from the loop's poller.
    pub fn remove(&self) {
        if let Some(core) = self.lp.upgrade() {
            core.remove_channel(self.fd);
        }
    }

    fn update(&self) {
        if let Some(core) = self.lp.upgrade() {
            core.update_channel(self);
        }
    }

    /// Dispatch the last observed readiness to the callbacks.
    ///
    /// Order: the any-event hook first; then the read branch when data,
    /// urgent data, or a peer half-close is pending; then exactly one of
    /// error, write, or hangup. Reading before the close branches means a
    /// connection observing "peer closed" alongside new data consumes the
    /// final bytes before the close is reported.
    pub fn handle_event(&self) {
        let _pin: Option<Rc<dyn Any>> =
            self.owner.borrow().as_ref().and_then(|owner| owner.upgrade());

        let revents = self.revents.get();
        fire(&self.event_cb);
        if revents.intersects(READ_EVENTS) {
            fire(&self.read_cb);
        }
        if revents.intersects(EventSet::ERROR) {
            fire(&self.error_cb);
        } else if revents.intersects(EventSet::WRITABLE) {
            fire(&self.write_cb);
        } else if revents.intersects(EventSet::HANGUP) {
            fire(&self.close_cb);
        }
    }
}

fn fire(slot: &RefCell<Option<Callback>>) {
    // Clone out of the borrow so callbacks may replace themselves.
    let cb = slot.borrow().clone();
    if let Some(cb) = cb {
        cb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Weak as RcWeak;

    fn detached_channel() -> Rc<Channel> {
        // A dead loop handle: interest toggles are recorded locally but
        // never reach a poller.
        Channel::with_core(-1, RcWeak::new())
    }

    fn recording(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> impl Fn() + 'static {
        let log = log.clone();
        move || log.borrow_mut().push(tag)
    }

    #[test]
    fn interest_toggles() {
        let ch = detached_channel();
        assert!(!ch.is_readable());
        ch.enable_read();
        assert!(ch.is_readable());
        ch.enable_write();
        assert!(ch.is_writable());
        ch.disable_read();
        assert!(!ch.is_readable());
        assert!(ch.is_writable());
        ch.disable_all();
        assert!(ch.events().is_empty());
    }

    #[test]
    fn any_event_hook_runs_first_then_read() {
        let ch = detached_channel();
        let log = Rc::new(RefCell::new(Vec::new()));
        ch.set_event_callback(recording(&log, "any"));
        ch.set_read_callback(recording(&log, "read"));
        ch.set_write_callback(recording(&log, "write"));

        ch.set_revents(EventSet::READABLE | EventSet::WRITABLE);
        ch.handle_event();
        assert_eq!(*log.borrow(), ["any", "read", "write"]);
    }

    #[test]
    fn error_takes_priority_over_write_and_hangup() {
        let ch = detached_channel();
        let log = Rc::new(RefCell::new(Vec::new()));
        ch.set_write_callback(recording(&log, "write"));
        ch.set_error_callback(recording(&log, "error"));
        ch.set_close_callback(recording(&log, "close"));

        ch.set_revents(EventSet::ERROR | EventSet::WRITABLE | EventSet::HANGUP);
        ch.handle_event();
        assert_eq!(*log.borrow(), ["error"]);
    }

    #[test]
    fn hangup_fires_close_when_alone() {
        let ch = detached_channel();
        let log = Rc::new(RefCell::new(Vec::new()));
        ch.set_close_callback(recording(&log, "close"));

        ch.set_revents(EventSet::HANGUP);
        ch.handle_event();
        assert_eq!(*log.borrow(), ["close"]);
    }

    #[test]
    fn peer_close_routes_through_read() {
        let ch = detached_channel();
        let log = Rc::new(RefCell::new(Vec::new()));
        ch.set_read_callback(recording(&log, "read"));
        ch.set_close_callback(recording(&log, "close"));

        ch.set_revents(EventSet::PEER_CLOSED | EventSet::HANGUP);
        ch.handle_event();
        assert_eq!(*log.borrow(), ["read", "close"]);
    }

    #[test]
    fn owner_pinned_across_callbacks() {
        struct Owner;

        let ch = detached_channel();
        let owner: Rc<dyn Any> = Rc::new(Owner);
        let owner_weak: Weak<dyn Any> = Rc::downgrade(&owner);
        ch.set_owner(owner_weak);

        // The read callback drops the last external reference; the close
        // callback must still observe the owner alive via the dispatch pin.
        let slot = Rc::new(RefCell::new(Some(owner)));
        let observed = Rc::new(Cell::new(false));
        {
            let slot = slot.clone();
            ch.set_read_callback(move || {
                slot.borrow_mut().take();
            });
        }
        {
            let weak = ch.owner.borrow().as_ref().unwrap().clone();
            let observed = observed.clone();
            ch.set_close_callback(move || {
                observed.set(weak.upgrade().is_some());
            });
        }

        ch.set_revents(EventSet::READABLE | EventSet::HANGUP);
        ch.handle_event();
        assert!(observed.get());
        assert!(slot.borrow().is_none());
    }
}
