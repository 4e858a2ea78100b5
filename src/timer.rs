use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::error;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::event_loop::LoopCore;

/// Number of wheel buckets; the maximum representable timeout is one less.
pub(crate) const WHEEL_SLOTS: u64 = 60;

type TaskIndex = Rc<RefCell<AHashMap<u64, Weak<TimerTask>>>>;

/// One expiring entry. Strong references live only in wheel buckets; the
/// wheel's id index holds a weak reference. The task fires by virtue of its
/// destructor running while not canceled, which happens when the last
/// bucket holding it is cleared.
struct TimerTask {
    id: u64,
    timeout: u64,
    action: RefCell<Option<Box<dyn FnOnce()>>>,
    canceled: Cell<bool>,
    index: Weak<RefCell<AHashMap<u64, Weak<TimerTask>>>>,
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        if !self.canceled.get() {
            if let Some(action) = self.action.borrow_mut().take() {
                action();
            }
        }
        // Purge the id, but only while the index still points at this task:
        // the action (or an earlier cancel) may have re-registered the id.
        if let Some(index) = self.index.upgrade() {
            let mut index = index.borrow_mut();
            let stale = match index.get(&self.id) {
                Some(weak) => std::ptr::eq(weak.as_ptr(), self),
                None => false,
            };
            if stale {
                index.remove(&self.id);
            }
        }
    }
}

/// Hashed time wheel with one-second slots, driven by a monotonic timerfd
/// registered as an ordinary Channel on the owning loop.
///
/// All mutation happens on the loop thread; external callers reach the
/// wheel through the loop's `run_after` family, which routes through
/// `run_in_loop`.
pub(crate) struct TimerWheel {
    tick: Cell<usize>,
    buckets: RefCell<Vec<Vec<Rc<TimerTask>>>>,
    index: TaskIndex,
    timer_fd: OwnedFd,
    channel: Rc<Channel>,
}

impl TimerWheel {
    /// Create the armed timerfd. Fallible half of construction, split out so
    /// the loop core can assemble its cyclic references infallibly.
    pub(crate) fn create_timer_fd() -> Result<OwnedFd> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let timer_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 1,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 1,
                tv_nsec: 0,
            },
        };
        let ret = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(timer_fd)
    }

    pub(crate) fn assemble(timer_fd: OwnedFd, lp: Weak<LoopCore>) -> TimerWheel {
        let channel = Channel::with_core(timer_fd.as_raw_fd(), lp);
        TimerWheel {
            tick: Cell::new(0),
            buckets: RefCell::new((0..WHEEL_SLOTS).map(|_| Vec::new()).collect()),
            index: Rc::new(RefCell::new(AHashMap::new())),
            timer_fd,
            channel,
        }
    }

    pub(crate) fn channel(&self) -> &Rc<Channel> {
        &self.channel
    }

    /// Place a new task `timeout` ticks ahead of the cursor. The caller has
    /// validated `1 <= timeout < WHEEL_SLOTS`.
    pub(crate) fn add(&self, id: u64, timeout: u64, action: Box<dyn FnOnce()>) {
        let task = Rc::new(TimerTask {
            id,
            timeout,
            action: RefCell::new(Some(action)),
            canceled: Cell::new(false),
            index: Rc::downgrade(&self.index),
        });
        self.index.borrow_mut().insert(id, Rc::downgrade(&task));
        let slot = (self.tick.get() + timeout as usize) % WHEEL_SLOTS as usize;
        self.buckets.borrow_mut()[slot].push(task);
    }

    /// Clone the task's strong reference into a later bucket, extending its
    /// life by its original timeout. Keep-alive is exactly this: the task
    /// survives as long as at least one bucket slot still holds it.
    pub(crate) fn refresh(&self, id: u64) {
        let task = {
            let index = self.index.borrow();
            index.get(&id).and_then(|weak| weak.upgrade())
        };
        if let Some(task) = task {
            let slot = (self.tick.get() + task.timeout as usize) % WHEEL_SLOTS as usize;
            self.buckets.borrow_mut()[slot].push(task);
        }
    }

    /// Flag the task so its action is skipped; bucket slots drain it later.
    pub(crate) fn cancel(&self, id: u64) {
        let task = {
            let index = self.index.borrow();
            index.get(&id).and_then(|weak| weak.upgrade())
        };
        if let Some(task) = task {
            task.canceled.set(true);
        }
        self.index.borrow_mut().remove(&id);
    }

    pub(crate) fn has(&self, id: u64) -> bool {
        self.index.borrow().contains_key(&id)
    }

    /// Timer channel read callback: drain the expiration counter and advance
    /// the cursor once per elapsed second. A full revolution clears every
    /// bucket, so catching up is capped at one lap.
    pub(crate) fn on_timer(&self, core: &LoopCore) {
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(
                self.timer_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => return,
                _ => {
                    error!(error = %err, "timerfd read failed");
                    core.fail(Error::Io(err));
                    return;
                }
            }
        }
        if n != buf.len() as isize {
            error!(bytes = n, "short read from timerfd");
            core.fail(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from timerfd",
            )));
            return;
        }
        let expirations = u64::from_ne_bytes(buf);
        for _ in 0..expirations.min(WHEEL_SLOTS) {
            self.tick();
        }
    }

    fn tick(&self) {
        let next = (self.tick.get() + 1) % WHEEL_SLOTS as usize;
        self.tick.set(next);
        let expired = {
            let mut buckets = self.buckets.borrow_mut();
            std::mem::take(&mut buckets[next])
        };
        // Dropped outside the borrow: expiry actions may re-enter the wheel.
        drop(expired);
    }
}
